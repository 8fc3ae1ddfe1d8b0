//! The network engine
//!
//! A [`Node`] owns one radio, one store and one clock and is driven from a
//! single thread. [`Node::pump`] handles at most one received frame and
//! never blocks; every wait in the engine is a loop around it. Sends go
//! through [`Node::send_route`], which picks the next hop and keeps track
//! of how reliably the parent answers.

use crate::clock::{Clock, WakeToken};
use crate::config::{NodeConfig, Role};
use crate::discovery::improved_distance;
use crate::error::{HaltReason, NodeError};
use crate::failure_tracker::ParentFailureTracker;
use crate::gateway::IdAllocator;
use crate::handler::MessageHandler;
use crate::transport::{Pipe, Transport};
use radionet_routing::{
    decide_outbound, decide_relay, learnable, ChildRouteTable, DropReason, RouterStats,
    RoutingContext, RoutingDecision,
};
use radionet_storage::{BlockStore, ControllerSettings, NodeIdentity, NodeStorage, UNKNOWN_DISTANCE};
use radionet_wire::text::payload_text;
use radionet_wire::{
    presentation, Command, InternalType, Message, AUTO, BROADCAST_ADDRESS, GATEWAY_ADDRESS,
    LIBRARY_VERSION, NODE_CHILD_ID, PROTOCOL_VERSION,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

/// Longest single nap while sleeping, so a wake is noticed promptly
const SLEEP_SLICE_MS: u64 = 15;

/// Where a node is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// No node id yet
    Unidentified,
    /// Looking for a parent, or has an id but no parent
    SeekingParent,
    /// Has an id and a parent
    Operational,
    /// Stopped after a fatal error
    Halted,
}

/// A radio network node
pub struct Node<T, S, C> {
    config: NodeConfig,
    transport: T,
    storage: NodeStorage<S>,
    clock: C,
    handler: Box<dyn MessageHandler>,
    routes: ChildRouteTable,
    failures: ParentFailureTracker,
    ids: Option<IdAllocator>,
    stats: RouterStats,
    /// Working identity; may run ahead of the store during a parent search
    identity: NodeIdentity,
    rng: StdRng,
    halted: Option<HaltReason>,
    requesting_id: bool,
    searching: bool,
}

impl<T: Transport, S: BlockStore, C: Clock> Node<T, S, C> {
    /// Load persisted state and apply the static parts of `config`
    pub fn new(
        config: NodeConfig,
        mut transport: T,
        store: S,
        clock: C,
        handler: impl MessageHandler + 'static,
    ) -> Result<Self, NodeError> {
        let mut storage = NodeStorage::open(store)?;
        let routes = ChildRouteTable::load(storage.store())?;

        let mut identity = storage.identity();
        if config.role.is_gateway() {
            identity = NodeIdentity {
                node_id: GATEWAY_ADDRESS,
                parent_node_id: GATEWAY_ADDRESS,
                distance: 0,
            };
        } else {
            if let Some(node_id) = config.node_id {
                identity.node_id = node_id;
            }
            if let Some(parent) = config.parent_node_id {
                identity.parent_node_id = parent;
                if parent == GATEWAY_ADDRESS {
                    identity.distance = 1;
                } else if let Some(distance) = config.distance {
                    identity.distance = distance;
                }
            }
        }
        storage.save_identity(identity)?;

        let ids = if config.role.is_gateway() && config.assign_ids {
            Some(IdAllocator::load(&storage)?)
        } else {
            None
        };

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        transport.set_address(identity.node_id);
        debug!(
            "Loaded {} state: id={} parent={} distance={} routes={}",
            config.role,
            identity.node_id,
            identity.parent_node_id,
            identity.distance,
            routes.len()
        );

        Ok(Self {
            failures: ParentFailureTracker::new(config.search_failures),
            config,
            transport,
            storage,
            clock,
            handler: Box::new(handler),
            routes,
            ids,
            stats: RouterStats::default(),
            identity,
            rng,
            halted: None,
            requesting_id: false,
            searching: false,
        })
    }

    /// Join the network
    ///
    /// Finds a parent and asks for an id when needed, presents the node to
    /// the gateway and pumps for the controller's configuration reply.
    pub fn begin(&mut self) -> Result<(), NodeError> {
        self.check_halted()?;
        if self.is_gateway() {
            info!("Gateway started");
            return Ok(());
        }

        if self.auto_parent() && self.identity.parent_node_id == AUTO {
            self.find_parent()?;
        }
        if self.identity.node_id == AUTO {
            self.request_node_id()?;
        }
        info!("{} started, id {}", self.config.role, self.identity.node_id);

        let kind = if self.role().is_repeater() {
            presentation::REPEATER_NODE
        } else {
            presentation::NODE
        };
        self.present(NODE_CHILD_ID, kind, false)?;

        let request = Message::internal(InternalType::Config, self.identity.node_id, GATEWAY_ADDRESS)
            .with_payload(self.identity.parent_node_id);
        self.send_route(request)?;

        self.wait(self.config.reply_timeout_ms)
    }

    /// Handle at most one waiting frame
    ///
    /// Returns true when a message was delivered to the application.
    pub fn pump(&mut self) -> Result<bool, NodeError> {
        self.check_halted()?;
        let Some((pipe, frame)) = self.transport.receive() else {
            return Ok(false);
        };

        let msg = match Message::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping frame: {}", NodeError::MalformedFrame(e));
                self.stats.record_drop(DropReason::Malformed);
                return Ok(false);
            }
        };
        if msg.version != PROTOCOL_VERSION {
            warn!("Dropping frame from {}: {}", msg.last, NodeError::ProtocolVersionMismatch(msg.version));
            self.stats.record_drop(DropReason::VersionMismatch);
            return Ok(false);
        }

        debug!(
            "read: {}-{}-{} s={},c={},t={},pt={},l={}:{}",
            msg.sender,
            msg.last,
            msg.destination,
            msg.child_id,
            msg.command as u8,
            msg.msg_type,
            msg.payload.payload_type() as u8,
            msg.payload.encoded_len(),
            payload_text(&msg)
        );

        if self.role().is_repeater() && msg.is_internal(InternalType::FindParent) {
            self.answer_parent_search(&msg)?;
            return Ok(false);
        }

        if msg.destination == self.identity.node_id {
            return self.handle_local(msg);
        }

        if self.role().is_repeater() {
            self.relay(msg, pipe)?;
        }
        Ok(false)
    }

    /// Pump for `ms` milliseconds
    pub fn wait(&mut self, ms: u64) -> Result<(), NodeError> {
        let start = self.clock.now_ms();
        while self.clock.now_ms().saturating_sub(start) < ms {
            if !self.pump()? {
                self.clock.delay_ms(1);
            }
        }
        Ok(())
    }

    /// Broadcast a parent search and collect answers for the reply window
    ///
    /// Returns whether any neighbour was adopted.
    pub fn find_parent(&mut self) -> Result<bool, NodeError> {
        self.check_halted()?;
        if self.is_gateway() || self.searching {
            return Ok(false);
        }

        self.searching = true;
        self.failures.reset();
        self.identity.distance = UNKNOWN_DISTANCE;
        info!("Searching for parent");

        let search = Message::internal(InternalType::FindParent, self.identity.node_id, BROADCAST_ADDRESS);
        let result = match self.transmit(BROADCAST_ADDRESS, search) {
            Ok(()) | Err(NodeError::TransmissionFailure(_)) => self.wait(self.config.reply_timeout_ms),
            Err(e) => Err(e),
        };
        self.searching = false;
        result?;

        let found = self.identity.distance != UNKNOWN_DISTANCE;
        if !found {
            warn!("No parent answered");
        }
        Ok(found)
    }

    /// Ask the gateway for a node id and pump for the answer
    ///
    /// Returns whether the node has an id afterwards.
    pub fn request_node_id(&mut self) -> Result<bool, NodeError> {
        self.check_halted()?;
        if self.is_gateway() || self.requesting_id {
            return Ok(self.identity.node_id != AUTO);
        }

        self.requesting_id = true;
        info!("Requesting node id");
        let request = Message::internal(InternalType::IdRequest, self.identity.node_id, GATEWAY_ADDRESS);
        let result = match self.send_route(request) {
            Ok(_) => self.wait(self.config.reply_timeout_ms),
            Err(e) => Err(e),
        };
        self.requesting_id = false;
        result?;

        Ok(self.identity.node_id != AUTO)
    }

    /// Send a message toward its destination
    ///
    /// Returns whether the first hop accepted it.
    pub fn send_route(&mut self, msg: Message) -> Result<bool, NodeError> {
        self.check_halted()?;
        let ctx = self.routing_context();

        match decide_outbound(&ctx, &self.routes, &msg) {
            RoutingDecision::Drop(DropReason::Unassigned) => {
                debug!("No node id yet, dropping message to {}", msg.destination);
                self.stats.record_drop(DropReason::Unassigned);
                self.request_node_id()?;
                Ok(false)
            }
            RoutingDecision::Drop(reason) => {
                debug!("Dropping message to {}: {}", msg.destination, reason);
                self.stats.record_drop(reason);
                Ok(false)
            }
            RoutingDecision::Forward(hop) => self.originate(hop, msg),
            RoutingDecision::Broadcast => self.originate(BROADCAST_ADDRESS, msg),
            RoutingDecision::Parent(parent) => {
                let sent = self.originate(parent, msg)?;
                if sent {
                    self.failures.record_success();
                } else if self.failures.record_failure(parent) && self.auto_parent() {
                    self.rediscover()?;
                }
                Ok(sent)
            }
        }
    }

    /// Send an application value as SET from this node
    pub fn send(&mut self, mut msg: Message, request_ack: bool) -> Result<bool, NodeError> {
        msg.sender = self.identity.node_id;
        msg.command = Command::Set;
        self.send_route(msg.with_request_ack(request_ack))
    }

    /// Present a child sensor to the controller
    pub fn present(&mut self, child_id: u8, sensor_type: u8, request_ack: bool) -> Result<bool, NodeError> {
        let msg = Message::new(Command::Presentation, sensor_type, self.identity.node_id, GATEWAY_ADDRESS)
            .with_child(child_id)
            .with_payload(LIBRARY_VERSION)
            .with_request_ack(request_ack);
        self.send_route(msg)
    }

    /// Report the battery level in percent
    pub fn send_battery_level(&mut self, level: u8, request_ack: bool) -> Result<bool, NodeError> {
        let msg = Message::internal(InternalType::BatteryLevel, self.identity.node_id, GATEWAY_ADDRESS)
            .with_payload(level)
            .with_request_ack(request_ack);
        self.send_route(msg)
    }

    /// Report sketch name and version; either may be left out
    pub fn send_sketch_info(
        &mut self,
        name: Option<&str>,
        version: Option<&str>,
        request_ack: bool,
    ) -> Result<bool, NodeError> {
        let mut sent = true;
        for (typ, value) in [(InternalType::SketchName, name), (InternalType::SketchVersion, version)] {
            if let Some(value) = value {
                let msg = Message::internal(typ, self.identity.node_id, GATEWAY_ADDRESS)
                    .with_payload(value)
                    .with_request_ack(request_ack);
                sent &= self.send_route(msg)?;
            }
        }
        Ok(sent)
    }

    /// Ask `destination` for the current value of a variable
    pub fn request(&mut self, child_id: u8, variable_type: u8, destination: u8) -> Result<bool, NodeError> {
        let msg = Message::new(Command::Request, variable_type, self.identity.node_id, destination)
            .with_child(child_id);
        self.send_route(msg)
    }

    /// Ask the controller for the time; the answer arrives at
    /// [`MessageHandler::on_time`]
    pub fn request_time(&mut self) -> Result<bool, NodeError> {
        let msg = Message::internal(InternalType::Time, self.identity.node_id, GATEWAY_ADDRESS);
        self.send_route(msg)
    }

    /// Store an application byte. Returns whether it changed.
    pub fn save_state(&mut self, pos: u8, value: u8) -> Result<bool, NodeError> {
        Ok(self.storage.save_local(pos, value)?)
    }

    /// Read an application byte
    pub fn load_state(&self, pos: u8) -> Result<u8, NodeError> {
        Ok(self.storage.load_local(pos)?)
    }

    /// Power the radio down for `ms` milliseconds or until `wake` fires
    ///
    /// Returns true when woken early.
    pub fn sleep(&mut self, ms: u64, wake: &WakeToken) -> Result<bool, NodeError> {
        self.check_halted()?;
        self.transport.power_down();

        let start = self.clock.now_ms();
        let mut woken = false;
        loop {
            if wake.take() {
                woken = true;
                break;
            }
            let elapsed = self.clock.now_ms().saturating_sub(start);
            if elapsed >= ms {
                break;
            }
            self.clock.delay_ms((ms - elapsed).min(SLEEP_SLICE_MS));
        }

        self.transport.power_up();
        trace!("Slept {} ms, woken={}", self.clock.now_ms().saturating_sub(start), woken);
        Ok(woken)
    }

    /// Own address
    pub fn node_id(&self) -> u8 {
        self.identity.node_id
    }

    /// Current parent
    pub fn parent_node_id(&self) -> u8 {
        self.identity.parent_node_id
    }

    /// Hops to the gateway
    pub fn distance(&self) -> u8 {
        self.identity.distance
    }

    /// Settings last received from the controller
    pub fn controller_settings(&self) -> ControllerSettings {
        self.storage.settings()
    }

    /// Lifecycle state
    pub fn state(&self) -> NodeState {
        if self.halted.is_some() {
            NodeState::Halted
        } else if self.searching {
            NodeState::SeekingParent
        } else if self.identity.node_id == AUTO {
            NodeState::Unidentified
        } else if self.identity.parent_node_id == AUTO {
            NodeState::SeekingParent
        } else {
            NodeState::Operational
        }
    }

    /// Routing counters
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Learned child routes
    pub fn routes(&self) -> &ChildRouteTable {
        &self.routes
    }

    /// Node role
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Persisted state
    pub fn storage(&self) -> &NodeStorage<S> {
        &self.storage
    }

    /// Radio
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Radio, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn is_gateway(&self) -> bool {
        self.config.role.is_gateway()
    }

    fn auto_parent(&self) -> bool {
        self.config.parent_node_id.is_none() && !self.is_gateway()
    }

    fn routing_context(&self) -> RoutingContext {
        RoutingContext {
            node_id: self.identity.node_id,
            parent: self.identity.parent_node_id,
            repeater: self.role().is_repeater(),
            gateway: self.is_gateway(),
        }
    }

    fn check_halted(&self) -> Result<(), NodeError> {
        match self.halted {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    fn halt(&mut self, reason: HaltReason) -> NodeError {
        let err = NodeError::from(reason);
        error!("Node {} halted: {}", self.identity.node_id, err);
        self.halted = Some(reason);
        err
    }

    fn persist_identity(&mut self) -> Result<(), NodeError> {
        self.storage.save_identity(self.identity)?;
        Ok(())
    }

    /// Stamp, encode and put a frame on the radio
    fn transmit(&mut self, next_hop: u8, mut msg: Message) -> Result<(), NodeError> {
        msg.last = self.identity.node_id;
        msg.version = PROTOCOL_VERSION;
        let frame = msg.encode()?;

        self.transport.power_up();
        let ok = self.transport.send(next_hop, &frame, next_hop == BROADCAST_ADDRESS);

        debug!(
            "send: {}-{}-{}-{} s={},c={},t={},pt={},l={},st={}:{}",
            msg.sender,
            msg.last,
            next_hop,
            msg.destination,
            msg.child_id,
            msg.command as u8,
            msg.msg_type,
            msg.payload.payload_type() as u8,
            msg.payload.encoded_len(),
            if ok { "ok" } else { "fail" },
            payload_text(&msg)
        );

        if ok {
            Ok(())
        } else {
            self.stats.send_failures += 1;
            Err(NodeError::TransmissionFailure(next_hop))
        }
    }

    /// Transmit a frame this node is responsible for
    fn originate(&mut self, next_hop: u8, msg: Message) -> Result<bool, NodeError> {
        match self.transmit(next_hop, msg) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                Ok(true)
            }
            Err(NodeError::TransmissionFailure(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Transmit a frame on behalf of another node
    fn forward(&mut self, next_hop: u8, msg: Message) -> Result<(), NodeError> {
        match self.transmit(next_hop, msg) {
            Ok(()) => {
                self.stats.frames_forwarded += 1;
                Ok(())
            }
            Err(NodeError::TransmissionFailure(hop)) => {
                debug!("Relay to {} failed", hop);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Search again after the parent stopped answering, keeping the old
    /// parent if nobody answers
    fn rediscover(&mut self) -> Result<(), NodeError> {
        let previous = self.identity;
        if !self.find_parent()? {
            self.identity.parent_node_id = previous.parent_node_id;
            self.identity.distance = previous.distance;
            info!(
                "Keeping parent {} at distance {}",
                previous.parent_node_id, previous.distance
            );
        }
        Ok(())
    }

    fn answer_parent_search(&mut self, msg: &Message) -> Result<(), NodeError> {
        let own_parent = !self.is_gateway() && msg.sender == self.identity.parent_node_id;
        if self.searching
            || self.identity.node_id == AUTO
            || self.identity.distance == UNKNOWN_DISTANCE
            || own_parent
        {
            trace!("Not answering parent search from {}", msg.sender);
            return Ok(());
        }

        let jitter = match self.config.jitter_max_ms {
            0 => 0,
            max => self.rng.gen_range(0..=max),
        };
        self.clock.delay_ms(jitter);

        let offer = Message::internal(InternalType::FindParentResponse, self.identity.node_id, msg.sender)
            .with_payload(self.identity.distance);
        self.originate(msg.sender, offer)?;
        Ok(())
    }

    fn handle_local(&mut self, msg: Message) -> Result<bool, NodeError> {
        let ctx = self.routing_context();
        if learnable(&ctx, &msg) {
            self.learn_route(msg.sender, msg.last)?;
        }

        if msg.request_ack() {
            let ack = msg.ack(self.identity.node_id);
            self.send_route(ack)?;
        }

        if msg.command == Command::Internal && self.handle_internal(&msg)? {
            return Ok(false);
        }

        self.stats.frames_local += 1;
        self.handler.on_message(&msg);
        Ok(true)
    }

    /// Returns true when the message was consumed by the engine
    fn handle_internal(&mut self, msg: &Message) -> Result<bool, NodeError> {
        let kind = msg.internal_type();

        // The gateway's application is the controller, which sees
        // everything the gateway does not answer itself.
        if self.is_gateway() {
            return match kind {
                Some(InternalType::FindParentResponse) => Ok(true),
                Some(InternalType::IdRequest) if self.ids.is_some() => {
                    self.assign_id(msg)?;
                    Ok(true)
                }
                _ => Ok(false),
            };
        }

        match kind {
            Some(InternalType::FindParentResponse) => self.offer_parent(msg.sender, msg.payload.as_u8())?,
            _ if msg.sender != GATEWAY_ADDRESS => {}
            Some(InternalType::Reboot) => return Err(self.halt(HaltReason::RebootRequested)),
            Some(InternalType::IdResponse) => self.adopt_id(msg.payload.as_u8())?,
            Some(InternalType::Config) => {
                let is_metric = first_byte(msg) == Some(b'M');
                if self.storage.save_settings(ControllerSettings { is_metric })? {
                    info!("Controller units: {}", if is_metric { "metric" } else { "imperial" });
                }
            }
            Some(InternalType::Children) => {
                if self.role().is_repeater() && first_byte(msg) == Some(b'C') {
                    self.routes.clear_all(self.storage.store_mut())?;
                    let done = Message::internal(InternalType::Children, self.identity.node_id, GATEWAY_ADDRESS)
                        .with_payload("");
                    self.send_route(done)?;
                }
            }
            Some(InternalType::Time) => self.handler.on_time(msg.payload.as_u32()),
            _ => {}
        }
        Ok(true)
    }

    fn offer_parent(&mut self, sender: u8, offered: u8) -> Result<(), NodeError> {
        if !self.auto_parent() {
            return Ok(());
        }
        if let Some(distance) = improved_distance(self.identity.distance, offered) {
            self.identity.parent_node_id = sender;
            self.identity.distance = distance;
            self.persist_identity()?;
            info!("New parent {} at distance {}", sender, distance);
        }
        Ok(())
    }

    fn adopt_id(&mut self, node_id: u8) -> Result<(), NodeError> {
        if self.identity.node_id != AUTO {
            return Ok(());
        }
        if node_id == AUTO {
            return Err(self.halt(HaltReason::AddressSpaceExhausted));
        }
        self.identity.node_id = node_id;
        self.persist_identity()?;
        self.transport.set_address(node_id);
        info!("Assigned node id {}", node_id);
        Ok(())
    }

    fn assign_id(&mut self, request: &Message) -> Result<(), NodeError> {
        let Some(ids) = self.ids.as_mut() else {
            return Ok(());
        };
        let node_id = ids.allocate(&mut self.storage)?;
        let reply = Message::internal(InternalType::IdResponse, GATEWAY_ADDRESS, BROADCAST_ADDRESS)
            .with_child(request.child_id)
            .with_payload(node_id);
        self.send_route(reply)?;
        Ok(())
    }

    fn learn_route(&mut self, address: u8, next_hop: u8) -> Result<(), NodeError> {
        if self.routes.insert(self.storage.store_mut(), address, next_hop)? {
            self.stats.routes_learned += 1;
        }
        Ok(())
    }

    fn relay(&mut self, msg: Message, pipe: Pipe) -> Result<(), NodeError> {
        let ctx = self.routing_context();
        match decide_relay(&ctx, &self.routes, &msg, pipe == Pipe::Broadcast) {
            RoutingDecision::Forward(hop) => self.forward(hop, msg),
            RoutingDecision::Broadcast => self.forward(BROADCAST_ADDRESS, msg),
            RoutingDecision::Parent(parent) => {
                let learn = learnable(&ctx, &msg).then_some((msg.sender, msg.last));
                self.forward(parent, msg)?;
                if let Some((address, next_hop)) = learn {
                    self.learn_route(address, next_hop)?;
                }
                Ok(())
            }
            RoutingDecision::Drop(reason) => {
                trace!("Not relaying frame for {}: {}", msg.destination, reason);
                self.stats.record_drop(reason);
                Ok(())
            }
        }
    }
}

fn first_byte(msg: &Message) -> Option<u8> {
    msg.payload.as_bytes().and_then(|b| b.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAir, SimClock, SimRadio};
    use radionet_storage::MemoryStore;
    use std::sync::{Arc, Mutex};

    type SimNode = Node<SimRadio, MemoryStore, SimClock>;
    type Inbox = Arc<Mutex<Vec<Message>>>;

    fn sim_node(air: &SimAir, clock: &SimClock, config: NodeConfig) -> (SimNode, Inbox) {
        let inbox: Inbox = Arc::default();
        let sink = inbox.clone();
        let config = NodeConfig {
            rng_seed: Some(7),
            ..config
        };
        let node = Node::new(
            config,
            air.radio(AUTO),
            MemoryStore::new(),
            clock.clone(),
            move |msg: &Message| sink.lock().unwrap().push(msg.clone()),
        )
        .unwrap();
        (node, inbox)
    }

    fn sensor(node_id: Option<u8>, parent: Option<u8>) -> NodeConfig {
        NodeConfig {
            node_id,
            parent_node_id: parent,
            ..NodeConfig::for_role(Role::Sensor)
        }
    }

    fn repeater(node_id: u8, parent: u8) -> NodeConfig {
        NodeConfig {
            node_id: Some(node_id),
            parent_node_id: Some(parent),
            ..NodeConfig::for_role(Role::Repeater)
        }
    }

    /// Fake gateway answering parent searches and id requests
    fn fake_gateway(air: &SimAir, assigned: u8) -> usize {
        air.scripted(
            GATEWAY_ADDRESS,
            Box::new(move |msg: &Message| match msg.internal_type() {
                Some(InternalType::FindParent) => {
                    vec![Message::internal(InternalType::FindParentResponse, 0, msg.sender).with_payload(0u8)]
                }
                Some(InternalType::IdRequest) => {
                    vec![Message::internal(InternalType::IdResponse, 0, BROADCAST_ADDRESS).with_payload(assigned)]
                }
                Some(InternalType::Config) => {
                    vec![Message::internal(InternalType::Config, 0, msg.sender).with_payload("I")]
                }
                _ => Vec::new(),
            }),
        )
    }

    fn sent_by(air: &SimAir, station: usize) -> Vec<Message> {
        air.history()
            .iter()
            .filter(|t| t.station == station)
            .filter_map(|t| t.message())
            .collect()
    }

    fn inject(air: &SimAir, node: &SimNode, pipe: Pipe, msg: &Message) {
        air.inject(node.transport().station(), pipe, &msg.encode().unwrap());
    }

    #[test]
    fn test_boot_finds_parent_then_id_then_presents() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(None, None));
        let gw = fake_gateway(&air, 7);
        air.link(node.transport().station(), gw);

        assert_eq!(node.state(), NodeState::Unidentified);
        node.begin().unwrap();

        assert_eq!(node.node_id(), 7);
        assert_eq!(node.parent_node_id(), 0);
        assert_eq!(node.distance(), 1);
        assert_eq!(node.state(), NodeState::Operational);
        assert!(!node.controller_settings().is_metric);

        let sent = sent_by(&air, node.transport().station());
        assert!(sent[0].is_internal(InternalType::FindParent));
        assert_eq!(sent[0].destination, BROADCAST_ADDRESS);
        assert!(sent[1].is_internal(InternalType::IdRequest));
        assert_eq!(sent[2].command, Command::Presentation);
        assert_eq!(sent[2].msg_type, presentation::NODE);
        assert_eq!(sent[2].sender, 7);
        assert_eq!(sent[2].payload.as_str(), Some(LIBRARY_VERSION));
        assert!(sent[3].is_internal(InternalType::Config));

        let persisted = node.storage().identity();
        assert_eq!((persisted.node_id, persisted.parent_node_id, persisted.distance), (7, 0, 1));
    }

    #[test]
    fn test_parent_selection_keeps_first_best() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(20), None));

        for (address, distance) in [(10u8, 5u8), (11, 3), (12, 3), (13, 4)] {
            let station = air.scripted(
                address,
                Box::new(move |msg: &Message| {
                    if msg.is_internal(InternalType::FindParent) {
                        vec![Message::internal(InternalType::FindParentResponse, address, msg.sender)
                            .with_payload(distance)]
                    } else {
                        Vec::new()
                    }
                }),
            );
            air.link(node.transport().station(), station);
        }

        assert!(node.find_parent().unwrap());
        assert_eq!(node.parent_node_id(), 11);
        assert_eq!(node.distance(), 4);
        assert_eq!(node.storage().identity().parent_node_id, 11);
        assert!(node.routes().is_empty());
    }

    #[test]
    fn test_repeater_relays_up_and_down() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, repeater(4, 0));
        let gw = fake_gateway(&air, 0);
        let child = air.radio(9);
        air.link(node.transport().station(), gw);
        air.link(node.transport().station(), child.station());

        let mut up = Message::new(Command::Set, 2, 12, GATEWAY_ADDRESS).with_payload(21u8);
        up.last = 9;
        inject(&air, &node, Pipe::Node, &up);
        assert!(!node.pump().unwrap());

        let last = air.history().pop().unwrap();
        assert_eq!(last.next_hop, 0);
        let relayed = last.message().unwrap();
        assert_eq!((relayed.sender, relayed.last), (12, 4));
        assert_eq!(node.routes().lookup(12), Some(9));

        let down = Message::new(Command::Set, 2, GATEWAY_ADDRESS, 12);
        inject(&air, &node, Pipe::Node, &down);
        node.pump().unwrap();
        assert_eq!(air.history().pop().unwrap().next_hop, 9);
        assert_eq!(air.pending(child.station()), 1);

        assert_eq!(node.stats().frames_forwarded, 2);
        assert!(inbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sensor_ignores_foreign_frames() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, sensor(Some(5), Some(0)));
        let gw = fake_gateway(&air, 0);
        air.link(node.transport().station(), gw);

        let other = Message::new(Command::Set, 2, GATEWAY_ADDRESS, 12);
        inject(&air, &node, Pipe::Node, &other);
        assert!(!node.pump().unwrap());
        assert!(air.history().is_empty());
        assert!(inbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ack_mirrors_request() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, sensor(Some(5), Some(0)));
        let gw = fake_gateway(&air, 0);
        air.link(node.transport().station(), gw);

        let msg = Message::new(Command::Set, 2, GATEWAY_ADDRESS, 5)
            .with_child(3)
            .with_payload(1u8)
            .with_request_ack(true);
        inject(&air, &node, Pipe::Node, &msg);
        assert!(node.pump().unwrap());

        let ack = air.history().pop().unwrap().message().unwrap();
        assert!(ack.is_ack());
        assert!(!ack.request_ack());
        assert_eq!((ack.sender, ack.destination), (5, 0));
        assert_eq!((ack.child_id, ack.msg_type), (3, 2));
        assert_eq!(ack.payload, msg.payload);

        assert_eq!(inbox.lock().unwrap().len(), 1);
        assert_eq!(node.stats().frames_local, 1);
    }

    #[test]
    fn test_repeated_parent_failures_trigger_search() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), None));
        let gw = fake_gateway(&air, 0);
        let station = node.transport().station();
        air.link(station, gw);
        assert!(node.find_parent().unwrap());
        air.clear_history();

        air.fail_next_sends(station, 6);
        for _ in 0..6 {
            assert!(!node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap());
        }

        let sent = sent_by(&air, station);
        assert_eq!(sent.len(), 7);
        assert!(sent[..6].iter().all(|m| m.command == Command::Set));
        assert!(sent[6].is_internal(InternalType::FindParent));
        assert_eq!((node.parent_node_id(), node.distance()), (0, 1));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), None));
        let gw = fake_gateway(&air, 0);
        let station = node.transport().station();
        air.link(station, gw);
        node.find_parent().unwrap();
        air.clear_history();

        air.fail_next_sends(station, 5);
        for _ in 0..5 {
            node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap();
        }
        assert!(node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap());
        air.fail_next_sends(station, 5);
        for _ in 0..5 {
            node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap();
        }

        assert!(sent_by(&air, station)
            .iter()
            .all(|m| !m.is_internal(InternalType::FindParent)));
    }

    #[test]
    fn test_rediscovery_keeps_parent_when_nobody_answers() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), None));
        let gw = fake_gateway(&air, 0);
        let station = node.transport().station();
        air.link(station, gw);
        node.find_parent().unwrap();

        air.set_link(station, gw, false);
        for _ in 0..6 {
            node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap();
        }
        assert_eq!((node.parent_node_id(), node.distance()), (0, 1));
        assert_eq!(node.state(), NodeState::Operational);
    }

    #[test]
    fn test_static_parent_never_searches() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), Some(0)));
        let station = node.transport().station();

        for _ in 0..10 {
            node.send(Message::new(Command::Set, 0, 5, 0), false).unwrap();
        }
        assert!(sent_by(&air, station)
            .iter()
            .all(|m| !m.is_internal(InternalType::FindParent)));
    }

    #[test]
    fn test_version_mismatch_and_garbage_dropped() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, sensor(Some(5), Some(0)));

        let mut frame = Message::new(Command::Set, 2, 0, 5)
            .with_request_ack(true)
            .encode()
            .unwrap();
        frame[3] = (frame[3] & !0x07) | 1;
        air.inject(node.transport().station(), Pipe::Node, &frame);
        air.inject(node.transport().station(), Pipe::Node, &[1, 2, 3]);

        assert!(!node.pump().unwrap());
        assert!(!node.pump().unwrap());
        assert!(air.history().is_empty());
        assert!(inbox.lock().unwrap().is_empty());
        assert_eq!(node.stats().drop_reasons.get("protocol version mismatch"), Some(&1));
        assert_eq!(node.stats().drop_reasons.get("malformed frame"), Some(&1));
    }

    #[test]
    fn test_reboot_halts() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), Some(0)));

        inject(&air, &node, Pipe::Node, &Message::internal(InternalType::Reboot, 0, 5));
        assert!(matches!(node.pump(), Err(NodeError::RebootRequested)));
        assert_eq!(node.state(), NodeState::Halted);
        assert!(matches!(node.pump(), Err(NodeError::RebootRequested)));
        assert!(node.send(Message::new(Command::Set, 0, 5, 0), false).is_err());
    }

    #[test]
    fn test_exhausted_address_space_halts() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(None, Some(0)));
        let gw = fake_gateway(&air, AUTO);
        air.link(node.transport().station(), gw);

        assert!(matches!(node.request_node_id(), Err(NodeError::AddressSpaceExhausted)));
        assert_eq!(node.state(), NodeState::Halted);
    }

    #[test]
    fn test_unassigned_send_requests_id() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(None, Some(0)));
        let gw = fake_gateway(&air, 9);
        air.link(node.transport().station(), gw);

        assert!(!node.send(Message::new(Command::Set, 0, AUTO, 0), false).unwrap());
        assert_eq!(node.node_id(), 9);
        let sent = sent_by(&air, node.transport().station());
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_internal(InternalType::IdRequest));
    }

    #[test]
    fn test_controller_config_and_children() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, repeater(4, 0));
        let gw = fake_gateway(&air, 0);
        air.link(node.transport().station(), gw);

        let mut child = Message::new(Command::Set, 0, 12, 4);
        child.last = 9;
        inject(&air, &node, Pipe::Node, &child);
        node.pump().unwrap();
        assert_eq!(node.routes().lookup(12), Some(9));

        let config = Message::internal(InternalType::Config, 0, 4).with_payload("I");
        inject(&air, &node, Pipe::Node, &config);
        assert!(!node.pump().unwrap());
        assert!(!node.controller_settings().is_metric);
        assert!(!node.storage().settings().is_metric);

        let clear = Message::internal(InternalType::Children, 0, 4).with_payload("C");
        inject(&air, &node, Pipe::Node, &clear);
        node.pump().unwrap();
        assert!(node.routes().is_empty());
        let done = air.history().pop().unwrap().message().unwrap();
        assert!(done.is_internal(InternalType::Children));
        assert_eq!(done.destination, GATEWAY_ADDRESS);

        // Only the plain SET reached the application
        assert_eq!(inbox.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_time_reaches_handler() {
        struct Clocked(Arc<Mutex<Option<u32>>>);
        impl MessageHandler for Clocked {
            fn on_message(&mut self, _msg: &Message) {}
            fn on_time(&mut self, seconds: u32) {
                *self.0.lock().unwrap() = Some(seconds);
            }
        }

        let air = SimAir::new();
        let seen = Arc::new(Mutex::new(None));
        let mut node = Node::new(
            sensor(Some(5), Some(0)),
            air.radio(AUTO),
            MemoryStore::new(),
            SimClock::new(),
            Clocked(seen.clone()),
        )
        .unwrap();

        let time = Message::internal(InternalType::Time, 0, 5).with_payload(1_700_000_000u32);
        inject(&air, &node, Pipe::Node, &time);
        node.pump().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(1_700_000_000));
    }

    #[test]
    fn test_repeater_answers_parent_search() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, repeater(4, 0));
        let seeker = air.radio(AUTO);
        air.link(node.transport().station(), seeker.station());

        let search = Message::internal(InternalType::FindParent, AUTO, BROADCAST_ADDRESS);
        inject(&air, &node, Pipe::Broadcast, &search);
        assert!(!node.pump().unwrap());
        assert!(clock.now_ms() <= 1023);

        let offer = air.history().pop().unwrap();
        assert_eq!(offer.next_hop, BROADCAST_ADDRESS);
        let offer = offer.message().unwrap();
        assert!(offer.is_internal(InternalType::FindParentResponse));
        assert_eq!(offer.payload.as_u8(), 1);
        assert_eq!(air.pending(seeker.station()), 1);

        // Searches from our own parent go unanswered
        air.clear_history();
        let from_parent = Message::internal(InternalType::FindParent, 0, BROADCAST_ADDRESS);
        inject(&air, &node, Pipe::Broadcast, &from_parent);
        node.pump().unwrap();
        assert!(air.history().is_empty());
    }

    #[test]
    fn test_static_parent_distance_lets_repeater_answer() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, repeater(4, 3));
        assert_eq!(node.distance(), UNKNOWN_DISTANCE);

        let search = Message::internal(InternalType::FindParent, AUTO, BROADCAST_ADDRESS);
        inject(&air, &node, Pipe::Broadcast, &search);
        node.pump().unwrap();
        assert!(air.history().is_empty());

        let config = NodeConfig {
            distance: Some(2),
            ..repeater(6, 3)
        };
        let (mut node, _) = sim_node(&air, &clock, config);
        assert_eq!((node.parent_node_id(), node.distance()), (3, 2));

        inject(&air, &node, Pipe::Broadcast, &search);
        node.pump().unwrap();
        let offer = air.history().pop().unwrap().message().unwrap();
        assert!(offer.is_internal(InternalType::FindParentResponse));
        assert_eq!((offer.sender, offer.payload.as_u8()), (6, 2));
    }

    #[test]
    fn test_assigned_node_ignores_id_response() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, sensor(Some(5), Some(0)));

        let direct = Message::internal(InternalType::IdResponse, GATEWAY_ADDRESS, 5).with_payload(9u8);
        inject(&air, &node, Pipe::Node, &direct);
        assert!(!node.pump().unwrap());

        let broadcast =
            Message::internal(InternalType::IdResponse, GATEWAY_ADDRESS, BROADCAST_ADDRESS).with_payload(9u8);
        inject(&air, &node, Pipe::Broadcast, &broadcast);
        assert!(!node.pump().unwrap());

        assert_eq!(node.node_id(), 5);
        assert_eq!(node.storage().identity().node_id, 5);
        assert!(inbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_control_from_non_gateway_is_consumed() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, inbox) = sim_node(&air, &clock, sensor(Some(5), Some(0)));

        let reboot = Message::internal(InternalType::Reboot, 9, 5);
        inject(&air, &node, Pipe::Node, &reboot);
        assert!(!node.pump().unwrap());
        assert_eq!(node.state(), NodeState::Operational);

        let config = Message::internal(InternalType::Config, 9, 5).with_payload("I");
        inject(&air, &node, Pipe::Node, &config);
        assert!(!node.pump().unwrap());
        assert!(node.controller_settings().is_metric);

        assert!(inbox.lock().unwrap().is_empty());
        assert!(node.send(Message::new(Command::Set, 0, 5, 0), false).is_ok());
    }

    #[test]
    fn test_frame_from_parent_without_route_is_dropped() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut gw, _) = sim_node(&air, &clock, NodeConfig::for_role(Role::Gateway));
        let (mut rep, _) = sim_node(&air, &clock, repeater(4, 0));
        air.link(gw.transport().station(), rep.transport().station());

        // Gateway learns 12 -> 4; the repeater has no route for 12
        let mut up = Message::new(Command::Set, 0, 12, GATEWAY_ADDRESS);
        up.last = 4;
        inject(&air, &gw, Pipe::Node, &up);
        gw.pump().unwrap();
        assert_eq!(gw.routes().lookup(12), Some(4));
        assert_eq!(rep.routes().lookup(12), None);

        assert!(gw.send_route(Message::new(Command::Set, 0, GATEWAY_ADDRESS, 12)).unwrap());
        for _ in 0..10 {
            rep.pump().unwrap();
            gw.pump().unwrap();
        }

        assert_eq!(air.history().len(), 1);
        assert_eq!(rep.stats().frames_forwarded, 0);
        assert_eq!(rep.stats().drop_reasons.get("not relayed"), Some(&1));
        assert_eq!(gw.stats().frames_forwarded, 0);
    }

    #[test]
    fn test_gateway_assigns_ids_and_forwards_internal() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let config = NodeConfig {
            assign_ids: true,
            ..NodeConfig::for_role(Role::Gateway)
        };
        let (mut gw, inbox) = sim_node(&air, &clock, config);
        gw.begin().unwrap();
        assert_eq!(gw.state(), NodeState::Operational);

        let request = Message::internal(InternalType::IdRequest, AUTO, GATEWAY_ADDRESS);
        inject(&air, &gw, Pipe::Node, &request);
        inject(&air, &gw, Pipe::Node, &request);
        gw.pump().unwrap();
        gw.pump().unwrap();

        let replies: Vec<u8> = air
            .history()
            .iter()
            .filter_map(|t| t.message())
            .filter(|m| m.is_internal(InternalType::IdResponse))
            .map(|m| m.payload.as_u8())
            .collect();
        assert_eq!(replies, vec![1, 2]);

        let battery = Message::internal(InternalType::BatteryLevel, 5, GATEWAY_ADDRESS).with_payload(80u8);
        inject(&air, &gw, Pipe::Node, &battery);
        assert!(gw.pump().unwrap());
        assert_eq!(inbox.lock().unwrap()[0].payload.as_u8(), 80);
    }

    #[test]
    fn test_gateway_without_route_drops() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut gw, _) = sim_node(&air, &clock, NodeConfig::for_role(Role::Gateway));

        let msg = Message::new(Command::Set, 0, GATEWAY_ADDRESS, 40);
        assert!(!gw.send_route(msg).unwrap());
        assert_eq!(gw.stats().drop_reasons.get("no route to destination"), Some(&1));
    }

    #[test]
    fn test_sleep_and_wake() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), Some(0)));
        let wake = WakeToken::new();

        assert!(!node.sleep(100, &wake).unwrap());
        assert_eq!(clock.now_ms(), 100);
        assert!(node.transport().is_powered());

        wake.wake();
        assert!(node.sleep(100, &wake).unwrap());
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn test_local_state_region() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), Some(0)));

        assert_eq!(node.load_state(3).unwrap(), 0xFF);
        assert!(node.save_state(3, 9).unwrap());
        assert!(!node.save_state(3, 9).unwrap());
        assert_eq!(node.load_state(3).unwrap(), 9);
    }

    #[test]
    fn test_sketch_info_sends_only_given_parts() {
        let air = SimAir::new();
        let clock = SimClock::new();
        let (mut node, _) = sim_node(&air, &clock, sensor(Some(5), Some(0)));
        let gw = fake_gateway(&air, 0);
        air.link(node.transport().station(), gw);

        assert!(node.send_sketch_info(Some("Weather"), None, false).unwrap());
        node.send_battery_level(55, false).unwrap();
        node.request(1, 2, 0).unwrap();
        node.request_time().unwrap();

        let sent = sent_by(&air, node.transport().station());
        assert_eq!(sent.len(), 4);
        assert!(sent[0].is_internal(InternalType::SketchName));
        assert_eq!(sent[0].payload.as_str(), Some("Weather"));
        assert!(sent[1].is_internal(InternalType::BatteryLevel));
        assert_eq!(sent[2].command, Command::Request);
        assert!(sent[3].is_internal(InternalType::Time));
    }
}

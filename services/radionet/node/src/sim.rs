//! In-memory radio medium and clock for driving engines deterministically
//!
//! A [`SimAir`] is a set of stations joined by explicit links. A frame
//! sent to the broadcast address reaches every linked, powered station on
//! its broadcast pipe. Any other frame reaches the linked station whose
//! address is the next hop, on its node pipe. A unicast counts as
//! delivered when such a station exists, which stands in for the link
//! layer ack of a real radio.
//!
//! Scripted stations answer frames they hear immediately, which makes
//! request/response exchanges with a fake gateway easy to set up.

use crate::clock::Clock;
use crate::transport::{Pipe, Transport};
use radionet_wire::{FrameBuf, Message, BROADCAST_ADDRESS};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Replies at most this many scripted frames per transmission
const SCRIPT_BUDGET: usize = 64;

/// Clock that only moves when someone waits on it
#[derive(Debug, Clone, Default)]
pub struct SimClock(Arc<AtomicU64>);

impl SimClock {
    /// Clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

/// Reply generator of a scripted station. Must not touch the air itself.
pub type Script = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// One frame put on the air
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Sending station
    pub station: usize,
    /// Address the frame was sent to
    pub next_hop: u8,
    /// Whether the sender asked for a broadcast
    pub broadcast: bool,
    /// Raw frame
    pub frame: FrameBuf,
    /// Whether the send was reported as successful
    pub delivered: bool,
}

impl Transmission {
    /// Decoded frame
    pub fn message(&self) -> Option<Message> {
        Message::decode(&self.frame).ok()
    }
}

struct Station {
    address: u8,
    inbox: VecDeque<(Pipe, FrameBuf)>,
    powered: bool,
    fail_next: u32,
    script: Option<Script>,
}

#[derive(Default)]
struct AirInner {
    stations: Vec<Station>,
    links: HashSet<(usize, usize)>,
    history: Vec<Transmission>,
}

fn link_key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl AirInner {
    fn add(&mut self, address: u8, script: Option<Script>) -> usize {
        self.stations.push(Station {
            address,
            inbox: VecDeque::new(),
            powered: true,
            fail_next: 0,
            script,
        });
        self.stations.len() - 1
    }

    fn transmit(&mut self, from: usize, next_hop: u8, frame: &[u8], broadcast: bool) -> bool {
        let mut queue = VecDeque::new();
        let delivered = self.put_on_air(from, next_hop, frame, broadcast, &mut queue);

        let mut budget = SCRIPT_BUDGET;
        while let Some((station, mut reply)) = queue.pop_front() {
            if budget == 0 {
                break;
            }
            budget -= 1;
            reply.last = self.stations[station].address;
            let hop = reply.destination;
            if let Ok(bytes) = reply.encode() {
                self.put_on_air(station, hop, &bytes, hop == BROADCAST_ADDRESS, &mut queue);
            }
        }
        delivered
    }

    fn put_on_air(
        &mut self,
        from: usize,
        next_hop: u8,
        frame: &[u8],
        broadcast: bool,
        replies: &mut VecDeque<(usize, Message)>,
    ) -> bool {
        let frame = FrameBuf::from_slice(frame);
        let mut record = Transmission {
            station: from,
            next_hop,
            broadcast,
            frame: frame.clone(),
            delivered: false,
        };

        let sender = &mut self.stations[from];
        if sender.fail_next > 0 {
            sender.fail_next -= 1;
            self.history.push(record);
            return false;
        }
        if !sender.powered {
            self.history.push(record);
            return false;
        }

        let decoded = Message::decode(&frame).ok();
        let mut reached = false;
        for (index, station) in self.stations.iter_mut().enumerate() {
            if index == from || !station.powered || !self.links.contains(&link_key(from, index)) {
                continue;
            }
            let pipe = if next_hop == BROADCAST_ADDRESS {
                Pipe::Broadcast
            } else if station.address == next_hop {
                Pipe::Node
            } else {
                continue;
            };
            reached = true;

            match (&mut station.script, &decoded) {
                (Some(script), Some(msg)) => {
                    for reply in script(msg) {
                        replies.push_back((index, reply));
                    }
                }
                (Some(_), None) => {}
                (None, _) => station.inbox.push_back((pipe, frame.clone())),
            }
        }

        record.delivered = broadcast || next_hop == BROADCAST_ADDRESS || reached;
        trace!(
            "Air: station {} -> {} ({} bytes) delivered={}",
            from,
            next_hop,
            frame.len(),
            record.delivered
        );
        let delivered = record.delivered;
        self.history.push(record);
        delivered
    }
}

/// Shared radio medium
#[derive(Clone, Default)]
pub struct SimAir {
    inner: Arc<Mutex<AirInner>>,
}

impl SimAir {
    /// Empty medium
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AirInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a station driven by an engine
    pub fn radio(&self, address: u8) -> SimRadio {
        let station = self.lock().add(address, None);
        SimRadio {
            air: self.clone(),
            station,
        }
    }

    /// Add a station that answers with `script`. Returns its station id.
    pub fn scripted(&self, address: u8, script: Script) -> usize {
        self.lock().add(address, Some(script))
    }

    /// Put `a` and `b` in range of each other
    pub fn link(&self, a: usize, b: usize) {
        self.set_link(a, b, true);
    }

    /// Bring a link up or down
    pub fn set_link(&self, a: usize, b: usize, up: bool) {
        let mut inner = self.lock();
        if up {
            inner.links.insert(link_key(a, b));
        } else {
            inner.links.remove(&link_key(a, b));
        }
    }

    /// Make the next `count` sends from `station` fail
    pub fn fail_next_sends(&self, station: usize, count: u32) {
        if let Some(s) = self.lock().stations.get_mut(station) {
            s.fail_next = count;
        }
    }

    /// Queue a frame on a station as if it had been received
    pub fn inject(&self, station: usize, pipe: Pipe, frame: &[u8]) {
        if let Some(s) = self.lock().stations.get_mut(station) {
            s.inbox.push_back((pipe, FrameBuf::from_slice(frame)));
        }
    }

    /// Everything sent so far
    pub fn history(&self) -> Vec<Transmission> {
        self.lock().history.clone()
    }

    /// Forget recorded transmissions
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Frames waiting in a station's inbox
    pub fn pending(&self, station: usize) -> usize {
        self.lock()
            .stations
            .get(station)
            .map(|s| s.inbox.len())
            .unwrap_or(0)
    }
}

/// Engine side of a station
pub struct SimRadio {
    air: SimAir,
    station: usize,
}

impl SimRadio {
    /// Station id on the air
    pub fn station(&self) -> usize {
        self.station
    }

    /// Whether the radio is powered up
    pub fn is_powered(&self) -> bool {
        self.air
            .lock()
            .stations
            .get(self.station)
            .map(|s| s.powered)
            .unwrap_or(false)
    }
}

impl Transport for SimRadio {
    fn set_address(&mut self, address: u8) {
        if let Some(s) = self.air.lock().stations.get_mut(self.station) {
            s.address = address;
        }
    }

    fn send(&mut self, next_hop: u8, frame: &[u8], broadcast: bool) -> bool {
        self.air.lock().transmit(self.station, next_hop, frame, broadcast)
    }

    fn receive(&mut self) -> Option<(Pipe, FrameBuf)> {
        self.air.lock().stations.get_mut(self.station)?.inbox.pop_front()
    }

    fn power_down(&mut self) {
        if let Some(s) = self.air.lock().stations.get_mut(self.station) {
            s.powered = false;
        }
    }

    fn power_up(&mut self) {
        if let Some(s) = self.air.lock().stations.get_mut(self.station) {
            s.powered = true;
        }
    }
}

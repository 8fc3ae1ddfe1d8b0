//! Next-hop decisions for originated and relayed frames

use crate::table::ChildRouteTable;
use radionet_wire::{InternalType, Message, AUTO, BROADCAST_ADDRESS, GATEWAY_ADDRESS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Routing decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Send to a child next hop from the route table
    Forward(u8),
    /// Send to the parent
    Parent(u8),
    /// Send to every listening node
    Broadcast,
    /// Drop the frame
    Drop(DropReason),
}

/// Reason for dropping a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// The gateway has no route and nothing above it
    NoRoute,
    /// No parent known yet
    NoParent,
    /// Sending node has no id and the frame is not an id request
    Unassigned,
    /// Broadcast that is not ours to repeat, or a frame from the parent
    /// with no route below
    NotRelayed,
    /// Undecodable frame
    Malformed,
    /// Protocol version mismatch
    VersionMismatch,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => write!(f, "no route to destination"),
            DropReason::NoParent => write!(f, "no parent"),
            DropReason::Unassigned => write!(f, "node id unassigned"),
            DropReason::NotRelayed => write!(f, "not relayed"),
            DropReason::Malformed => write!(f, "malformed frame"),
            DropReason::VersionMismatch => write!(f, "protocol version mismatch"),
        }
    }
}

/// What the deciding node knows about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingContext {
    /// Own address
    pub node_id: u8,
    /// Current parent, [`AUTO`] if unknown
    pub parent: u8,
    /// Whether this node relays for others
    pub repeater: bool,
    /// Whether this node is the tree root
    pub gateway: bool,
}

fn is_id_response_broadcast(msg: &Message) -> bool {
    msg.destination == BROADCAST_ADDRESS && msg.is_internal(InternalType::IdResponse)
}

fn toward_parent(ctx: &RoutingContext) -> RoutingDecision {
    if ctx.gateway {
        RoutingDecision::Drop(DropReason::NoRoute)
    } else if ctx.parent == AUTO {
        RoutingDecision::Drop(DropReason::NoParent)
    } else {
        RoutingDecision::Parent(ctx.parent)
    }
}

/// Decide where a frame this node sends goes next
pub fn decide_outbound(
    ctx: &RoutingContext,
    table: &ChildRouteTable,
    msg: &Message,
) -> RoutingDecision {
    if ctx.node_id == AUTO && !msg.is_internal(InternalType::IdRequest) {
        return RoutingDecision::Drop(DropReason::Unassigned);
    }

    if ctx.repeater && msg.destination != GATEWAY_ADDRESS {
        if let Some(hop) = table.lookup(msg.destination) {
            trace!("Route to {} via child {}", msg.destination, hop);
            return RoutingDecision::Forward(hop);
        }
    }

    if is_id_response_broadcast(msg) {
        return RoutingDecision::Broadcast;
    }

    toward_parent(ctx)
}

/// Decide where a frame addressed to someone else goes next
///
/// `via_broadcast` is set when the frame was heard on the broadcast
/// address rather than sent to this node as next hop. The only broadcast
/// a repeater passes on is an id assignment coming down from its own
/// parent, which lets nodes several hops away learn their id. A unicast
/// with no child route goes up only when it came from below.
pub fn decide_relay(
    ctx: &RoutingContext,
    table: &ChildRouteTable,
    msg: &Message,
    via_broadcast: bool,
) -> RoutingDecision {
    if via_broadcast {
        return if is_id_response_broadcast(msg) && msg.last == ctx.parent && !ctx.gateway {
            RoutingDecision::Broadcast
        } else {
            RoutingDecision::Drop(DropReason::NotRelayed)
        };
    }

    if let Some(hop) = table.lookup(msg.destination) {
        return RoutingDecision::Forward(hop);
    }
    if is_id_response_broadcast(msg) {
        return RoutingDecision::Broadcast;
    }
    // Only traffic from the child subtree goes up; anything that came down
    // from the parent with no route here stops.
    if msg.last == ctx.parent && !ctx.gateway {
        return RoutingDecision::Drop(DropReason::NotRelayed);
    }
    toward_parent(ctx)
}

/// Whether a frame teaches a usable route `sender -> last`
///
/// Parent search answers come from neighbours offering themselves as
/// parent, not from children, so they teach nothing.
pub fn learnable(ctx: &RoutingContext, msg: &Message) -> bool {
    ctx.repeater
        && !msg.is_internal(InternalType::FindParentResponse)
        && msg.sender != AUTO
        && msg.sender != ctx.node_id
        && msg.sender != GATEWAY_ADDRESS
        && msg.last != AUTO
        && msg.last != GATEWAY_ADDRESS
        && msg.last != ctx.parent
}

/// Router statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Frames sent on by this node for others
    pub frames_forwarded: u64,
    /// Frames handed to the application
    pub frames_local: u64,
    /// Frames dropped
    pub frames_dropped: u64,
    /// Routes added or changed
    pub routes_learned: u64,
    /// Frames this node originated that reached the radio
    pub frames_sent: u64,
    /// Transmissions the radio reported as failed
    pub send_failures: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

impl RouterStats {
    /// Count a dropped frame
    pub fn record_drop(&mut self, reason: DropReason) {
        self.frames_dropped += 1;
        *self.drop_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

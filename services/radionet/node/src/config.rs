//! Engine configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a node does in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Leaf node, never relays
    #[default]
    Sensor,
    /// Relays frames for its children
    Repeater,
    /// Tree root at address 0
    Gateway,
}

impl Role {
    /// Whether this role relays for others
    pub fn is_repeater(self) -> bool {
        !matches!(self, Role::Sensor)
    }

    /// Whether this role is the tree root
    pub fn is_gateway(self) -> bool {
        matches!(self, Role::Gateway)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sensor => write!(f, "sensor"),
            Role::Repeater => write!(f, "repeater"),
            Role::Gateway => write!(f, "gateway"),
        }
    }
}

/// Node engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node role
    pub role: Role,
    /// Static node id; `None` asks the gateway for one
    pub node_id: Option<u8>,
    /// Static parent; `None` enables parent discovery
    pub parent_node_id: Option<u8>,
    /// Hops to the gateway through a static parent other than the gateway.
    /// Without it the distance stays unknown and a repeater will not offer
    /// itself as parent.
    pub distance: Option<u8>,
    /// How long to pump for replies after a request (ms)
    pub reply_timeout_ms: u64,
    /// Upper bound of the random delay before answering a parent search (ms)
    pub jitter_max_ms: u64,
    /// Consecutive parent send failures tolerated before searching again
    pub search_failures: u32,
    /// Gateway hands out node ids itself instead of leaving it to the controller
    pub assign_ids: bool,
    /// Seed for the jitter generator, for reproducible runs
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Sensor,
            node_id: None,
            parent_node_id: None,
            distance: None,
            reply_timeout_ms: 2000,
            jitter_max_ms: 1023,
            search_failures: 5,
            assign_ids: false,
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    /// Default configuration for `role`
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }
}

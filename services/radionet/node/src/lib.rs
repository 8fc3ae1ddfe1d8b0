//! Network engine for radionet nodes.
//!
//! This crate turns a radio, a byte store and a clock into a node of the
//! tree network: it finds a parent, obtains an id from the gateway, routes
//! frames up and down the tree and hands messages addressed to it to the
//! application.
//!
//! ## Features
//!
//! - **Parent discovery**: broadcast search, first strictly better offer wins
//! - **Id assignment**: requested from the gateway, or allocated by it
//! - **Routing**: child routes learned from traffic, everything else to the parent
//! - **Failure tracking**: repeated parent failures start a new search
//! - **Simulation**: in-memory air and clock for deterministic tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use radionet_node::{Node, NodeConfig, Role, SystemClock};
//! use radionet_node::sim::SimAir;
//! use radionet_storage::MemoryStore;
//! use radionet_wire::Message;
//!
//! # fn example() -> Result<(), radionet_node::NodeError> {
//! let air = SimAir::new();
//! let config = NodeConfig::for_role(Role::Sensor);
//! let mut node = Node::new(
//!     config,
//!     air.radio(255),
//!     MemoryStore::new(),
//!     SystemClock::new(),
//!     |msg: &Message| println!("got {:?}", msg),
//! )?;
//!
//! node.begin()?;
//! loop {
//!     node.pump()?;
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod failure_tracker;
pub mod gateway;
pub mod handler;
pub mod sim;
pub mod transport;

pub use clock::{Clock, SystemClock, WakeToken};
pub use config::{NodeConfig, Role};
pub use engine::{Node, NodeState};
pub use error::{HaltReason, NodeError};
pub use handler::{MessageHandler, NoopHandler};
pub use transport::{Pipe, Transport};

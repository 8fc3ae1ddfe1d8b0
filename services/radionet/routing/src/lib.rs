//! Child route table and next-hop decisions for radionet.
//!
//! The network is a tree rooted at the gateway. Every node knows its parent.
//! Repeaters also remember, for each descendant they have heard from, which
//! direct child leads to it. Routes are learned from traffic only; nothing
//! advertises them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod table;

pub use router::*;
pub use table::*;

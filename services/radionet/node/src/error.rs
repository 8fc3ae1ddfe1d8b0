//! Engine errors

use radionet_storage::StorageError;
use radionet_wire::WireError;
use thiserror::Error;

/// Errors raised by the network engine
#[derive(Error, Debug)]
pub enum NodeError {
    /// Frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] WireError),
    /// Frame carries a protocol version other than ours
    #[error("Protocol version mismatch: got {0}")]
    ProtocolVersionMismatch(u8),
    /// Radio reported the send to `next_hop` as failed
    #[error("Transmission to {0} failed")]
    TransmissionFailure(u8),
    /// Gateway has no ids left to hand out
    #[error("Address space exhausted")]
    AddressSpaceExhausted,
    /// Gateway asked this node to reboot
    #[error("Reboot requested")]
    RebootRequested,
    /// Persistent state could not be read or written
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl NodeError {
    /// Whether the engine stops for good after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::AddressSpaceExhausted | NodeError::RebootRequested)
    }
}

/// Why a node halted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// See [`NodeError::AddressSpaceExhausted`]
    AddressSpaceExhausted,
    /// See [`NodeError::RebootRequested`]
    RebootRequested,
}

impl From<HaltReason> for NodeError {
    fn from(reason: HaltReason) -> Self {
        match reason {
            HaltReason::AddressSpaceExhausted => NodeError::AddressSpaceExhausted,
            HaltReason::RebootRequested => NodeError::RebootRequested,
        }
    }
}

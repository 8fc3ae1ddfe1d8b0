//! Node identity, controller settings and the application region.

use crate::layout::{
    ERASED, IS_METRIC_ADDRESS, LOCAL_CONFIG_ADDRESS, LOCAL_CONFIG_SIZE,
    LAST_ASSIGNED_ID_ADDRESS, NODE_ID_ADDRESS,
};
use crate::{BlockStore, StorageError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Unassigned id / unknown parent
const UNSET: u8 = 0xFF;

/// Distance meaning "no route to gateway"
pub const UNKNOWN_DISTANCE: u8 = 0xFF;

/// Who this node is and how it reaches the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Own address, 255 while unassigned
    pub node_id: u8,
    /// Next hop toward the gateway, 255 while unknown
    pub parent_node_id: u8,
    /// Hops to the gateway, 255 while unknown
    pub distance: u8,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            node_id: UNSET,
            parent_node_id: UNSET,
            distance: UNKNOWN_DISTANCE,
        }
    }
}

impl NodeIdentity {
    fn to_bytes(self) -> [u8; 3] {
        [self.node_id, self.parent_node_id, self.distance]
    }

    fn from_bytes(bytes: [u8; 3]) -> Self {
        Self {
            node_id: bytes[0],
            parent_node_id: bytes[1],
            distance: bytes[2],
        }
    }
}

/// Settings pushed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Metric (true) or imperial units
    pub is_metric: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { is_metric: true }
    }
}

/// Typed access to the persisted layout
///
/// Keeps the last value known to be in the store and writes only bytes
/// that differ from it.
pub struct NodeStorage<S> {
    store: S,
    identity: NodeIdentity,
    settings: ControllerSettings,
}

impl<S: BlockStore> NodeStorage<S> {
    /// Wrap a store and read the current state from it
    pub fn open(store: S) -> Result<Self, StorageError> {
        let mut storage = Self {
            store,
            identity: NodeIdentity::default(),
            settings: ControllerSettings::default(),
        };
        storage.load()?;
        Ok(storage)
    }

    /// Re-read identity and settings from the store
    pub fn load(&mut self) -> Result<(NodeIdentity, ControllerSettings), StorageError> {
        let mut ident = [0u8; 3];
        self.store.read_block(NODE_ID_ADDRESS, &mut ident)?;
        self.identity = NodeIdentity::from_bytes(ident);

        // Erased reads as metric
        let metric = self.store.read_byte(IS_METRIC_ADDRESS)?;
        self.settings = ControllerSettings {
            is_metric: metric != 0,
        };

        Ok((self.identity, self.settings))
    }

    /// Last identity read or written
    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Last settings read or written
    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    /// Persist `identity`, writing only changed bytes. Returns the number
    /// of bytes written.
    ///
    /// The cached identity follows each byte as it lands, so after a failed
    /// write it still matches the store.
    pub fn save_identity(&mut self, identity: NodeIdentity) -> Result<usize, StorageError> {
        let mut current = self.identity.to_bytes();
        let new = identity.to_bytes();
        let mut written = 0;
        for i in 0..current.len() {
            if current[i] != new[i] {
                self.store.write_byte(NODE_ID_ADDRESS + i, new[i])?;
                current[i] = new[i];
                self.identity = NodeIdentity::from_bytes(current);
                written += 1;
            }
        }

        if written > 0 {
            debug!(
                "Persisted identity node={} parent={} distance={}",
                identity.node_id, identity.parent_node_id, identity.distance
            );
        }
        self.identity = identity;
        Ok(written)
    }

    /// Persist `settings` if they changed. Returns whether a write happened.
    pub fn save_settings(&mut self, settings: ControllerSettings) -> Result<bool, StorageError> {
        if settings == self.settings {
            return Ok(false);
        }
        self.store
            .write_byte(IS_METRIC_ADDRESS, u8::from(settings.is_metric))?;
        self.settings = settings;
        Ok(true)
    }

    /// Application byte at `pos`
    pub fn load_local(&self, pos: u8) -> Result<u8, StorageError> {
        self.store.read_byte(local_offset(pos))
    }

    /// Store an application byte, skipping the write if unchanged
    pub fn save_local(&mut self, pos: u8, value: u8) -> Result<bool, StorageError> {
        let offset = local_offset(pos);
        if self.store.read_byte(offset)? == value {
            return Ok(false);
        }
        self.store.write_byte(offset, value)?;
        Ok(true)
    }

    /// Last id a gateway handed out, `None` if it never assigned one
    pub fn last_assigned_id(&self) -> Result<Option<u8>, StorageError> {
        let value = self.store.read_byte(LAST_ASSIGNED_ID_ADDRESS)?;
        Ok((value != ERASED).then_some(value))
    }

    /// Record the last id a gateway handed out
    pub fn set_last_assigned_id(&mut self, id: u8) -> Result<(), StorageError> {
        if self.store.read_byte(LAST_ASSIGNED_ID_ADDRESS)? != id {
            self.store.write_byte(LAST_ASSIGNED_ID_ADDRESS, id)?;
        }
        Ok(())
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Underlying store, for regions managed elsewhere (child routes)
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Give the store back
    pub fn into_inner(self) -> S {
        self.store
    }
}

// Every u8 position is inside the region
const _: () = assert!(LOCAL_CONFIG_SIZE == u8::MAX as usize + 1);

fn local_offset(pos: u8) -> usize {
    LOCAL_CONFIG_ADDRESS + pos as usize
}

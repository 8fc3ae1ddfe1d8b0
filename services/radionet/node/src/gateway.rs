//! Id assignment on the gateway

use radionet_storage::{BlockStore, NodeStorage, StorageError};
use radionet_wire::AUTO;
use tracing::{info, warn};

/// Highest id the gateway hands out
pub const MAX_ASSIGNABLE_ID: u8 = 254;

/// Sequential id allocator backed by the controller settings region
#[derive(Debug, Clone)]
pub struct IdAllocator {
    last: u8,
}

impl IdAllocator {
    /// Resume from the last id persisted in `storage`
    pub fn load<S: BlockStore>(storage: &NodeStorage<S>) -> Result<Self, StorageError> {
        let last = storage.last_assigned_id()?.unwrap_or(0);
        Ok(Self { last })
    }

    /// Last id handed out, 0 if none
    pub fn last_assigned(&self) -> u8 {
        self.last
    }

    /// Hand out the next id, or [`AUTO`] once every id is taken
    pub fn allocate<S: BlockStore>(&mut self, storage: &mut NodeStorage<S>) -> Result<u8, StorageError> {
        if self.last >= MAX_ASSIGNABLE_ID {
            warn!("No node ids left to assign");
            return Ok(AUTO);
        }
        let id = self.last + 1;
        storage.set_last_assigned_id(id)?;
        self.last = id;
        info!("Assigned node id {}", id);
        Ok(id)
    }
}

//! Child route table for repeaters

use radionet_storage::layout::{ROUTES_ADDRESS, ROUTES_SIZE};
use radionet_storage::{BlockStore, StorageError};
use radionet_wire::BROADCAST_ADDRESS;
use tracing::{debug, info};

/// Table value meaning "no route"
pub const NO_ROUTE: u8 = 0xFF;

/// Descendant address -> next-hop child
///
/// Mirrors the persisted route region byte for byte. Every mutation is
/// written through to the store one entry at a time.
#[derive(Debug, Clone)]
pub struct ChildRouteTable {
    routes: [u8; ROUTES_SIZE],
}

impl Default for ChildRouteTable {
    fn default() -> Self {
        Self {
            routes: [NO_ROUTE; ROUTES_SIZE],
        }
    }
}

impl ChildRouteTable {
    /// Read the table from the store
    pub fn load<S: BlockStore + ?Sized>(store: &S) -> Result<Self, StorageError> {
        let mut table = Self::default();
        store.read_block(ROUTES_ADDRESS, &mut table.routes)?;
        debug!("Loaded {} child routes", table.len());
        Ok(table)
    }

    /// Next hop toward `address`
    ///
    /// The gateway and the broadcast address are never valid next hops.
    pub fn lookup(&self, address: u8) -> Option<u8> {
        match self.routes[address as usize] {
            0 | NO_ROUTE => None,
            hop => Some(hop),
        }
    }

    /// Record that `address` is reached through `next_hop`.
    ///
    /// Returns whether the entry changed; an unchanged entry costs no write.
    pub fn insert<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        address: u8,
        next_hop: u8,
    ) -> Result<bool, StorageError> {
        if self.routes[address as usize] == next_hop {
            return Ok(false);
        }
        store.write_byte(ROUTES_ADDRESS + address as usize, next_hop)?;
        self.routes[address as usize] = next_hop;
        debug!("Added route to {} via {}", address, next_hop);
        Ok(true)
    }

    /// Forget the route to `address`
    pub fn remove<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        address: u8,
    ) -> Result<bool, StorageError> {
        let changed = self.insert(store, address, NO_ROUTE)?;
        if changed {
            debug!("Removed route to {}", address);
        }
        Ok(changed)
    }

    /// Forget every route. Returns the number of entries cleared.
    pub fn clear_all<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<usize, StorageError> {
        let mut cleared = 0;
        for address in 0..ROUTES_SIZE {
            if self.routes[address] != NO_ROUTE {
                store.write_byte(ROUTES_ADDRESS + address, NO_ROUTE)?;
                self.routes[address] = NO_ROUTE;
                cleared += 1;
            }
        }
        info!("Cleared {} child routes", cleared);
        Ok(cleared)
    }

    /// Number of usable routes
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no usable route exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable routes as (descendant, next hop)
    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        (0..=BROADCAST_ADDRESS).filter_map(move |address| self.lookup(address).map(|hop| (address, hop)))
    }
}

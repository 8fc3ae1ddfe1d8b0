//! Byte offsets of the persisted state.
//!
//! ```text
//! offset  size  content
//!      0     1  node id
//!      1     1  parent node id
//!      2     1  distance to gateway
//!      3   256  child route table, indexed by descendant address
//!    259    24  controller settings
//!    283   256  application local config
//! ```

/// Total store size
pub const STORE_SIZE: usize = 1024;

/// Value of a byte that was never written
pub const ERASED: u8 = 0xFF;

/// Node id
pub const NODE_ID_ADDRESS: usize = 0;

/// Parent node id
pub const PARENT_NODE_ID_ADDRESS: usize = 1;

/// Distance to gateway
pub const DISTANCE_ADDRESS: usize = 2;

/// Child route table
pub const ROUTES_ADDRESS: usize = 3;

/// One entry per possible address
pub const ROUTES_SIZE: usize = 256;

/// Controller settings block
pub const CONTROLLER_CONFIG_ADDRESS: usize = ROUTES_ADDRESS + ROUTES_SIZE;

/// Size reserved for controller settings
pub const CONTROLLER_CONFIG_SIZE: usize = 24;

/// `is_metric` flag, first byte of the controller settings
pub const IS_METRIC_ADDRESS: usize = CONTROLLER_CONFIG_ADDRESS;

/// Last id a gateway handed out
pub const LAST_ASSIGNED_ID_ADDRESS: usize = CONTROLLER_CONFIG_ADDRESS + 1;

/// Application region
pub const LOCAL_CONFIG_ADDRESS: usize = CONTROLLER_CONFIG_ADDRESS + CONTROLLER_CONFIG_SIZE;

/// Size of the application region
pub const LOCAL_CONFIG_SIZE: usize = 256;

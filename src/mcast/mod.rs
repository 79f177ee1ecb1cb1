pub mod address;
pub mod allocator;
pub mod audit;
pub mod config;
pub mod hardware;
pub mod manager;
pub mod memory_port;
pub mod status_cache;

pub use address::Gid;
pub use config::MulticastTableConfig;
pub use hardware::{GroupEntry, HardwareAccessPort, HardwareError};
pub use manager::{MulticastGroupManager, MulticastGroupManagerBuilder};
pub use status_cache::StatusCacheEntry;

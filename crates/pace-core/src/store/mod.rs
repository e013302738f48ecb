mod coordinated;
pub mod election;
mod memory;
pub mod paths;
mod rocksdb;
mod traits;

pub use self::rocksdb::RocksDbCoordinator;
pub use coordinated::CoordinatedMaxRateStore;
pub use election::{ElectionRegistry, LeaderLatch, LeadershipEvent};
pub use memory::MemoryCoordinator;
pub use traits::{CoordinationStore, MaxRateStore, Versioned};

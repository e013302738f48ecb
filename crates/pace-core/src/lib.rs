pub mod assignment;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod rate;
pub mod store;
pub mod subscription;
pub mod supervisor;
pub mod telemetry;

pub use assignment::{AssignmentListener, AssignmentSource, StaticAssignments, SubscriptionAssignment};
pub use config::PaceConfig;
pub use error::{PaceError, Result, StoreError, StoreResult};
pub use metrics::Metrics;
pub use node::{ConsumerNode, LocalConsumers};
pub use rate::{LocalRateController, MaxRate, Mode, NegotiationClient, RateHistory};
pub use store::{
    CoordinatedMaxRateStore, CoordinationStore, MaxRateStore, MemoryCoordinator,
    RocksDbCoordinator,
};
pub use subscription::{Subscription, SubscriptionName};

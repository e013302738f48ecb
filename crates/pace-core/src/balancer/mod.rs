mod algorithm;
mod job;

pub use algorithm::{ConsumerRateInfo, MaxRateBalancer};
pub use job::{BalancerJob, RunSummary};

mod leadership;
mod periodic;

pub use leadership::BalancerSupervisor;
pub use periodic::{PeriodicSupervisor, Registration, SupervisorHandle, Tick};

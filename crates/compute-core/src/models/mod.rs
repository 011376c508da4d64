pub mod config;
pub mod health;
pub mod package;
pub mod worker;

pub use config::{ComputeConfiguration, DiscoveryMode, PortRange};
pub use health::{FaultEvent, HealthCheckResult};
pub use package::{AssemblyDistribution, PackageDescriptor};
pub use worker::{WorkerIdentity, WorkerInstance, WorkerState};

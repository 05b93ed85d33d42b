pub mod cluster;
pub mod context;
pub mod error;
pub mod host;
pub mod machine;
pub mod retry;
pub mod runtime;

pub use cluster::ClusterReconciler;
pub use context::Context;
pub use error::ReconcileError;
pub use host::{HostReconciler, RedfishJobRunner};
pub use machine::MachineReconciler;
pub use retry::RetryPolicy;
pub use runtime::{ControllerRunner, Reconciler, Requeue};

pub mod queue;

pub use queue::{
    EnqueueOutcome, JobRunner, OperationKind, ProvisioningQueue, QueueEntry, QueueStats,
};

//! Policy-driven eviction across every tier.

pub mod defaults;
mod engine;
pub mod scheduler;

pub use defaults::default_policies;
pub use engine::{PolicyExecution, PolicyPhase, PolicyUpdate, RetentionEngine};
pub use scheduler::{spawn_scheduler, SchedulerHandle};

pub mod invalidation;
pub mod policies;
pub mod stats;

//! Pipeline coordination: the per-stage consume loop.

mod coordinator;

pub use coordinator::{Coordinator, CoordinatorStats};

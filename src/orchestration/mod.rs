//! Request orchestration layer
//!
//! This module sequences one request's transport lifecycle into ordered
//! telemetry and a single outcome.

pub mod executor;
pub mod latch;
pub mod lifecycle;


pub use executor::RequestOrchestrator;
pub use latch::OutcomeLatch;
pub use lifecycle::{Lifecycle, LifecycleState};

//! Keeping the local mirror in step with a CI server.

pub mod budget;
pub mod lanes;
pub mod orchestrator;

pub use budget::SyncBudget;
pub use lanes::ProactiveLanes;
pub use orchestrator::{ActualizeReport, LoadReport, SyncOrchestrator, split_stuck};

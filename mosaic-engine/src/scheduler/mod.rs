//! Scheduling layer
//!
//! Runs pipelines: the orchestrator owns the run loop and parent/child
//! ordering, workers drive single steps through submit and poll, and
//! recovery decides how a restarted run picks each step up again.

mod orchestrator;
mod recovery;
mod worker;

pub use orchestrator::Orchestrator;

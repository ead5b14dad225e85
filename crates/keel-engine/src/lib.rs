//! Planning and apply engine for keel stacks.
//!
//! Builds the resource graph of a stack, diffs it against recorded state,
//! and applies changes in dependency order with bounded parallelism.

pub mod diff;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod references;
pub mod secrets;
pub mod state;
pub mod transform;

pub use graph::ResourceGraph;
pub use orchestrator::{
    OrchestratorConfig, RunEvent, RunOptions, StackOrchestrator, StackProgram, wait_for_run,
};
pub use plan::{DriftReport, detect_drift, plan_changes};
pub use references::{Resolver, StackOutputs};
pub use secrets::FileSecretStore;
pub use state::{FileStateStore, MemoryStateStore};
pub use transform::{Transformation, Transformations};

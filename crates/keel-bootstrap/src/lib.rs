//! Bare-metal bootstrap for keel.
//!
//! Runs the ordered steps of a bootstrap plan on each host, over SSH or on
//! the local machine, before any stack is applied.

pub mod error;
pub mod runner;
pub mod target;

pub use error::{BootstrapError, BootstrapResult};
pub use runner::{BootstrapRunner, HostReport, StepFailure, StepReport, StepStatus};
pub use target::{CommandOutput, LocalTarget, SshTarget, Target};

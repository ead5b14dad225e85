//! KDL configuration parsing for keel.
//!
//! This crate handles parsing of:
//! - Stack definitions (`<stack>.kdl`)
//! - Per-stack configuration stores (`Keel.<stack>.kdl`)
//! - Workspace configuration (`keel.kdl`)
//! - Bootstrap plans
//! - Variable interpolation

pub mod bootstrap;
pub mod error;
mod nodes;
pub mod stack;
pub mod store;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use stack::{DeclaredStack, StackDefinition, TransformSpec, load_stack, parse_stack};
pub use store::StackConfig;
pub use system::{StateBackendConfig, WorkspaceConfig};
pub use variables::{VariableContext, VariableContextBuilder};

//! Resource providers for keel.
//!
//! - [`KubernetesProvider`]: namespaces and manifests through server-side apply
//! - [`HelmProvider`]: Helm releases through the `helm` binary
//! - [`MemoryProvider`]: an in-process remote for tests and dry runs

pub mod error;
pub mod helm;
pub mod kubernetes;
pub mod memory;
pub mod readiness;

pub use error::{DeployError, DeployResult};
pub use helm::{HelmProvider, ReleaseSpec};
pub use kubernetes::KubernetesProvider;
pub use memory::{MemoryEvent, MemoryProvider};

//! Core domain types and traits for keel.
//!
//! This crate contains:
//! - Run and lock identifiers
//! - Property value trees with secret and reference variants
//! - Resource declarations and options
//! - Stack state, plans and run reports
//! - Provider and state store traits
//! - Secret storage and fingerprinting

pub mod error;
pub mod id;
pub mod provider;
pub mod resource;
pub mod secret;
pub mod stack;
pub mod state;
pub mod value;

pub use error::{Error, Result};
pub use id::RunId;
pub use resource::{ResourceDeclaration, ResourceOptions, ResourceType};
pub use value::{PropertyMap, PropertyValue, Reference};

//! Assay Algorithm Registry
//!
//! Manifests, payload validation and the versioned store of pluggable
//! algorithm services.
//!
//! # Core Concepts
//!
//! - [`AlgorithmManifest`]: Contract an algorithm service declares
//! - [`Version`]: Semantic version with pre-release precedence
//! - [`ResourceRequirements`]: CPU, memory and GPU envelope
//! - [`validate_payload`]: Check a payload against declared inputs
//! - [`AlgorithmRegistry`]: `(name, version)` keyed store with snapshot listings
//!
//! # Example
//!
//! ```rust
//! use assay_registry::{AlgorithmManifest, AlgorithmRegistry, Version};
//!
//! let registry = AlgorithmRegistry::new();
//! let manifest = AlgorithmManifest::new("docking", Version::new(1, 0, 0), "run-docking");
//! registry.register(manifest, "grpc://docking:50051").unwrap();
//!
//! let entry = registry.lookup("docking", None).unwrap();
//! assert_eq!(entry.endpoint, "grpc://docking:50051");
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod error;
mod manifest;
mod registry;
mod resources;
mod validation;
mod version;

// Re-exports
pub use error::RegistryError;
pub use manifest::{AlgorithmManifest, DataType, IoSpec, ValidationRule, ValidationType};
pub use registry::{AlgorithmRegistry, Listing, RegistryEntry};
pub use resources::{MemorySize, ResourceMismatch, ResourceRequirements};
pub use validation::{validate_payload, Violation};
pub use version::Version;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

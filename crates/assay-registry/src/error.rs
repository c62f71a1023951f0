//! Error types for the algorithm registry
//!
//! Registry errors are caller or configuration mistakes. They are always
//! surfaced synchronously and never retried.

use crate::version::Version;

/// Registry and manifest errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `(name, version)` is already registered
    #[error("algorithm {name}@{version} is already registered")]
    DuplicateManifest { name: String, version: Version },

    /// No manifest matches the request
    #[error("algorithm {name}{} not found", at_version(.version))]
    NotFound {
        name: String,
        version: Option<Version>,
    },

    /// Manifest document is structurally invalid
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Version string is not a semantic version
    #[error("invalid version {0:?}: expected MAJOR.MINOR.PATCH[-PRE]")]
    InvalidVersion(String),

    /// Manifest file could not be read
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn at_version(version: &Option<Version>) -> String {
    version.as_ref().map(|v| format!("@{v}")).unwrap_or_default()
}

impl RegistryError {
    /// Not-found helper
    #[inline]
    pub fn not_found(name: impl Into<String>, version: Option<Version>) -> Self {
        Self::NotFound {
            name: name.into(),
            version,
        }
    }
}

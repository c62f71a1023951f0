//! Algorithm manifests
//!
//! A manifest is the contract an algorithm service declares when it
//! registers: its input/output schema, resource envelope and launch details.
//! Manifests are loaded once from a YAML or JSON document and never mutated
//! after registration; a new version is a new manifest.
//!
//! # Example
//!
//! ```rust
//! use assay_registry::AlgorithmManifest;
//!
//! let manifest = AlgorithmManifest::from_yaml_str(r#"
//! name: herb_similarity
//! version: 0.1.3
//! entrypoint: python -m herb_similarity
//! inputs:
//!   - name: smiles
//!     type: string
//! "#).unwrap();
//!
//! assert_eq!(manifest.id(), "herb_similarity@0.1.3");
//! assert!(manifest.inputs[0].required);
//! ```

use crate::error::RegistryError;
use crate::resources::ResourceRequirements;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Data types an input or output may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    /// Reference to a file (path or URI)
    File,
}

impl DataType {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Array => "array",
            DataType::Object => "object",
            DataType::File => "file",
        }
    }

    /// Whether a JSON value is an instance of this type
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            DataType::String => value.is_string(),
            DataType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            DataType::Float => value.is_number(),
            DataType::Boolean => value.is_boolean(),
            DataType::Array => value.is_array(),
            DataType::Object => value.is_object(),
            DataType::File => value.as_str().is_some_and(|s| !s.trim().is_empty()),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    Min,
    Max,
    Pattern,
    Length,
    Enum,
}

/// A single validation rule on an input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValidationRule {
    /// Numeric lower bound (inclusive)
    Min { value: f64 },
    /// Numeric upper bound (inclusive)
    Max { value: f64 },
    /// Regular expression a string must match
    Pattern { value: String },
    /// Length bounds for strings (chars) and arrays (items)
    Length {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
    },
    /// Allowed values
    Enum { values: Vec<Value> },
}

impl ValidationRule {
    /// Rule kind
    #[must_use]
    pub const fn kind(&self) -> ValidationType {
        match self {
            ValidationRule::Min { .. } => ValidationType::Min,
            ValidationRule::Max { .. } => ValidationType::Max,
            ValidationRule::Pattern { .. } => ValidationType::Pattern,
            ValidationRule::Length { .. } => ValidationType::Length,
            ValidationRule::Enum { .. } => ValidationType::Enum,
        }
    }
}

/// Input or output declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

fn default_required() -> bool {
    true
}

impl IoSpec {
    /// Required field of the given type
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: true,
            description: String::new(),
            default: None,
            validation: Vec::new(),
        }
    }

    /// Optional field with a default
    #[inline]
    #[must_use]
    pub fn optional(mut self, default: Option<Value>) -> Self {
        self.required = false;
        self.default = default;
        self
    }

    /// With validation rule
    #[inline]
    #[must_use]
    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }
}

/// The contract an algorithm service declares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: String,
    /// Command that launches the service
    pub entrypoint: String,
    #[serde(default)]
    pub inputs: Vec<IoSpec>,
    #[serde(default)]
    pub outputs: Vec<IoSpec>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default = "default_license")]
    pub license: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_license() -> String {
    "MIT".to_string()
}

impl AlgorithmManifest {
    /// Minimal manifest
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version, entrypoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            entrypoint: entrypoint.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceRequirements::default(),
            license: default_license(),
            tags: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    /// With input
    #[inline]
    #[must_use]
    pub fn with_input(mut self, spec: IoSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// With output
    #[inline]
    #[must_use]
    pub fn with_output(mut self, spec: IoSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    /// With resources
    #[inline]
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// With tag
    #[inline]
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// `name@version`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Input declaration by name
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&IoSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Parse a YAML manifest document
    pub fn from_yaml_str(document: &str) -> Result<Self, RegistryError> {
        let manifest: Self = serde_yaml::from_str(document)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
        manifest.normalized()
    }

    /// Parse a JSON manifest document
    pub fn from_json_str(document: &str) -> Result<Self, RegistryError> {
        let manifest: Self = serde_json::from_str(document)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
        manifest.normalized()
    }

    /// Load a manifest file; `.json` is parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&document)
        } else {
            Self::from_yaml_str(&document)
        }
    }

    /// Load a manifest file and check it declares the expected name and version
    pub fn load_expecting(
        path: impl AsRef<Path>,
        name: &str,
        version: &Version,
    ) -> Result<Self, RegistryError> {
        let manifest = Self::load(path)?;
        if manifest.name != name {
            return Err(RegistryError::InvalidManifest(format!(
                "manifest name {:?} doesn't match algorithm name {name:?}",
                manifest.name
            )));
        }
        if &manifest.version != version {
            return Err(RegistryError::InvalidManifest(format!(
                "manifest version {} doesn't match algorithm version {version}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Check structural consistency
    ///
    /// Registration calls this; it is also run on every loaded document.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |msg: String| Err(RegistryError::InvalidManifest(msg));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if self.entrypoint.trim().is_empty() {
            return invalid(format!("{}: entrypoint must not be empty", self.id()));
        }
        if self.resources.cpu < 0.0 || !self.resources.cpu.is_finite() {
            return invalid(format!("{}: cpu must be a non-negative number", self.id()));
        }

        for (kind, specs) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = HashSet::new();
            for spec in specs {
                if !seen.insert(spec.name.as_str()) {
                    return invalid(format!("{}: duplicate {kind} {:?}", self.id(), spec.name));
                }
                for rule in &spec.validation {
                    if let ValidationRule::Pattern { value } = rule {
                        if let Err(e) = regex::Regex::new(value) {
                            return invalid(format!(
                                "{}: {kind} {:?} has invalid pattern: {e}",
                                self.id(),
                                spec.name
                            ));
                        }
                    }
                }
                if let Some(default) = &spec.default {
                    if !default.is_null() && !spec.data_type.accepts(default) {
                        return invalid(format!(
                            "{}: default for {kind} {:?} is not a {}",
                            self.id(),
                            spec.name,
                            spec.data_type
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Outputs are always required
    fn normalized(mut self) -> Result<Self, RegistryError> {
        for output in &mut self.outputs {
            output.required = true;
        }
        self.validate()?;
        Ok(self)
    }
}

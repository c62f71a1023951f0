//! Algorithm registration facade
//!
//! Binds manifests to running [`AlgorithmService`] handles in the shared
//! [`ServiceRegistry`]. Manifests can come from the caller, from the service
//! itself, or from a YAML/JSON file on disk.

use crate::error::RegistrationError;
use assay_kernel::{AlgorithmService, ServiceHandle, ServiceRegistry};
use assay_registry::{AlgorithmManifest, RegistryError, Version};
use std::path::Path;
use std::sync::Arc;

/// Registration and discovery of algorithm services
#[derive(Clone)]
pub struct RegistryService {
    registry: Arc<ServiceRegistry>,
}

impl std::fmt::Debug for RegistryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryService")
            .field("algorithms", &self.registry.len())
            .finish()
    }
}

impl Default for RegistryService {
    fn default() -> Self {
        Self::new(Arc::new(ServiceRegistry::new()))
    }
}

impl RegistryService {
    /// Wrap an existing registry
    #[inline]
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Underlying registry, for handing to the engine
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Register `service` under `manifest`
    pub fn register_algorithm(
        &self,
        manifest: AlgorithmManifest,
        service: ServiceHandle,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        let manifest = self.registry.register(manifest, service)?;
        tracing::info!(algorithm = %manifest.id(), "algorithm registered");
        Ok(manifest)
    }

    /// Register a service under the manifest it reports
    pub async fn register_service<S>(
        &self,
        service: Arc<S>,
    ) -> Result<Arc<AlgorithmManifest>, RegistrationError>
    where
        S: AlgorithmService + 'static,
    {
        let manifest = service.manifest().await?;
        Ok(self.register_algorithm(manifest, service)?)
    }

    /// Register a service under a manifest file
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn register_from_file(
        &self,
        path: impl AsRef<Path>,
        service: ServiceHandle,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        let manifest = AlgorithmManifest::load(path)?;
        self.register_algorithm(manifest, service)
    }

    /// Every registered manifest, sorted by name then version
    #[must_use]
    pub fn list_algorithms(&self) -> Vec<Arc<AlgorithmManifest>> {
        self.registry.list().manifests().cloned().collect()
    }

    /// Exact version, or the highest registered one when `version` is `None`
    pub fn get_algorithm(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        self.registry.lookup(name, version).map(|entry| entry.manifest)
    }

    /// Remove one version; tasks already dispatched keep their handle
    pub fn unregister_algorithm(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        let manifest = self.registry.unregister(name, version)?;
        tracing::info!(algorithm = %manifest.id(), "algorithm unregistered");
        Ok(manifest)
    }
}

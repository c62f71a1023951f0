//! Algorithm registry
//!
//! The single authoritative store of registered algorithms, keyed by
//! `(name, version)`. Writers are serialised behind a lock; readers clone an
//! [`im::OrdMap`] snapshot in O(1) and never observe a half-applied write.
//!
//! The registry is generic over the endpoint handle so it carries no
//! knowledge of how services are reached.

use crate::error::RegistryError;
use crate::manifest::AlgorithmManifest;
use crate::version::Version;
use im::OrdMap;
use parking_lot::RwLock;
use std::sync::Arc;

type Key = (String, Version);

/// A registered manifest and the handle used to reach its service
#[derive(Debug)]
pub struct RegistryEntry<E> {
    pub manifest: Arc<AlgorithmManifest>,
    pub endpoint: E,
}

impl<E: Clone> Clone for RegistryEntry<E> {
    fn clone(&self) -> Self {
        Self {
            manifest: Arc::clone(&self.manifest),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Registry of algorithm services
#[derive(Debug)]
pub struct AlgorithmRegistry<E: Clone> {
    entries: RwLock<OrdMap<Key, RegistryEntry<E>>>,
}

impl<E: Clone> Default for AlgorithmRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> AlgorithmRegistry<E> {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(OrdMap::new()),
        }
    }

    /// Register a manifest
    ///
    /// # Errors
    /// `DuplicateManifest` if `(name, version)` is already present;
    /// `InvalidManifest` if the manifest is structurally inconsistent.
    pub fn register(
        &self,
        manifest: AlgorithmManifest,
        endpoint: E,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        manifest.validate()?;
        let key = (manifest.name.clone(), manifest.version.clone());
        let manifest = Arc::new(manifest);

        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::DuplicateManifest {
                name: key.0,
                version: key.1,
            });
        }
        entries.insert(
            key,
            RegistryEntry {
                manifest: Arc::clone(&manifest),
                endpoint,
            },
        );
        drop(entries);

        tracing::info!(
            algorithm = %manifest.name,
            version = %manifest.version,
            "algorithm registered"
        );
        Ok(manifest)
    }

    /// Look up an algorithm; `None` resolves to the highest version
    pub fn lookup(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Result<RegistryEntry<E>, RegistryError> {
        let snapshot = self.snapshot();
        let found = match version {
            Some(v) => snapshot.get(&(name.to_string(), v.clone())).cloned(),
            None => snapshot
                .iter()
                .filter(|((n, _), _)| n == name)
                .map(|(_, entry)| entry)
                .last()
                .cloned(),
        };
        found.ok_or_else(|| RegistryError::not_found(name, version.cloned()))
    }

    /// Remove an algorithm version
    ///
    /// Entries already handed out stay usable; removal only affects later lookups.
    pub fn unregister(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Arc<AlgorithmManifest>, RegistryError> {
        let removed = self
            .entries
            .write()
            .remove(&(name.to_string(), version.clone()));

        match removed {
            Some(entry) => {
                tracing::info!(algorithm = %name, %version, "algorithm unregistered");
                Ok(entry.manifest)
            }
            None => Err(RegistryError::not_found(name, Some(version.clone()))),
        }
    }

    /// Snapshot-consistent listing of every registered manifest
    #[must_use]
    pub fn list(&self) -> Listing<E> {
        Listing {
            snapshot: self.snapshot(),
        }
    }

    /// Registered versions of `name`, ascending
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.snapshot()
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Check if `(name, version)` is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str, version: &Version) -> bool {
        self.entries
            .read()
            .contains_key(&(name.to_string(), version.clone()))
    }

    /// Number of registered versions across all algorithms
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> OrdMap<Key, RegistryEntry<E>> {
        self.entries.read().clone()
    }
}

/// Point-in-time view of the registry
///
/// Iteration is lazy, finite and may be restarted any number of times; later
/// registry writes are not visible through an existing listing.
#[derive(Debug, Clone)]
pub struct Listing<E: Clone> {
    snapshot: OrdMap<Key, RegistryEntry<E>>,
}

impl<E: Clone> Listing<E> {
    /// Iterate entries ordered by name then version
    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry<E>> + '_ {
        self.snapshot.values()
    }

    /// Iterate manifests ordered by name then version
    pub fn manifests(&self) -> impl Iterator<Item = &Arc<AlgorithmManifest>> + '_ {
        self.snapshot.values().map(|e| &e.manifest)
    }

    /// Number of entries in the snapshot
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    /// Check if the snapshot is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, version: &str) -> AlgorithmManifest {
        AlgorithmManifest::new(name, version.parse().unwrap(), format!("run-{name}"))
    }

    #[test]
    fn registry_new_empty() {
        let registry: AlgorithmRegistry<u32> = AlgorithmRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.list().len(), 0);
    }

    #[test]
    fn register_then_lookup_exact() {
        let registry = AlgorithmRegistry::new();
        registry.register(manifest("docking", "1.0.0"), 7u32).unwrap();

        let entry = registry
            .lookup("docking", Some(&Version::new(1, 0, 0)))
            .unwrap();
        assert_eq!(entry.endpoint, 7);
        assert!(registry.contains("docking", &Version::new(1, 0, 0)));
    }

    #[test]
    fn duplicate_rejected() {
        let registry = AlgorithmRegistry::new();
        registry.register(manifest("docking", "1.0.0"), 1u32).unwrap();
        let err = registry.register(manifest("docking", "1.0.0"), 2u32).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateManifest { .. }));
        assert_eq!(registry.lookup("docking", None).unwrap().endpoint, 1);
    }

    #[test]
    fn lookup_without_version_picks_highest() {
        let registry = AlgorithmRegistry::new();
        registry.register(manifest("docking", "1.9.0"), 1u32).unwrap();
        registry.register(manifest("docking", "1.10.0"), 2u32).unwrap();
        registry.register(manifest("docking", "2.0.0-rc.1"), 3u32).unwrap();
        registry.register(manifest("dockinga", "9.0.0"), 4u32).unwrap();

        let entry = registry.lookup("docking", None).unwrap();
        assert_eq!(entry.manifest.version, "2.0.0-rc.1".parse().unwrap());
        assert_eq!(
            registry.versions("docking"),
            vec![
                Version::new(1, 9, 0),
                Version::new(1, 10, 0),
                Version::new(2, 0, 0).with_pre("rc.1")
            ]
        );
    }

    #[test]
    fn unregister_absent_is_not_found() {
        let registry: AlgorithmRegistry<u32> = AlgorithmRegistry::new();
        let err = registry
            .unregister("docking", &Version::new(1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn handed_out_entry_survives_unregister() {
        let registry = AlgorithmRegistry::new();
        registry.register(manifest("docking", "1.0.0"), 1u32).unwrap();
        let held = registry.lookup("docking", None).unwrap();

        registry.unregister("docking", &Version::new(1, 0, 0)).unwrap();
        assert!(registry.lookup("docking", None).is_err());
        assert_eq!(held.manifest.name, "docking");
    }

    #[test]
    fn listing_is_a_snapshot() {
        let registry = AlgorithmRegistry::new();
        registry.register(manifest("a", "1.0.0"), 1u32).unwrap();
        let listing = registry.list();
        registry.register(manifest("b", "1.0.0"), 2u32).unwrap();

        assert_eq!(listing.iter().count(), 1);
        // restartable
        assert_eq!(listing.manifests().count(), 1);
        assert_eq!(registry.list().len(), 2);
    }
}

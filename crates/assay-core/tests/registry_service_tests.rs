//! RegistryService Tests

use assay_core::{RegistrationError, RegistryService};
use assay_registry::RegistryError;
use assay_test_utils::{manifest, scoring_manifest, version, StubService};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn test_service_registers_under_its_own_manifest() {
    let service = RegistryService::default();
    let registered = service
        .register_service(Arc::new(StubService::new(scoring_manifest("score"))))
        .await
        .unwrap();

    assert_eq!(registered.id(), "score@1.0.0");
    assert_eq!(service.get_algorithm("score", None).unwrap().inputs.len(), 1);

    let err = service
        .register_service(Arc::new(StubService::new(scoring_manifest("score"))))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::Registry(RegistryError::DuplicateManifest { .. })
    ));
}

#[test]
fn test_manifest_file_registration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("similarity.yaml");
    std::fs::write(
        &path,
        r"
name: herb_similarity
version: 0.1.3
entrypoint: python -m herb_similarity
inputs:
  - name: smiles
    type: string
outputs:
  - name: score
    type: float
",
    )
    .unwrap();

    let service = RegistryService::default();
    let stub = Arc::new(StubService::new(manifest("herb_similarity", "0.1.3")));
    let registered = service.register_from_file(&path, stub).unwrap();

    assert_eq!(registered.id(), "herb_similarity@0.1.3");
    assert_eq!(registered.entrypoint, "python -m herb_similarity");
    assert!(service.registry().contains("herb_similarity", &version("0.1.3")));
}

#[test]
fn test_lookup_listing_and_unregister() {
    let service = RegistryService::default();
    for (name, v) in [("dock", "1.2.0"), ("admet", "0.9.1"), ("dock", "1.10.0")] {
        let stub = Arc::new(StubService::new(manifest(name, v)));
        service.register_algorithm(manifest(name, v), stub).unwrap();
    }

    let listed: Vec<String> = service.list_algorithms().iter().map(|m| m.id()).collect();
    assert_eq!(listed, vec!["admet@0.9.1", "dock@1.2.0", "dock@1.10.0"]);

    // highest version wins when none is requested
    assert_eq!(service.get_algorithm("dock", None).unwrap().version, version("1.10.0"));
    assert_eq!(
        service.get_algorithm("dock", Some(&version("1.2.0"))).unwrap().id(),
        "dock@1.2.0"
    );

    service.unregister_algorithm("dock", &version("1.10.0")).unwrap();
    assert_eq!(service.get_algorithm("dock", None).unwrap().version, version("1.2.0"));
    assert!(matches!(
        service.unregister_algorithm("dock", &version("1.10.0")),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(matches!(
        service.get_algorithm("folding", None),
        Err(RegistryError::NotFound { .. })
    ));
}

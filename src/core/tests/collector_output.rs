//! Integration tests: loading collector output into a transfer batch.

use a3s_mirror_core::unit::{FailureSeverity, ImageType, OriginKey, TransferBatch, TransferFailure};

const BATCH: &str = r#"
units:
  - source: docker://quay.io/openshift/release:4.15-x86_64
    destination: docker://localhost:55000/openshift/release:4.15-x86_64
    origin: docker://quay.io/openshift/release:4.15-x86_64
    type: release
  - source: docker://registry.example.com/etcd/etcd-bundle:v1
    destination: docker://localhost:55000/etcd/etcd-bundle:v1
    origin: docker://registry.example.com/etcd/etcd-bundle:v1
    type: operator-bundle
  - source: docker://registry.example.com/etcd/etcd:3.5
    destination: docker://localhost:55000/etcd/etcd:3.5
    origin: docker://registry.example.com/etcd/etcd:3.5
    type: operator-related-image
  - source: docker://quay.io/org/tools:latest
    destination: docker://localhost:55000/org/tools:latest
    origin: quay.io/org/tools:latest
    type: generic
related:
  registry.example.com/etcd/etcd:3.5:
    operators: [etcd]
    bundles: [docker://registry.example.com/etcd/etcd-bundle:v1]
"#;

fn load() -> TransferBatch {
    let mut batch: TransferBatch = serde_yaml::from_str(BATCH).unwrap();
    batch.normalize();
    batch
}

#[test]
fn test_totals_computed_when_absent() {
    let batch = load();
    assert_eq!(batch.len(), 4);
    assert_eq!(batch.totals.release, 1);
    assert_eq!(batch.totals.operator, 2);
    assert_eq!(batch.totals.additional, 1);
    assert_eq!(batch.totals.helm, 0);
}

#[test]
fn test_related_image_failure_points_at_its_bundle() {
    let batch = load();
    let related = &batch.units[2];
    let bundle = &batch.units[1];
    assert_eq!(bundle.image_type, ImageType::OperatorBundle);

    // The index key carries no transport prefix; the unit origin does.
    let failure = TransferFailure::new(related.clone(), "manifest unknown")
        .with_referrers(batch.related.referrers(&related.origin));
    assert_eq!(failure.severity(), FailureSeverity::Recoverable);
    assert!(failure.references_bundle(&bundle.origin_key()));
    assert!(!failure.references_bundle(&OriginKey::from_origin("quay.io/org/tools:latest")));
    assert!(failure.to_string().contains("Operators: [etcd]"));
}

#[test]
fn test_release_failure_is_fatal() {
    let batch = load();
    let failure = TransferFailure::new(batch.units[0].clone(), "timed out");
    assert_eq!(failure.severity(), FailureSeverity::Fatal);
}

use xsd_cache::SchemaError;

use crate::common::test_helpers::*;

fn install_pair(harness: &Harness) {
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.resolver.insert(
        "urn:root",
        schema(
            "urn:root",
            &format!(
                "{}\n{}",
                import("urn:child", "urn:child"),
                element_requiring("order", "c", "item")
            ),
        ),
    );
}

#[tokio::test]
async fn test_each_get_returns_an_independent_handle() {
    let harness = Harness::new();
    install_pair(&harness);

    let first = harness.cache.get_by_uri("urn:root").await.unwrap();
    let second = harness.cache.get_by_uri("urn:root").await.unwrap();
    let artifact = first.artifact().unwrap();
    assert_eq!(artifact.id(), second.artifact().unwrap().id());
    assert_eq!(artifact.ref_count(), 3);

    second.close();
    second.close();
    assert_eq!(artifact.ref_count(), 2);
    assert!(matches!(
        second.artifact(),
        Err(SchemaError::ClosedHandle { .. })
    ));

    let mut errors: Vec<String> = Vec::new();
    assert!(matches!(
        second.validate(b"<order/>", &mut errors),
        Err(SchemaError::ClosedHandle { .. })
    ));
    assert!(second.dup().is_err());
    assert_eq!(harness.engine.compile_count("urn:root"), 1);
}

#[tokio::test]
async fn test_drop_releases_reference() {
    let harness = Harness::new();
    install_pair(&harness);

    let keeper = harness.cache.get_by_uri("urn:child").await.unwrap();
    {
        let _scoped = harness.cache.get_by_uri("urn:child").await.unwrap();
        assert_eq!(keeper.artifact().unwrap().ref_count(), 3);
    }
    assert_eq!(keeper.artifact().unwrap().ref_count(), 2);
}

#[tokio::test]
async fn test_dependencies_hold_handles_until_parent_closes() {
    let harness = Harness::new();
    install_pair(&harness);

    let root = harness.cache.get_by_uri("urn:root").await.unwrap();
    let child = harness.cache.get_by_uri("urn:child").await.unwrap();
    let child_artifact = child.artifact().unwrap();
    // slot, root's dependency handle, caller
    assert_eq!(child_artifact.ref_count(), 3);
    assert_eq!(child_artifact.exporters(), vec!["urn:root"]);

    harness.cache.invalidate("urn:root", false);
    assert!(!harness.cache.contains("urn:root"));
    assert!(harness.cache.contains("urn:child"));
    // The caller still holds the superseded root, which still holds the child
    assert_eq!(child_artifact.ref_count(), 3);

    root.close();
    assert_eq!(child_artifact.ref_count(), 2);
    assert!(child_artifact.exporters().is_empty());
}

#[tokio::test]
async fn test_superseded_artifact_stays_usable_for_holders() {
    let harness = Harness::new();
    install_pair(&harness);

    let held = harness.cache.get_by_uri("urn:child").await.unwrap();
    let copy = held.dup().unwrap();
    let old_id = held.artifact().unwrap().id();

    harness.cache.invalidate("urn:child", false);
    let artifact = held.artifact().unwrap();
    assert_eq!(artifact.ref_count(), 2);

    let mut errors: Vec<String> = Vec::new();
    held.validate(b"<item/>", &mut errors).unwrap();

    let fresh = harness.cache.get_by_uri("urn:child").await.unwrap();
    assert_ne!(fresh.artifact().unwrap().id(), old_id);

    held.close();
    assert!(copy.artifact().is_ok());
    copy.close();
    assert_eq!(fresh.artifact().unwrap().ref_count(), 2);
}

#[tokio::test]
async fn test_shutdown_keeps_caller_handles_open() {
    let harness = Harness::new();
    install_pair(&harness);

    let root = harness.cache.get_by_uri("urn:root").await.unwrap();
    harness.cache.shutdown();
    assert!(harness.cache.is_empty());

    let mut errors: Vec<String> = Vec::new();
    root.validate(
        br#"<order xmlns:c="urn:child"><c:item/></order>"#,
        &mut errors,
    )
    .unwrap();
    assert_eq!(root.artifact().unwrap().ref_count(), 1);
    root.close();
}

use std::fs;
use std::sync::Arc;

use rayon::prelude::*;
use tempfile::TempDir;

use xsd_cache::{
    FileSchemaResolver, NoAcceleration, SchemaCache, SchemaError, builtin::XML_NAMESPACE,
};

use crate::common::mocks::StubEngine;
use crate::common::test_helpers::*;

const CONFORMING: &[u8] =
    br#"<order xmlns="urn:root" xmlns:c="urn:child"><c:item>widget</c:item></order>"#;
const MISSING_CHILD: &[u8] = br#"<order xmlns="urn:root"/>"#;

fn root_schema() -> String {
    schema(
        "urn:root",
        &format!(
            "{}\n{}",
            import("urn:child", "urn:child"),
            element_requiring("order", "c", "item")
        ),
    )
}

#[tokio::test]
async fn test_register_validate_invalidate_refetch() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.cache.register("urn:root", None, &root_schema());

    let root = harness.cache.get_by_uri("urn:root").await.unwrap();
    let first_id = root.artifact().unwrap().id();
    assert_eq!(root.artifact().unwrap().imports(), vec!["urn:child"]);

    let mut errors: Vec<String> = Vec::new();
    root.validate(CONFORMING, &mut errors).unwrap();
    assert!(errors.is_empty());

    match root.validate(MISSING_CHILD, &mut errors) {
        Err(SchemaError::ValidationFailed {
            uri,
            error_count,
            first,
        }) => {
            assert_eq!(uri, "urn:root");
            assert_eq!(error_count, 1);
            assert!(first.contains("item"));
        }
        other => panic!("Expected ValidationFailed, got {:?}", other),
    }
    assert!(!errors.is_empty());

    root.close();
    harness.cache.invalidate("urn:child", false);
    assert!(!harness.cache.contains("urn:root"));

    let again = harness.cache.get_by_uri("urn:root").await.unwrap();
    let artifact = again.artifact().unwrap();
    assert_ne!(artifact.id(), first_id);
    assert_eq!(artifact.system_id(), "urn:root");
    assert_eq!(harness.engine.compile_count("urn:root"), 2);
    assert_eq!(harness.engine.compile_count("urn:child"), 2);
}

#[tokio::test]
async fn test_validate_all_reports_every_document() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.cache.register("urn:root", None, &root_schema());

    let root = harness.cache.get_by_uri("urn:root").await.unwrap();
    let mut errors: Vec<String> = Vec::new();
    let error = root
        .validate_all(&[CONFORMING, MISSING_CHILD, b"<invoice/>"], &mut errors)
        .unwrap_err();

    assert_eq!(
        errors,
        vec![
            "Missing required element 'item'",
            "Unexpected root element 'invoice'",
            "Missing required element 'item'",
        ]
    );
    match error {
        SchemaError::ValidationFailed { error_count, .. } => assert_eq!(error_count, 3),
        other => panic!("Expected ValidationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_parallel_validation_through_shared_handle() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.cache.register("urn:root", None, &root_schema());
    let root = harness.cache.get_by_uri("urn:root").await.unwrap();

    let documents: Vec<&[u8]> = (0..64)
        .map(|i| if i % 4 == 0 { MISSING_CHILD } else { CONFORMING })
        .collect();

    let outcomes: Vec<bool> = documents
        .par_iter()
        .map(|document| {
            let mut errors: Vec<String> = Vec::new();
            root.validate(document, &mut errors).is_ok()
        })
        .collect();

    assert_eq!(outcomes.iter().filter(|valid| !**valid).count(), 16);
    assert_eq!(harness.engine.compile_count("urn:root"), 1);
}

#[tokio::test]
async fn test_file_tree_with_relative_locations() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("types")).unwrap();
    fs::write(
        temp_dir.path().join("order.xsd"),
        schema(
            "urn:order",
            &format!(
                "{}\n{}\n{}",
                import("urn:types", "types/common.xsd"),
                include("order-parts.xsd"),
                element_requiring("order", "t", "amount")
            ),
        ),
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("order-parts.xsd"),
        schema("urn:order", &element("line")),
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("types/common.xsd"),
        schema("urn:types", &element("amount")),
    )
    .unwrap();

    let resolver = Arc::new(FileSchemaResolver::new(temp_dir.path()).unwrap());
    let cache = SchemaCache::builder(StubEngine::new())
        .accelerator(Arc::new(NoAcceleration))
        .resolver(resolver.clone())
        .build()
        .unwrap();

    let order_uri = resolver.uri_for("order.xsd").unwrap();
    let handle = cache.get_by_uri(&order_uri).await.unwrap();
    let artifact = handle.artifact().unwrap();

    assert_eq!(artifact.imports(), vec![resolver.uri_for("types/common.xsd").unwrap()]);
    assert_eq!(artifact.includes(), vec![resolver.uri_for("order-parts.xsd").unwrap()]);
    assert_eq!(artifact.source_resolver_id(), "file");
    assert!(!artifact.is_transient());
    assert_eq!(cache.len(), 3);

    let report = cache.report();
    assert!(report.starts_with(&format!("{} #", order_uri)));
    assert!(report.contains("  import "));
    assert!(report.contains("  include "));
}

#[tokio::test]
async fn test_builtin_xml_namespace_resolves_offline() {
    let engine = StubEngine::new();
    let cache = SchemaCache::builder(engine.clone())
        .with_builtin_schemas()
        .build()
        .unwrap();
    cache.register(
        "urn:doc",
        None,
        &schema(
            "urn:doc",
            &format!("{}\n{}", import_namespace(XML_NAMESPACE), element("doc")),
        ),
    );

    let handle = cache.get_by_uri("urn:doc").await.unwrap();
    assert_eq!(
        handle.artifact().unwrap().imports(),
        vec!["http://www.w3.org/2001/xml.xsd"]
    );
    assert!(cache.is_registered("http://www.w3.org/2001/xml.xsd"));
    assert_eq!(engine.compile_count("http://www.w3.org/2001/xml.xsd"), 1);
}

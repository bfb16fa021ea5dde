use std::sync::Arc;

use futures::future::join_all;

use xsd_cache::{NoAcceleration, SchemaError, SourceResolver};

use crate::common::mocks::{ENGINE_FAILURE_MARKER, MemoryResolver};
use crate::common::test_helpers::*;

fn with_remote() -> (Harness, Arc<MemoryResolver>) {
    let remote = MemoryResolver::remote("remote");
    let extra: Vec<Arc<dyn SourceResolver>> = vec![remote.clone()];
    let harness = Harness::build(test_config(), Arc::new(NoAcceleration), extra);
    (harness, remote)
}

#[tokio::test]
async fn test_mutual_imports_compile_once() {
    let harness = Harness::new();
    harness.resolver.insert(
        "urn:a",
        schema("urn:a", &format!("{}\n{}", import("urn:b", "urn:b"), element("a"))),
    );
    harness.resolver.insert(
        "urn:b",
        schema("urn:b", &format!("{}\n{}", import("urn:a", "urn:a"), element("b"))),
    );

    let a = harness.cache.get_by_uri("urn:a").await.unwrap();
    assert_eq!(a.artifact().unwrap().imports(), vec!["urn:b"]);

    let b = harness.cache.get_by_uri("urn:b").await.unwrap();
    assert!(b.artifact().unwrap().imports().is_empty());
    assert_eq!(harness.engine.compile_count("urn:a"), 1);
    assert_eq!(harness.engine.compile_count("urn:b"), 1);
}

#[tokio::test]
async fn test_self_include_is_skipped() {
    let harness = Harness::new();
    harness.resolver.insert(
        "urn:loop",
        schema("urn:loop", &format!("{}\n{}", include("urn:loop"), element("x"))),
    );

    let handle = harness.cache.get_by_uri("urn:loop").await.unwrap();
    assert!(handle.artifact().unwrap().includes().is_empty());
}

#[tokio::test]
async fn test_failed_dependency_releases_acquired_handles() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:good", schema("urn:good", &element("good")));
    harness
        .resolver
        .insert("urn:broken", r#"<xs:element name="broken"/>"#);
    harness.resolver.insert(
        "urn:root",
        schema(
            "urn:root",
            &format!(
                "{}\n{}",
                import("urn:good", "urn:good"),
                import("urn:broken", "urn:broken")
            ),
        ),
    );

    let error = harness.cache.get_by_uri("urn:root").await.unwrap_err();
    match &error {
        SchemaError::UnresolvedDependency { uri, reference, .. } => {
            assert_eq!(uri, "urn:root");
            assert_eq!(reference, "urn:broken");
        }
        other => panic!("Expected UnresolvedDependency, got {:?}", other),
    }
    assert!(error.is_invalid());
    assert!(matches!(
        error.root_cause(),
        SchemaError::Invalid { uri, .. } if uri == "urn:broken"
    ));

    assert!(!harness.cache.contains("urn:root"));
    assert!(!harness.cache.contains("urn:broken"));
    let good = harness.cache.get_by_uri("urn:good").await.unwrap();
    // slot and this caller; the failed root released its handle
    assert_eq!(good.artifact().unwrap().ref_count(), 2);
    assert!(good.artifact().unwrap().exporters().is_empty());
}

#[tokio::test]
async fn test_engine_internal_failure_is_unclassified() {
    let harness = Harness::new();
    harness.resolver.insert(
        "urn:odd",
        schema("urn:odd", &format!("{}\n{}", ENGINE_FAILURE_MARKER, element("x"))),
    );

    let error = harness.cache.get_by_uri("urn:odd").await.unwrap_err();
    assert!(matches!(error, SchemaError::Unclassified { .. }));
    assert!(error.is_invalid());
}

#[tokio::test]
async fn test_missing_dependency_is_io() {
    let harness = Harness::new();
    harness.resolver.insert(
        "urn:root",
        schema("urn:root", &import("urn:absent", "urn:absent")),
    );

    let error = harness.cache.get_by_uri("urn:root").await.unwrap_err();
    assert!(error.is_io());
    assert!(matches!(error, SchemaError::UnresolvedDependency { .. }));
}

#[tokio::test]
async fn test_unresolved_reference_inside_dependency_fails_compile() {
    let harness = Harness::new();
    harness.resolver.insert(
        "urn:child",
        schema("urn:child", &element_requiring("wrapper", "g", "missing")),
    );
    harness.resolver.insert(
        "urn:root",
        schema("urn:root", &import("urn:child", "urn:child")),
    );

    let error = harness.cache.get_by_uri("urn:root").await.unwrap_err();
    match error.root_cause() {
        SchemaError::Invalid { uri, details } => {
            assert_eq!(uri, "urn:child");
            assert!(details.contains("missing"));
        }
        other => panic!("Expected Invalid root cause, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cached_dependency_is_reused() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.resolver.insert(
        "urn:root",
        schema("urn:root", &import("urn:child", "urn:child")),
    );
    harness.resolver.insert(
        "urn:other",
        schema("urn:other", &import("urn:child", "urn:child")),
    );

    let _root = harness.cache.get_by_uri("urn:root").await.unwrap();
    let _other = harness.cache.get_by_uri("urn:other").await.unwrap();

    assert_eq!(harness.engine.compile_count("urn:child"), 1);
    assert_eq!(harness.resolver.fetch_count("urn:child"), 1);
    let child = harness.cache.get_by_uri("urn:child").await.unwrap();
    assert_eq!(
        child.artifact().unwrap().exporters(),
        vec!["urn:other", "urn:root"]
    );
}

#[tokio::test]
async fn test_import_by_namespace_only() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:types.xsd", schema("urn:types", &element("amount")));
    harness.resolver.map_namespace("urn:types", "urn:types.xsd");
    harness.resolver.insert(
        "urn:root",
        schema(
            "urn:root",
            &format!(
                "{}\n{}",
                import_namespace("urn:types"),
                element_requiring("total", "t", "amount")
            ),
        ),
    );

    let root = harness.cache.get_by_uri("urn:root").await.unwrap();
    assert_eq!(root.artifact().unwrap().imports(), vec!["urn:types.xsd"]);
}

#[tokio::test]
async fn test_policy_schema_may_not_fetch_remote() {
    let (harness, remote) = with_remote();
    remote.insert(
        "http://example.com/remote.xsd",
        schema("urn:remote", &element("r")),
    );
    harness.cache.register(
        "policy:assertion-7",
        None,
        &schema(
            "urn:policy",
            &import("urn:remote", "http://example.com/remote.xsd"),
        ),
    );

    let error = harness
        .cache
        .get_by_uri("policy:assertion-7")
        .await
        .unwrap_err();
    assert!(error.is_io());
    match error.root_cause() {
        SchemaError::Io { details, .. } => assert!(details.contains("policy-scoped")),
        other => panic!("Expected Io root cause, got {:?}", other),
    }
    assert_eq!(remote.fetch_count("http://example.com/remote.xsd"), 0);

    let mut config = test_config();
    config.network.allow_remote_from_policy = true;
    harness.cache.update_config(config).unwrap();

    let handle = harness.cache.get_by_uri("policy:assertion-7").await.unwrap();
    assert_eq!(
        handle.artifact().unwrap().imports(),
        vec!["http://example.com/remote.xsd"]
    );
    let remote_child = harness
        .cache
        .get_by_uri("http://example.com/remote.xsd")
        .await
        .unwrap();
    assert!(remote_child.artifact().unwrap().is_transient());
    assert_eq!(remote_child.artifact().unwrap().source_resolver_id(), "remote");
}

#[tokio::test]
async fn test_policy_references_are_rejected() {
    let harness = Harness::new();
    harness
        .cache
        .register("policy:inner", None, &schema("urn:inner", &element("i")));
    harness.cache.register(
        "urn:outer",
        None,
        &schema("urn:outer", &import("urn:inner", "policy:inner")),
    );

    let error = harness.cache.get_by_uri("urn:outer").await.unwrap_err();
    match error.root_cause() {
        SchemaError::Io { uri, details } => {
            assert_eq!(uri, "policy:inner");
            assert!(details.contains("policy:"));
        }
        other => panic!("Expected Io root cause, got {:?}", other),
    }
    // Directly requested, a policy schema is fine
    assert!(harness.cache.get_by_uri("policy:inner").await.is_ok());
}

#[tokio::test]
async fn test_remote_pattern_limits_fetches() {
    let (harness, remote) = with_remote();
    remote.insert(
        "http://untrusted.example/a.xsd",
        schema("urn:a", &element("a")),
    );
    let mut config = test_config();
    config.network.allow_pattern = r"^https://trusted\.example/".to_string();
    harness.cache.update_config(config).unwrap();

    let error = harness
        .cache
        .get_by_uri("http://untrusted.example/a.xsd")
        .await
        .unwrap_err();
    match error {
        SchemaError::Io { details, .. } => assert!(details.contains("remote URL pattern")),
        other => panic!("Expected Io error, got {:?}", other),
    }
    assert_eq!(remote.fetch_count("http://untrusted.example/a.xsd"), 0);
}

#[tokio::test]
async fn test_relative_locations_resolve_against_remote_parent() {
    let (harness, remote) = with_remote();
    remote.insert(
        "http://example.com/schemas/root.xsd",
        schema("urn:r", &format!("{}\n{}", include("parts/common.xsd"), element("r"))),
    );
    remote.insert(
        "http://example.com/schemas/parts/common.xsd",
        schema("urn:r", &element("common")),
    );

    let root = harness
        .cache
        .get_by_uri("http://example.com/schemas/root.xsd")
        .await
        .unwrap();
    assert_eq!(
        root.artifact().unwrap().includes(),
        vec!["http://example.com/schemas/parts/common.xsd"]
    );
}

#[tokio::test]
async fn test_doctype_is_rejected_unless_allowed() {
    let text = format!(
        "<!DOCTYPE xs:schema [<!ENTITY e \"x\">]>\n{}",
        schema("urn:dtd", &element("d"))
    );
    let harness = Harness::new();
    harness.resolver.insert("urn:dtd", text.clone());

    let error = harness.cache.get_by_uri("urn:dtd").await.unwrap_err();
    match error {
        SchemaError::Invalid { details, .. } => assert!(details.contains("DOCTYPE")),
        other => panic!("Expected Invalid error, got {:?}", other),
    }

    let mut config = test_config();
    config.validation.allow_doctype = true;
    let permissive = Harness::with_config(config);
    permissive.resolver.insert("urn:dtd", text);
    assert!(permissive.cache.get_by_uri("urn:dtd").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_compile_once() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:child", schema("urn:child", &element("item")));
    harness.resolver.insert(
        "urn:root",
        schema("urn:root", &import("urn:child", "urn:child")),
    );

    let tasks = (0..8).map(|_| {
        let cache = harness.cache.clone();
        tokio::spawn(async move {
            let handle = cache.get_by_uri("urn:root").await.unwrap();
            handle.artifact().unwrap().id()
        })
    });
    let ids: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(harness.engine.compile_count("urn:root"), 1);
    assert_eq!(harness.engine.compile_count("urn:child"), 1);
}

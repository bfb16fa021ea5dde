use std::collections::HashMap;
use std::sync::Arc;

use xsd_cache::{HardwareState, ReloadSummary, SchemaError, ValidationResult};

use crate::common::mocks::{MockAccelerator, RecordingAccelerator};
use crate::common::test_helpers::*;

fn accelerated() -> (Harness, Arc<RecordingAccelerator>) {
    let accelerator = RecordingAccelerator::new();
    let harness = Harness::with_accelerator(accelerator.clone());
    (harness, accelerator)
}

async fn state_of(harness: &Harness, uri: &str) -> HardwareState {
    let handle = harness.cache.get_by_uri(uri).await.unwrap();
    handle.artifact().unwrap().hardware_state()
}

#[tokio::test]
async fn test_promotion_waits_for_quiet_period() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));

    let handle = harness.cache.get_by_uri("urn:a").await.unwrap();
    assert_eq!(
        handle.artifact().unwrap().hardware_state(),
        HardwareState::PendingPromotion
    );
    assert_eq!(harness.cache.pending_promotions(), 1);
    assert!(!harness.cache.maybe_reload_hardware());

    harness.clock.advance(99);
    assert!(!harness.cache.maybe_reload_hardware());
    harness.clock.advance(1);
    assert!(harness.cache.maybe_reload_hardware());

    assert_eq!(accelerator.loads(), vec![vec!["urn:a".to_string()]]);
    assert_eq!(
        handle.artifact().unwrap().hardware_state(),
        HardwareState::Eligible
    );
    assert_eq!(harness.cache.pending_promotions(), 0);
    assert_eq!(harness.cache.stats().eligible, 1);

    let mut errors: Vec<String> = Vec::new();
    handle.validate(b"<a/>", &mut errors).unwrap();
    assert_eq!(accelerator.hardware_validations(), 1);
}

#[tokio::test]
async fn test_steady_arrivals_reload_at_max_age() {
    let (harness, accelerator) = accelerated();
    for k in 0..=20 {
        let uri = format!("urn:n{}", k);
        harness.resolver.insert(&uri, schema(&uri, &element("n")));
    }

    let mut handles = Vec::new();
    for k in 0..=20 {
        if k > 0 {
            harness.clock.advance(50);
        }
        handles.push(harness.cache.get_by_uri(&format!("urn:n{}", k)).await.unwrap());
        assert_eq!(harness.cache.maybe_reload_hardware(), k == 20, "step {}", k);
    }

    assert_eq!(accelerator.loads().len(), 1);
    assert_eq!(accelerator.loads()[0].len(), 21);
}

#[tokio::test]
async fn test_reloads_are_spaced_by_latency() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));
    harness
        .resolver
        .insert("urn:b", schema("urn:b", &element("b")));

    let _a = harness.cache.get_by_uri("urn:a").await.unwrap();
    harness.clock.advance(100);
    assert!(harness.cache.maybe_reload_hardware());

    let _b = harness.cache.get_by_uri("urn:b").await.unwrap();
    harness.clock.advance(150);
    assert!(!harness.cache.maybe_reload_hardware());
    harness.clock.advance(50);
    assert!(harness.cache.maybe_reload_hardware());

    assert_eq!(accelerator.loads().len(), 2);
    assert_eq!(
        accelerator.loads()[1],
        vec!["urn:a".to_string(), "urn:b".to_string()]
    );
    // Nothing pending and nothing demoted: no further reload
    harness.clock.advance(10_000);
    assert!(!harness.cache.maybe_reload_hardware());
}

#[tokio::test]
async fn test_namespace_conflict_cascades_and_recovers() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:s1", schema("urn:shared", &element("one")));
    harness.resolver.insert(
        "urn:user",
        schema(
            "urn:user",
            &format!(
                "{}\n{}",
                import("urn:shared", "urn:s1"),
                element_requiring("use", "s", "one")
            ),
        ),
    );

    let user = harness.cache.get_by_uri("urn:user").await.unwrap();
    let s1 = harness.cache.get_by_uri("urn:s1").await.unwrap();
    assert_eq!(s1.artifact().unwrap().hardware_state(), HardwareState::PendingPromotion);
    // An importer waits until its imports are resident
    assert_eq!(user.artifact().unwrap().hardware_state(), HardwareState::Ineligible);

    harness.clock.advance(100);
    assert!(harness.cache.maybe_reload_hardware());
    assert_eq!(s1.artifact().unwrap().hardware_state(), HardwareState::Eligible);
    assert_eq!(user.artifact().unwrap().hardware_state(), HardwareState::PendingPromotion);

    harness.clock.advance(100);
    assert!(!harness.cache.maybe_reload_hardware());
    harness.clock.advance(100);
    assert!(harness.cache.maybe_reload_hardware());
    assert_eq!(
        accelerator.loads()[1],
        vec!["urn:s1".to_string(), "urn:user".to_string()]
    );
    assert_eq!(user.artifact().unwrap().hardware_state(), HardwareState::Eligible);

    // A second claimant on urn:shared
    harness
        .cache
        .register("urn:s2", None, &schema("urn:shared", &element("two")));
    let s2 = harness.cache.get_by_uri("urn:s2").await.unwrap();
    assert!(s1.artifact().unwrap().is_conflicting());
    assert!(s2.artifact().unwrap().is_conflicting());
    assert!(!user.artifact().unwrap().is_conflicting());
    assert_eq!(s1.artifact().unwrap().hardware_state(), HardwareState::Ineligible);
    assert_eq!(user.artifact().unwrap().hardware_state(), HardwareState::Ineligible);
    assert_eq!(harness.cache.stats().conflicting, 2);
    s2.close();

    // The demotion alone is reason to reload
    harness.clock.advance(100);
    assert!(!harness.cache.maybe_reload_hardware());
    harness.clock.advance(100);
    assert!(harness.cache.maybe_reload_hardware());
    assert!(accelerator.loads()[2].is_empty());

    harness.cache.unregister("urn:s2");
    assert!(!s1.artifact().unwrap().is_conflicting());
    assert_eq!(s1.artifact().unwrap().hardware_state(), HardwareState::PendingPromotion);

    harness.clock.advance(200);
    assert!(harness.cache.maybe_reload_hardware());
    harness.clock.advance(200);
    assert!(harness.cache.maybe_reload_hardware());
    assert_eq!(
        accelerator.loads()[4],
        vec!["urn:s1".to_string(), "urn:user".to_string()]
    );
    assert_eq!(user.artifact().unwrap().hardware_state(), HardwareState::Eligible);
}

#[tokio::test]
async fn test_replaced_artifact_held_open_conflicts_with_replacement() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:n", &element("a")));

    let old = harness.cache.get_by_uri("urn:a").await.unwrap();
    harness.cache.reload_hardware();
    assert_eq!(old.artifact().unwrap().hardware_state(), HardwareState::Eligible);

    harness
        .resolver
        .insert("urn:a", schema("urn:n", &element("b")));
    harness.cache.invalidate("urn:a", false);
    let new = harness.cache.get_by_uri("urn:a").await.unwrap();
    assert_ne!(old.artifact().unwrap().id(), new.artifact().unwrap().id());

    // Both instances claim urn:n while the old one is still open
    assert!(old.artifact().unwrap().is_conflicting());
    assert!(new.artifact().unwrap().is_conflicting());
    assert_eq!(old.artifact().unwrap().hardware_state(), HardwareState::Ineligible);
    assert_eq!(new.artifact().unwrap().hardware_state(), HardwareState::Ineligible);
    harness.cache.reload_hardware();
    assert!(accelerator.loads()[1].is_empty());

    old.close();
    let replacement = new.artifact().unwrap();
    assert!(!replacement.is_conflicting());
    assert_eq!(replacement.hardware_state(), HardwareState::PendingPromotion);

    harness.cache.reload_hardware();
    assert_eq!(accelerator.loads()[2], vec!["urn:a".to_string()]);
    assert_eq!(replacement.hardware_state(), HardwareState::Eligible);
}

#[tokio::test]
async fn test_include_only_schema_is_never_resident() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:part", schema("urn:m", &element("part")));
    harness.resolver.insert(
        "urn:main",
        schema("urn:m", &format!("{}\n{}", include("urn:part"), element("main"))),
    );

    let main = harness.cache.get_by_uri("urn:main").await.unwrap();
    let part = harness.cache.get_by_uri("urn:part").await.unwrap();
    assert!(part.artifact().unwrap().is_include_only());
    assert!(!main.artifact().unwrap().is_conflicting());
    assert!(!part.artifact().unwrap().is_conflicting());
    assert_eq!(part.artifact().unwrap().hardware_state(), HardwareState::Ineligible);

    let summary = harness.cache.reload_hardware();
    assert_eq!(
        summary,
        ReloadSummary {
            resident: 1,
            promoted: 1,
            rejected: 0,
        }
    );
    assert_eq!(accelerator.loads(), vec![vec!["urn:main".to_string()]]);
}

#[tokio::test]
async fn test_load_failure_rejects_only_that_schema() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));
    harness
        .resolver
        .insert("urn:b", schema("urn:b", &element("b")));
    accelerator.fail_on_load("urn:a");

    let a = harness.cache.get_by_uri("urn:a").await.unwrap();
    let b = harness.cache.get_by_uri("urn:b").await.unwrap();

    let summary = harness.cache.reload_hardware();
    assert_eq!(summary.resident, 2);
    assert_eq!(summary.promoted, 1);
    assert_eq!(summary.rejected, 1);

    let a = a.artifact().unwrap();
    assert!(a.is_rejected());
    assert_eq!(a.hardware_state(), HardwareState::Ineligible);
    assert_eq!(b.artifact().unwrap().hardware_state(), HardwareState::Eligible);

    // Rejection sticks to the artifact
    harness.cache.reload_hardware();
    assert_eq!(accelerator.loads()[1], vec!["urn:b".to_string()]);
    assert_eq!(state_of(&harness, "urn:a").await, HardwareState::Ineligible);
}

#[tokio::test]
async fn test_check_rejection_keeps_schema_in_software() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));
    accelerator.reject("urn:a");

    let handle = harness.cache.get_by_uri("urn:a").await.unwrap();
    assert!(handle.artifact().unwrap().is_rejected());
    assert_eq!(harness.cache.pending_promotions(), 0);

    let mut errors: Vec<String> = Vec::new();
    handle.validate(b"<a/>", &mut errors).unwrap();
    assert_eq!(accelerator.hardware_validations(), 0);
}

#[tokio::test]
async fn test_no_acceleration_never_promotes() {
    let harness = Harness::new();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));

    assert_eq!(state_of(&harness, "urn:a").await, HardwareState::Ineligible);
    assert_eq!(harness.cache.pending_promotions(), 0);
    harness.clock.advance(10_000);
    assert!(!harness.cache.maybe_reload_hardware());
}

#[tokio::test]
async fn test_declined_validation_falls_back_to_software() {
    let (harness, accelerator) = accelerated();
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));
    let handle = harness.cache.get_by_uri("urn:a").await.unwrap();
    harness.cache.reload_hardware();
    accelerator.decline();

    let mut errors: Vec<String> = Vec::new();
    assert!(handle.validate(b"<other/>", &mut errors).is_err());
    assert_eq!(errors, vec!["Unexpected root element 'other'"]);
    assert_eq!(accelerator.hardware_validations(), 0);
}

#[tokio::test]
async fn test_declined_validation_without_fallback_fails() {
    let (harness, accelerator) = accelerated();
    let mut config = test_config();
    config.validation.software_fallback = false;
    harness.cache.update_config(config).unwrap();

    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));
    let handle = harness.cache.get_by_uri("urn:a").await.unwrap();
    harness.cache.reload_hardware();
    accelerator.decline();

    let mut errors: Vec<String> = Vec::new();
    match handle.validate(b"<a/>", &mut errors) {
        Err(SchemaError::Acceleration { details }) => assert!(details.contains("urn:a")),
        other => panic!("Expected Acceleration error, got {:?}", other),
    }
    assert!(errors.is_empty());
}

#[tokio::test]
async fn test_resident_set_contract_with_mock_engine() {
    let mut accelerator = MockAccelerator::new();
    accelerator.expect_is_available().return_const(true);
    accelerator
        .expect_check()
        .withf(|schema| schema.system_id == "urn:a" && schema.target_namespace == "urn:a")
        .times(1)
        .returning(|_| Ok(()));
    accelerator
        .expect_set_resident_set()
        .withf(|schemas| schemas.len() == 1 && schemas[0].system_id == "urn:a")
        .times(1)
        .returning(|_| HashMap::new());
    accelerator
        .expect_validate()
        .times(1)
        .returning(|_, _| Some(ValidationResult::Valid));

    let harness = Harness::with_accelerator(Arc::new(accelerator));
    harness
        .resolver
        .insert("urn:a", schema("urn:a", &element("a")));

    let handle = harness.cache.get_by_uri("urn:a").await.unwrap();
    let summary = harness.cache.reload_hardware();
    assert_eq!(summary.promoted, 1);

    let mut errors: Vec<String> = Vec::new();
    handle.validate(b"<anything/>", &mut errors).unwrap();
}

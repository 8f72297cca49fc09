//! End-to-end cascade behaviour against the in-memory cluster.
//!
//! These tests verify that:
//! - Only stale dependents of the changed resource are triggered
//! - A second pass after the references are re-stamped triggers nothing
//! - Dependents of other resources in the same namespace are never touched
//! - A deleted configuration resource reconciles cleanly with zero triggers

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use confcascade_core::{
    ConfigurationResource, ControllerConfig, Dependent, ObjectKey, DEFAULT_REFERENCE_PATH,
};
use confcascade_reconciler::{
    Controller, InMemoryCluster, Notification, ReconcileOutcome, Reconciler, ResourceReader,
};
use serde_json::{json, Value};

fn shoot_spec(config_name: &str, version: &str) -> Value {
    json!({
        "kubernetes": {
            "version": "1.30.2",
            "kubeAPIServer": {"auditConfig": {"auditPolicy": {
                "configMapRef": {"name": config_name, "resourceVersion": version}
            }}}
        }
    })
}

async fn cluster_with(
    configs: &[(&str, &str)],
    dependents: &[(&str, &str, &str)],
) -> Arc<InMemoryCluster> {
    let cluster =
        Arc::new(InMemoryCluster::new().with_reference_defaulting(DEFAULT_REFERENCE_PATH));
    for (name, version) in configs {
        cluster
            .insert_configuration(
                ConfigurationResource::new("cfg", *name)
                    .with_resource_version(*version)
                    .with_entry("policy", "C1"),
            )
            .await
            .unwrap();
    }
    for (name, config_name, version) in dependents {
        cluster
            .insert_dependent(Dependent::new("cfg", *name, shoot_spec(config_name, version)))
            .await
            .unwrap();
    }
    cluster
}

/// # GIVEN
/// `cfg/A` at `v1`, `dep/X` recording `{A, v1}` and `dep/Y` recording `{A, v0}`
///
/// # WHEN
/// `A` changes to content `C2` at `v2`, and `X` is re-stamped to `v2` externally
///
/// # THEN
/// One pass triggers `Y` only; once `Y` records `v2` too, a repeat pass triggers neither
#[tokio::test]
async fn test_scenario_cascade_reaches_only_stale_dependents() {
    let cluster = cluster_with(&[("A", "v1")], &[("X", "A", "v1"), ("Y", "A", "v0")]).await;
    let reconciler = Reconciler::for_api(cluster.clone(), &ControllerConfig::default());
    let key = ObjectKey::new("cfg", "A");

    let previous = cluster.configuration(&key).await.unwrap();
    let current = ConfigurationResource::new("cfg", "A")
        .with_resource_version("v2")
        .with_entry("policy", "C2");
    assert!(confcascade_reconciler::content_changed(&previous, &current));
    cluster.insert_configuration(current).await.unwrap();
    cluster
        .insert_dependent(Dependent::new("cfg", "X", shoot_spec("A", "v2")))
        .await
        .unwrap();

    let first = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(first.triggered(), &[ObjectKey::new("cfg", "Y")]);
    assert_eq!(cluster.patches().await, vec![ObjectKey::new("cfg", "Y")]);

    cluster.clear_patches().await;
    let second = reconciler.reconcile(&key).await.unwrap();
    assert!(second.triggered().is_empty());
    assert!(cluster.patches().await.is_empty());
}

#[tokio::test]
async fn test_idempotent_second_pass() {
    let cluster = cluster_with(
        &[("A", "v5")],
        &[("a", "A", "v1"), ("b", "A", "v2"), ("c", "A", "v5")],
    )
    .await;
    let reconciler = Reconciler::for_api(cluster.clone(), &ControllerConfig::default());
    let key = ObjectKey::new("cfg", "A");

    let first = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(first.triggered().len(), 2);

    let second = reconciler.reconcile(&key).await.unwrap();
    assert!(second.triggered().is_empty());
    assert!(matches!(second, ReconcileOutcome::Reconciled { current: 3, .. }));
    assert_eq!(cluster.patches().await.len(), 2);
}

#[tokio::test]
async fn test_dependents_of_other_resources_are_isolated() {
    let cluster = cluster_with(
        &[("A", "v2"), ("B", "v9")],
        &[("onA", "A", "v1"), ("onB", "B", "v1")],
    )
    .await;
    let reconciler = Reconciler::for_api(cluster.clone(), &ControllerConfig::default());

    let outcome = reconciler.reconcile(&ObjectKey::new("cfg", "A")).await.unwrap();

    assert_eq!(outcome.triggered(), &[ObjectKey::new("cfg", "onA")]);
    assert!(matches!(outcome, ReconcileOutcome::Reconciled { unrelated: 1, .. }));
    let on_b = cluster.dependent(&ObjectKey::new("cfg", "onB")).await.unwrap();
    assert_eq!(on_b.spec, shoot_spec("B", "v1"));
}

#[tokio::test]
async fn test_deleted_configuration_reconciles_without_triggers() {
    let cluster = cluster_with(&[("A", "v2")], &[("X", "A", "v1")]).await;
    let reconciler = Reconciler::for_api(cluster.clone(), &ControllerConfig::default());
    let key = ObjectKey::new("cfg", "A");
    cluster.delete_configuration(&key).await;

    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Gone { key });
    assert!(cluster.patches().await.is_empty());
}

#[tokio::test]
async fn test_dependent_deleted_before_trigger_is_skipped() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .insert_configuration(ConfigurationResource::new("cfg", "A").with_resource_version("v2"))
        .await
        .unwrap();

    // Lister sees the dependent, but the patch lands after it was deleted.
    struct Vanishing {
        inner: Arc<InMemoryCluster>,
    }

    #[async_trait::async_trait]
    impl ResourceReader for Vanishing {
        async fn get_configuration(
            &self,
            key: &ObjectKey,
        ) -> confcascade_reconciler::Result<ConfigurationResource> {
            self.inner.get_configuration(key).await
        }

        async fn list_dependents(
            &self,
            _namespace: &str,
            _selector: &confcascade_core::LabelSelector,
        ) -> confcascade_reconciler::Result<Vec<Dependent>> {
            Ok(vec![Dependent::new("cfg", "ghost", shoot_spec("A", "v1"))])
        }
    }

    let reconciler = confcascade_reconciler::ReconcilerBuilder::new()
        .with_reader(Arc::new(Vanishing {
            inner: cluster.clone(),
        }))
        .with_writer(cluster.clone())
        .build()
        .unwrap();

    let outcome = reconciler.reconcile(&ObjectKey::new("cfg", "A")).await.unwrap();
    assert!(outcome.triggered().is_empty());
}

/// # GIVEN
/// A running controller over a cluster with defaulting
///
/// # WHEN
/// Notifications arrive: an add, a version-only bump, and a content change
///
/// # THEN
/// The stale dependent is refreshed and the cluster converges
#[tokio::test]
async fn test_controller_converges_from_notifications() {
    let cluster = cluster_with(&[], &[("X", "A", "old"), ("Y", "A", "old")]).await;
    let config = ControllerConfig {
        workers: 3,
        ..ControllerConfig::default()
    };
    let reconciler = Arc::new(Reconciler::for_api(cluster.clone(), &config));
    let controller = Controller::new(reconciler, config).unwrap();
    let filter = controller.filter();
    let handle = controller.handle();

    let v1 = cluster
        .upsert_configuration(ConfigurationResource::new("cfg", "A").with_entry("policy", "C1"))
        .await
        .unwrap();
    assert!(filter.on_notify(&Notification::Added(v1.clone())));

    let relabelled = cluster.upsert_configuration(v1.clone()).await.unwrap();
    assert!(!filter.on_notify(&Notification::updated(v1.clone(), relabelled.clone())));

    let v3 = cluster
        .upsert_configuration(relabelled.clone().with_entry("policy", "C2"))
        .await
        .unwrap();
    assert!(filter.on_notify(&Notification::updated(relabelled, v3.clone())));

    handle.drain();
    tokio::time::timeout(Duration::from_secs(5), controller.run())
        .await
        .unwrap();

    for name in ["X", "Y"] {
        let dependent = cluster.dependent(&ObjectKey::new("cfg", name)).await.unwrap();
        let recorded = dependent
            .spec
            .pointer("/kubernetes/kubeAPIServer/auditConfig/auditPolicy/configMapRef/resourceVersion");
        assert_eq!(recorded, Some(&json!(v3.version())));
    }
}

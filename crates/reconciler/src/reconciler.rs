//! Reconciler implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use confcascade_core::{ControllerConfig, ReconcileKey, ReferenceConfig};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resolver::DependencyResolver;
use crate::staleness;
use crate::store::{ResourceReader, ResourceWriter};
use crate::trigger::{CascadeTrigger, EmptyPatchTrigger, TriggerOutcome};
use crate::types::ReconcileOutcome;

/// Deadline and cancellation bound to one reconciliation call.
///
/// Every blocking step is raced against both. Triggers already sent when
/// the race is lost stay sent.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    deadline: Option<Instant>,
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl ReconcileContext {
    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            timeout,
            cancel: None,
        }
    }

    /// Also cancel when `stop` flips to `true`.
    #[must_use]
    pub fn with_cancellation(mut self, stop: watch::Receiver<bool>) -> Self {
        self.cancel = Some(stop);
        self
    }

    /// Whether the cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|stop| *stop.borrow())
    }

    /// Run `fut` unless the deadline passes or the context is cancelled first.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`], [`Error::DeadlineExceeded`], or whatever `fut` returns.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            () = cancelled(cancel.as_mut()) => Err(Error::Cancelled),
            () = expired(self.deadline) => {
                Err(Error::deadline_exceeded(
                    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
            result = fut => result,
        }
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn cancelled(stop: Option<&mut watch::Receiver<bool>>) {
    match stop {
        Some(stop) => {
            if stop.wait_for(|stopped| *stopped).await.is_err() {
                // Sender dropped without stopping: never cancel.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Propagates configuration changes to the dependents that reference them.
pub struct Reconciler {
    reader: Arc<dyn ResourceReader>,
    resolver: DependencyResolver,
    trigger: Arc<dyn CascadeTrigger>,
    timeout: Duration,
}

impl Reconciler {
    /// Create a reconciler from its parts.
    pub fn new(
        reader: Arc<dyn ResourceReader>,
        resolver: DependencyResolver,
        trigger: Arc<dyn CascadeTrigger>,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            resolver,
            trigger,
            timeout,
        }
    }

    /// Create a reconciler that reads and patches through one API handle.
    pub fn for_api<A>(api: Arc<A>, config: &ControllerConfig) -> Self
    where
        A: ResourceReader + ResourceWriter + 'static,
    {
        let resolver = DependencyResolver::new(api.clone(), &config.reference);
        let trigger = Arc::new(EmptyPatchTrigger::new(api.clone()));
        Self::new(api, resolver, trigger, config.reconcile_timeout())
    }

    /// Reconcile `key` under the default deadline.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile_with`].
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<ReconcileOutcome> {
        self.reconcile_with(key, &ReconcileContext::with_timeout(self.timeout))
            .await
    }

    /// Core reconciliation: fetch, resolve dependents, trigger the stale ones.
    ///
    /// A deleted configuration resource is a successful [`ReconcileOutcome::Gone`].
    ///
    /// # Errors
    ///
    /// Retryable errors for fetch/list failures, cancellation, any failed
    /// trigger ([`Error::TriggerFailed`]), or malformed references. Every
    /// well-formed stale dependent is still triggered before a failed
    /// trigger or malformed reference is reported.
    pub async fn reconcile_with(
        &self,
        key: &ReconcileKey,
        ctx: &ReconcileContext,
    ) -> Result<ReconcileOutcome> {
        let config = match ctx.guard(self.reader.get_configuration(key)).await {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                info!(key = %key, "Object is gone, stop reconciling");
                return Ok(ReconcileOutcome::Gone { key: key.clone() });
            }
            Err(e) => {
                info!(key = %key, error = %e, "Unable to retrieve object from store");
                return Err(e);
            }
        };

        let dependents = ctx
            .guard(self.resolver.list_dependents(&config.metadata.namespace))
            .await?;
        let resolution = self.resolver.select(&config, dependents);

        debug!(
            key = %key,
            version = %config.version(),
            referencing = resolution.referencing.len(),
            unrelated = resolution.unrelated,
            "Resolved dependents"
        );

        let mut triggered = Vec::new();
        let mut failures = Vec::new();
        let mut current = 0usize;
        let unrelated = resolution.unrelated;

        for entry in resolution.referencing {
            if !staleness::is_stale(&entry.reference, &config) {
                current = current.saturating_add(1);
                continue;
            }
            info!(
                dependent = %entry.key,
                recorded = ?entry.reference.recorded_version,
                version = %config.version(),
                "Scheduling dependent for reconciliation"
            );
            match ctx.guard(self.trigger.trigger(&entry.dependent)).await {
                Ok(TriggerOutcome::Sent) => triggered.push(entry.key),
                Ok(TriggerOutcome::Gone) => {}
                Err(e @ (Error::Cancelled | Error::DeadlineExceeded { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(dependent = %entry.key, error = %e, "Cascade trigger failed");
                    failures.push((entry.key.to_string(), e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::TriggerFailed { failures });
        }

        for (dependent, reason) in &resolution.malformed {
            warn!(dependent = %dependent, reason = %reason, "Skipped malformed reference");
        }
        if let Some((dependent, reason)) = resolution.malformed.into_iter().next() {
            return Err(Error::malformed_reference(dependent, reason));
        }

        Ok(ReconcileOutcome::Reconciled {
            key: key.clone(),
            version: config.metadata.resource_version,
            triggered,
            current,
            unrelated,
        })
    }

    /// The resolver used for each pass.
    pub const fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Default per-call deadline.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    reader: Option<Arc<dyn ResourceReader>>,
    writer: Option<Arc<dyn ResourceWriter>>,
    trigger: Option<Arc<dyn CascadeTrigger>>,
    reference: ReferenceConfig,
    timeout: Duration,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            reader: None,
            writer: None,
            trigger: None,
            reference: defaults.reference.clone(),
            timeout: defaults.reconcile_timeout(),
        }
    }

    /// Set the read interface.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn ResourceReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Set the write interface used by the default trigger.
    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn ResourceWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Set a custom cascade trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Arc<dyn CascadeTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Take field path, selector and deadline from a controller config.
    #[must_use]
    pub fn with_config(mut self, config: &ControllerConfig) -> Self {
        self.reference = config.reference.clone();
        self.timeout = config.reconcile_timeout();
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Fails when no reader is set, or when neither a trigger nor a writer is.
    pub fn build(self) -> Result<Reconciler> {
        let reader = self.reader.ok_or_else(|| {
            Error::from(confcascade_core::Error::invalid_config("a resource reader is required"))
        })?;

        let trigger: Arc<dyn CascadeTrigger> = match (self.trigger, self.writer) {
            (Some(trigger), _) => trigger,
            (None, Some(writer)) => Arc::new(EmptyPatchTrigger::new(writer)),
            (None, None) => {
                return Err(confcascade_core::Error::invalid_config(
                    "a cascade trigger or resource writer is required",
                )
                .into());
            }
        };

        let resolver = DependencyResolver::new(reader.clone(), &self.reference);
        Ok(Reconciler::new(reader, resolver, trigger, self.timeout))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use confcascade_core::{ConfigurationResource, Dependent, ObjectKey};
    use serde_json::{json, Value};

    use super::*;
    use crate::store::InMemoryCluster;

    const PATH: &str = "/configRef";

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.reference.field_path = PATH.to_string();
        config
    }

    fn spec(name: &str, version: &str) -> Value {
        json!({"configRef": {"name": name, "resourceVersion": version}})
    }

    async fn setup(defaulting: bool) -> (Reconciler, Arc<InMemoryCluster>) {
        let cluster = if defaulting {
            InMemoryCluster::new().with_reference_defaulting(PATH)
        } else {
            InMemoryCluster::new()
        };
        let cluster = Arc::new(cluster);
        cluster
            .insert_configuration(
                ConfigurationResource::new("cfg", "A")
                    .with_resource_version("v2")
                    .with_entry("policy", "C2"),
            )
            .await
            .unwrap();
        cluster
            .insert_dependent(Dependent::new("cfg", "X", spec("A", "v2")))
            .await
            .unwrap();
        cluster
            .insert_dependent(Dependent::new("cfg", "Y", spec("A", "v0")))
            .await
            .unwrap();
        (Reconciler::for_api(cluster.clone(), &config()), cluster)
    }

    /// Trigger that counts calls and never finishes.
    struct HangingTrigger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CascadeTrigger for HangingTrigger {
        async fn trigger(&self, _dependent: &Dependent) -> Result<TriggerOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_only_stale_dependents_are_triggered() {
        let (reconciler, cluster) = setup(false).await;
        let outcome = reconciler.reconcile(&ObjectKey::new("cfg", "A")).await.unwrap();

        assert_eq!(outcome.triggered(), &[ObjectKey::new("cfg", "Y")]);
        assert_eq!(cluster.patches().await, vec![ObjectKey::new("cfg", "Y")]);
        assert!(matches!(outcome, ReconcileOutcome::Reconciled { current: 1, .. }));
    }

    #[tokio::test]
    async fn test_second_pass_after_defaulting_is_a_no_op() {
        let (reconciler, cluster) = setup(true).await;
        let key = ObjectKey::new("cfg", "A");

        reconciler.reconcile(&key).await.unwrap();
        cluster.clear_patches().await;
        let second = reconciler.reconcile(&key).await.unwrap();

        assert!(second.triggered().is_empty());
        assert!(cluster.patches().await.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_configuration_is_gone() {
        let (reconciler, cluster) = setup(false).await;
        let outcome = reconciler
            .reconcile(&ObjectKey::new("cfg", "missing"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Gone { .. }));
        assert!(cluster.patches().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_retryable() {
        let (reconciler, cluster) = setup(false).await;
        cluster.fail_next_gets(1);
        let err = reconciler
            .reconcile(&ObjectKey::new("cfg", "A"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_failure_is_retryable() {
        let (reconciler, cluster) = setup(false).await;
        cluster.fail_next_lists(1);
        let key = ObjectKey::new("cfg", "A");

        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cluster.patches().await.is_empty());

        assert!(reconciler.reconcile(&key).await.is_ok());
    }

    /// Given two stale dependents
    /// And the patch for one of them fails
    /// When reconciling
    /// Then the other is still triggered and the pass reports failure
    #[tokio::test]
    async fn test_partial_trigger_failure_fails_the_pass() {
        let (reconciler, cluster) = setup(false).await;
        cluster
            .insert_dependent(Dependent::new("cfg", "Z", spec("A", "v1")))
            .await
            .unwrap();
        cluster.fail_patches_for(ObjectKey::new("cfg", "Y")).await;

        let err = reconciler
            .reconcile(&ObjectKey::new("cfg", "A"))
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::TriggerFailed { failures } if failures.len() == 1));
        assert!(err.is_retryable());
        assert_eq!(cluster.patches().await, vec![ObjectKey::new("cfg", "Z")]);
    }

    #[tokio::test]
    async fn test_malformed_reference_fails_after_triggering_others() {
        let (reconciler, cluster) = setup(false).await;
        cluster
            .insert_dependent(Dependent::new("cfg", "broken", json!({"configRef": ["A"]})))
            .await
            .unwrap();

        let err = reconciler
            .reconcile(&ObjectKey::new("cfg", "A"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MalformedReference { .. }));
        assert_eq!(cluster.patches().await, vec![ObjectKey::new("cfg", "Y")]);
    }

    /// Given a dependent of `B` whose recorded version is not a string
    /// When `A` is reconciled
    /// Then the pass succeeds and counts it as unrelated
    #[tokio::test]
    async fn test_malformed_reference_to_other_resource_does_not_fail_the_pass() {
        let (reconciler, cluster) = setup(false).await;
        cluster
            .insert_dependent(Dependent::new(
                "cfg",
                "onB",
                json!({"configRef": {"name": "B", "resourceVersion": 7}}),
            ))
            .await
            .unwrap();

        let outcome = reconciler.reconcile(&ObjectKey::new("cfg", "A")).await.unwrap();

        assert_eq!(outcome.triggered(), &[ObjectKey::new("cfg", "Y")]);
        assert!(matches!(outcome, ReconcileOutcome::Reconciled { unrelated: 1, current: 1, .. }));
    }

    #[tokio::test]
    async fn test_malformed_reason_is_reported_once() {
        let (reconciler, cluster) = setup(false).await;
        cluster
            .insert_dependent(Dependent::new(
                "cfg",
                "broken",
                json!({"configRef": {"name": "A", "resourceVersion": 7}}),
            ))
            .await
            .unwrap();

        let err = reconciler
            .reconcile(&ObjectKey::new("cfg", "A"))
            .await
            .unwrap_err();

        assert_eq!(err.to_string().matches("malformed reference").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_a_hanging_trigger() {
        let (_, cluster) = setup(false).await;
        let trigger = Arc::new(HangingTrigger {
            calls: AtomicUsize::new(0),
        });
        let reconciler = ReconcilerBuilder::new()
            .with_reader(cluster)
            .with_trigger(trigger.clone())
            .with_config(&config())
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let err = reconciler
            .reconcile(&ObjectKey::new("cfg", "A"))
            .await
            .unwrap_err();

        assert_eq!(err, Error::deadline_exceeded(50));
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_pass() {
        let (_, cluster) = setup(false).await;
        let trigger = Arc::new(HangingTrigger {
            calls: AtomicUsize::new(0),
        });
        let reconciler = ReconcilerBuilder::new()
            .with_reader(cluster)
            .with_trigger(trigger)
            .with_config(&config())
            .build()
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = ReconcileContext::with_timeout(Duration::from_secs(30)).with_cancellation(stop_rx);
        let key = ObjectKey::new("cfg", "A");
        let pass = reconciler.reconcile_with(&key, &ctx);
        tokio::pin!(pass);

        tokio::select! {
            _ = &mut pass => panic!("pass should hang on the trigger"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        stop_tx.send_replace(true);

        assert_eq!(pass.await.unwrap_err(), Error::Cancelled);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_builder_requires_reader() {
        assert!(ReconcilerBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_requires_trigger_or_writer() {
        let cluster = Arc::new(InMemoryCluster::new());
        assert!(ReconcilerBuilder::new().with_reader(cluster).build().is_err());
    }

    #[test]
    fn test_builder_with_writer() {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = ReconcilerBuilder::new()
            .with_reader(cluster.clone())
            .with_writer(cluster)
            .timeout(Duration::from_secs(3))
            .build();
        assert_eq!(
            reconciler.ok().map(|r| r.timeout()),
            Some(Duration::from_secs(3))
        );
    }
}

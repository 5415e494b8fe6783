//! Subscription Hub
//!
//! Deduplicates subscriptions across callers and fans push rows out to
//! every callback attached to the same dedup key.
//!
//! # Dedup
//!
//! Callers asking for the same markets, codes, shapes, namespace and
//! granularities share one upstream subscription. The key ignores the
//! field projection, so every subscriber on a key receives the same row,
//! whatever fields it asked for.
//!
//! # Isolation
//!
//! A callback that errors or panics is logged and counted; delivery to the
//! other callbacks continues.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::application::ports::{PushSink, SubscriptionPort};
use crate::domain::error::GatewayError;
use crate::domain::mapping::PlainObject;
use crate::domain::subscription::{
    Attachment, DedupKey, SubscribeOptions, SubscriberId, SubscriptionRequest, SubscriptionStats,
    SubscriptionTable,
};
use crate::infrastructure::metrics;

/// Failure reported by a subscriber callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

/// Receives every row pushed for a subscriber's key.
pub type SubscriberCallback = Arc<dyn Fn(&PlainObject) -> Result<(), CallbackError> + Send + Sync>;

type Table = RwLock<SubscriptionTable<SubscriberCallback>>;

/// Delivery counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Callbacks that returned `Ok`.
    pub delivered: usize,
    /// Callbacks that errored or panicked.
    pub failed: usize,
}

/// Dedup and fan-out layer over a [`SubscriptionPort`].
pub struct SubscriptionHub {
    port: Arc<dyn SubscriptionPort>,
    table: Arc<Table>,
    next_subscriber: AtomicU64,
    // Serializes table changes that involve upstream round trips.
    ops: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHub {
    /// Create a hub over `port`.
    #[must_use]
    pub fn new(port: Arc<dyn SubscriptionPort>) -> Self {
        Self {
            port,
            table: Arc::new(RwLock::new(SubscriptionTable::default())),
            next_subscriber: AtomicU64::new(1),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach `callback` to the subscription for these markets, codes and
    /// shapes.
    ///
    /// The first subscriber on a key opens the upstream subscription,
    /// filling in the schema's default projection when none was given.
    /// Later subscribers on the same key only attach while that
    /// subscription is live; a lost one is reopened for the whole key.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if opening the subscription fails; the
    /// new subscriber is then detached so a later call retries.
    pub async fn subscribe(
        &self,
        markets: &[String],
        codes: &[String],
        qualified_names: &[String],
        namespace: u32,
        callback: SubscriberCallback,
        options: SubscribeOptions,
    ) -> Result<SubscriberId, GatewayError> {
        let key = DedupKey::new(markets, codes, qualified_names, namespace, &options);
        let _ops = self.ops.lock().await;

        self.drop_dead_underlying(&key);

        let subscriber = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let attachment = self.table.write().attach(&key, subscriber, callback);
        if let Attachment::Shared { reference_count } = attachment {
            tracing::debug!(subscriber, key = %key, reference_count, "Attached to existing subscription");
            return Ok(subscriber);
        }

        let fields = options
            .fields
            .unwrap_or_else(|| self.default_fields(qualified_names, namespace));
        let request = SubscriptionRequest {
            markets: markets.to_vec(),
            codes: codes.to_vec(),
            qualified_names: qualified_names.to_vec(),
            namespace,
            fields,
            granularities: options.granularities,
        };

        match self.port.subscribe(request, self.sink_for(key.clone())).await {
            Ok(id) => {
                tracing::info!(subscriber, key = %key, subscription_id = %id, "Upstream subscription opened");
                self.table.write().set_underlying(&key, id);
                self.publish_gauge();
                Ok(subscriber)
            }
            Err(error) => {
                tracing::warn!(subscriber, key = %key, error = %error, "Upstream subscription failed");
                self.table.write().detach(subscriber);
                Err(error)
            }
        }
    }

    /// Detach a subscriber. The upstream subscription is closed only when
    /// its last subscriber leaves. Unknown ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if closing the subscription fails.
    pub async fn unsubscribe(&self, subscriber: SubscriberId) -> Result<(), GatewayError> {
        let _ops = self.ops.lock().await;
        let detachment = self.table.write().detach(subscriber);
        let Some(detachment) = detachment else {
            tracing::debug!(subscriber, "Unsubscribe for unknown subscriber");
            return Ok(());
        };

        tracing::debug!(
            subscriber,
            key = %detachment.key,
            remaining = detachment.remaining,
            "Subscriber detached"
        );
        if let Some(id) = detachment.orphaned {
            tracing::info!(key = %detachment.key, subscription_id = %id, "Closing upstream subscription");
            self.publish_gauge();
            self.port.unsubscribe(id).await?;
        }
        Ok(())
    }

    /// Deliver `data` to every callback attached to `key`.
    pub fn broadcast_to_subscribers(&self, key: &DedupKey, data: &PlainObject) -> BroadcastOutcome {
        deliver(&self.table, key, data)
    }

    /// Remove keys without subscribers and close their upstream
    /// subscriptions. Returns the number of keys removed.
    pub async fn cleanup(&self) -> usize {
        let _ops = self.ops.lock().await;
        let orphans = self.table.write().sweep_orphans();
        let removed = orphans.len();
        for (key, id) in orphans {
            if let Some(id) = id
                && let Err(error) = self.port.unsubscribe(id).await
            {
                tracing::warn!(key = %key, error = %error, "Orphan unsubscribe failed");
            }
        }
        if removed > 0 {
            self.publish_gauge();
        }
        removed
    }

    /// Close every upstream subscription and forget all subscribers.
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let entries = self.table.write().drain();
        tracing::info!(subscriptions = entries.len(), "Shutting down subscription hub");
        for (key, id) in entries {
            if let Some(id) = id
                && let Err(error) = self.port.unsubscribe(id).await
            {
                tracing::warn!(key = %key, error = %error, "Unsubscribe on shutdown failed");
            }
        }
        self.publish_gauge();
    }

    /// Key a subscriber is attached to.
    #[must_use]
    pub fn key_of(&self, subscriber: SubscriberId) -> Option<DedupKey> {
        self.table.read().key_of(subscriber).cloned()
    }

    /// Subscribers attached to `key`.
    #[must_use]
    pub fn reference_count(&self, key: &DedupKey) -> usize {
        self.table.read().reference_count(key)
    }

    /// Subscription counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.table.read().stats()
    }

    /// Forget the key's upstream subscription if the session that held it
    /// is gone, so the next attach reopens it for every subscriber.
    fn drop_dead_underlying(&self, key: &DedupKey) {
        let dead = self
            .table
            .read()
            .underlying(key)
            .filter(|id| !self.port.is_active(id))
            .cloned();
        if let Some(id) = dead {
            tracing::info!(key = %key, subscription_id = %id, "Upstream subscription lost, reopening");
            self.table.write().clear_underlying(key);
        }
    }

    /// Union of the default projections of the requested shapes.
    fn default_fields(&self, qualified_names: &[String], namespace: u32) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for name in qualified_names {
            for field in self
                .port
                .default_fields(name, namespace)
                .unwrap_or_default()
            {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        fields
    }

    fn sink_for(&self, key: DedupKey) -> PushSink {
        let table: Weak<Table> = Arc::downgrade(&self.table);
        Arc::new(move |row: &PlainObject| {
            if let Some(table) = table.upgrade() {
                deliver(&table, &key, row);
            }
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauge(&self) {
        metrics::set_upstream_subscriptions(self.stats().upstream as f64);
    }
}

fn deliver(table: &Table, key: &DedupKey, data: &PlainObject) -> BroadcastOutcome {
    // Callbacks run without the table lock so they may re-enter the hub.
    let callbacks = table.read().callbacks(key);
    let mut outcome = BroadcastOutcome::default();
    for (subscriber, callback) in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(data))) {
            Ok(Ok(())) => outcome.delivered += 1,
            Ok(Err(error)) => {
                outcome.failed += 1;
                tracing::warn!(subscriber, key = %key, error = %error, "Subscriber callback failed");
            }
            Err(_) => {
                outcome.failed += 1;
                tracing::error!(subscriber, key = %key, "Subscriber callback panicked");
            }
        }
    }
    if outcome.failed > 0 {
        metrics::record_callback_failures(outcome.failed as u64);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use mockall::predicate::eq;
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::MockSubscriptionPort;
    use crate::domain::subscription::SubscriptionId;

    async fn attach(
        hub: &SubscriptionHub,
        code: &str,
        callback: SubscriberCallback,
    ) -> Result<SubscriberId, GatewayError> {
        attach_with(hub, code, callback, SubscribeOptions::default()).await
    }

    async fn attach_with(
        hub: &SubscriptionHub,
        code: &str,
        callback: SubscriberCallback,
        options: SubscribeOptions,
    ) -> Result<SubscriberId, GatewayError> {
        hub.subscribe(
            &["DCE".to_string()],
            &[code.to_string()],
            &["SampleQuote".to_string()],
            0,
            callback,
            options,
        )
        .await
    }

    fn row() -> PlainObject {
        PlainObject {
            namespace: 0,
            meta_id: 12,
            meta_name: "global::SampleQuote".into(),
            market: "DCE".into(),
            code: "i2409".into(),
            time_tag: 1,
            granularity: 0,
            fields: BTreeMap::new(),
        }
    }

    fn callback(
        f: impl Fn(&PlainObject) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) -> SubscriberCallback {
        Arc::new(f)
    }

    fn noop() -> SubscriberCallback {
        callback(|_| Ok(()))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> SubscriberCallback {
        let counter = Arc::clone(counter);
        callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn port_with_one_subscription() -> MockSubscriptionPort {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        port.expect_is_active().returning(|_| true);
        port.expect_subscribe()
            .times(1)
            .returning(|_, _| Ok(SubscriptionId::new("up-1")));
        port
    }

    #[tokio::test]
    async fn identical_subscriptions_share_one_upstream() {
        let mut port = port_with_one_subscription();
        port.expect_unsubscribe()
            .with(eq(SubscriptionId::new("up-1")))
            .times(1)
            .returning(|_| Ok(()));
        let hub = SubscriptionHub::new(Arc::new(port));

        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let first = attach(&hub, "i2409", counting(&a)).await.unwrap();
        let second = attach(&hub, "i2409", counting(&b)).await.unwrap();
        assert_ne!(first, second);

        let key = hub.key_of(first).unwrap();
        assert_eq!(hub.key_of(second).as_ref(), Some(&key));
        assert_eq!(hub.reference_count(&key), 2);
        assert_eq!(hub.stats().upstream, 1);

        let outcome = hub.broadcast_to_subscribers(&key, &row());
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, failed: 0 });
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        hub.unsubscribe(first).await.unwrap();
        assert_eq!(hub.reference_count(&key), 1);
        hub.unsubscribe(second).await.unwrap();
        assert_eq!(hub.stats().keys, 0);
    }

    #[tokio::test]
    async fn push_rows_reach_every_subscriber_through_the_sink() {
        let sink: Arc<Mutex<Option<PushSink>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&sink);

        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        port.expect_is_active().returning(|_| true);
        port.expect_subscribe().times(1).returning(move |_, s| {
            *captured.lock() = Some(s);
            Ok(SubscriptionId::new("up-1"))
        });
        let hub = SubscriptionHub::new(Arc::new(port));

        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        attach(&hub, "i2409", counting(&a)).await.unwrap();
        attach(&hub, "i2409", counting(&b)).await.unwrap();

        let push = sink.lock().clone().unwrap();
        push(&row());
        push(&row());
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lost_upstream_subscription_is_reopened_for_the_whole_key() {
        let sinks: Arc<Mutex<Vec<PushSink>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sinks);

        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        port.expect_is_active()
            .with(eq(SubscriptionId::new("up-1")))
            .returning(|_| false);
        port.expect_subscribe().times(2).returning(move |_, sink| {
            let mut sinks = captured.lock();
            sinks.push(sink);
            Ok(SubscriptionId::new(format!("up-{}", sinks.len())))
        });
        let hub = SubscriptionHub::new(Arc::new(port));

        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let first = attach(&hub, "i2409", counting(&before)).await.unwrap();
        attach(&hub, "i2409", counting(&after)).await.unwrap();

        let key = hub.key_of(first).unwrap();
        assert_eq!(hub.reference_count(&key), 2);
        assert_eq!(hub.stats().upstream, 1);

        let reopened = sinks.lock()[1].clone();
        reopened(&row());
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_callbacks_do_not_block_others() {
        let hub = SubscriptionHub::new(Arc::new(port_with_one_subscription()));
        let healthy = Arc::new(AtomicUsize::new(0));

        let id = attach(
            &hub,
            "i2409",
            callback(|_| Err(CallbackError("downstream gone".into()))),
        )
        .await
        .unwrap();
        attach(&hub, "i2409", callback(|_| panic!("bad subscriber")))
            .await
            .unwrap();
        attach(&hub, "i2409", counting(&healthy)).await.unwrap();

        let key = hub.key_of(id).unwrap();
        let outcome = hub.broadcast_to_subscribers(&key, &row());
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, failed: 2 });
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_projection_comes_from_schema() {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields()
            .withf(|name, namespace| name == "SampleQuote" && *namespace == 0)
            .returning(|_, _| Some(vec!["close".into(), "volume".into()]));
        port.expect_subscribe()
            .withf(|request, _| request.fields == ["close", "volume"])
            .times(1)
            .returning(|_, _| Ok(SubscriptionId::new("up-1")));
        let hub = SubscriptionHub::new(Arc::new(port));

        attach(&hub, "i2409", noop()).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_projection_skips_schema_lookup() {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().never();
        port.expect_subscribe()
            .withf(|request, _| request.fields == ["close"])
            .times(1)
            .returning(|_, _| Ok(SubscriptionId::new("up-1")));
        let hub = SubscriptionHub::new(Arc::new(port));

        let options = SubscribeOptions {
            fields: Some(vec!["close".into()]),
            ..SubscribeOptions::default()
        };
        attach_with(&hub, "i2409", noop(), options).await.unwrap();
    }

    #[tokio::test]
    async fn failed_upstream_subscribe_forgets_the_key() {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        let mut calls = 0;
        port.expect_subscribe().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(GatewayError::server(6, "not ready"))
            } else {
                Ok(SubscriptionId::new("up-2"))
            }
        });
        let hub = SubscriptionHub::new(Arc::new(port));

        let first = attach(&hub, "i2409", noop()).await;
        assert!(matches!(first, Err(GatewayError::Server { .. })));
        assert_eq!(hub.stats().keys, 0);

        attach(&hub, "i2409", noop()).await.unwrap();
        assert_eq!(hub.stats().upstream, 1);
    }

    #[tokio::test]
    async fn different_codes_open_separate_subscriptions() {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        port.expect_subscribe()
            .times(2)
            .returning(|request, _| Ok(SubscriptionId::new(request.codes.join(","))));
        let hub = SubscriptionHub::new(Arc::new(port));

        attach(&hub, "i2409", noop()).await.unwrap();
        attach(&hub, "m2409", noop()).await.unwrap();
        assert_eq!(hub.stats().upstream, 2);
    }

    #[tokio::test]
    async fn unknown_subscriber_is_a_no_op() {
        let mut port = MockSubscriptionPort::new();
        port.expect_unsubscribe().never();
        let hub = SubscriptionHub::new(Arc::new(port));
        hub.unsubscribe(42).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_every_upstream_subscription() {
        let mut port = MockSubscriptionPort::new();
        port.expect_default_fields().returning(|_, _| None);
        port.expect_subscribe()
            .times(2)
            .returning(|request, _| Ok(SubscriptionId::new(request.codes.join(","))));
        port.expect_unsubscribe().times(2).returning(|_| Ok(()));
        let hub = SubscriptionHub::new(Arc::new(port));

        attach(&hub, "i2409", noop()).await.unwrap();
        attach(&hub, "m2409", noop()).await.unwrap();
        hub.shutdown().await;
        assert_eq!(hub.stats(), SubscriptionStats::default());
    }

    #[tokio::test]
    async fn cleanup_on_clean_table_removes_nothing() {
        let hub = SubscriptionHub::new(Arc::new(MockSubscriptionPort::new()));
        assert_eq!(hub.cleanup().await, 0);
    }
}

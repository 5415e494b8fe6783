//! Connection Pool
//!
//! Owns N upstream connections, captures one bootstrap snapshot and hands
//! connections out one caller at a time.
//!
//! # Readiness
//!
//! The pool is ready once the first connection has loaded every seeds
//! response. That connection's schema, markets and securities become the
//! shared snapshot; later connections' bootstrap data is not consulted,
//! since every connection targets the same upstream with the same token.
//!
//! # Checkout
//!
//! ```text
//! checkout() ──► [free?] ──yes──► PooledConnection (busy) ──drop──► free
//!                   │
//!                   no ──► PoolExhausted (no queuing)
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::ports::WireCodec;
use crate::domain::error::GatewayError;
use crate::domain::schema::SchemaRegistry;
use crate::domain::universe::{BootstrapSnapshot, MarketMap, SecurityIndex};
use crate::infrastructure::broadcast::SharedEventHub;
use crate::infrastructure::config::{ConnectionSettings, PoolSettings, Token};
use crate::infrastructure::metrics::{self, CheckoutOutcome};
use crate::infrastructure::upstream::{ConnectionId, ProtocolConnection};

// =============================================================================
// Slots
// =============================================================================

#[derive(Debug)]
struct Slot {
    connection: Arc<ProtocolConnection>,
    busy: AtomicBool,
}

impl Slot {
    fn new(connection: Arc<ProtocolConnection>) -> Self {
        Self {
            connection,
            busy: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool.
#[derive(Debug)]
pub struct PooledConnection {
    slot: Arc<Slot>,
}

impl PooledConnection {
    /// The underlying connection, for callers that need to keep it.
    #[must_use]
    pub fn connection(&self) -> &Arc<ProtocolConnection> {
        &self.slot.connection
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = ProtocolConnection;

    fn deref(&self) -> &Self::Target {
        &self.slot.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.slot.release();
        tracing::trace!(connection = self.slot.connection.id(), "Connection released");
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections that bootstrapped.
    pub size: usize,
    /// Connections still open.
    pub live: usize,
    /// Connections checked out.
    pub busy: usize,
    /// Whether the snapshot has been captured.
    pub ready: bool,
}

/// Fixed-size set of bootstrapped upstream connections.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use market_gateway::infrastructure::broadcast::EventHub;
/// use market_gateway::infrastructure::codec::MsgPackCodec;
/// use market_gateway::infrastructure::config::{ConnectionSettings, PoolSettings, Token};
/// use market_gateway::infrastructure::pool::ConnectionPool;
/// use market_gateway::infrastructure::upstream::FetchOptions;
///
/// async fn example() -> Result<(), market_gateway::GatewayError> {
///     let pool = ConnectionPool::new(
///         Arc::new(MsgPackCodec::new()),
///         ConnectionSettings::default(),
///         PoolSettings::default(),
///         Arc::new(EventHub::with_defaults()),
///     );
///     pool.initialize("wss://md.example.com/ws", &Token::new("secret"), 4)
///         .await?;
///     pool.wait_ready().await;
///
///     let connection = pool.checkout()?;
///     let rows = connection
///         .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
///         .await?;
///     drop(connection);
///
///     println!("{} rows", rows.count);
///     pool.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ConnectionPool {
    codec: Arc<dyn WireCodec>,
    connection_settings: ConnectionSettings,
    settings: PoolSettings,
    events: SharedEventHub,
    slots: RwLock<Vec<Arc<Slot>>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    snapshot: Arc<OnceLock<BootstrapSnapshot>>,
    ready: Arc<watch::Sender<bool>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(
        codec: Arc<dyn WireCodec>,
        connection_settings: ConnectionSettings,
        settings: PoolSettings,
        events: SharedEventHub,
    ) -> Self {
        Self {
            codec,
            connection_settings,
            settings,
            events,
            slots: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            snapshot: Arc::new(OnceLock::new()),
            ready: Arc::new(watch::Sender::new(false)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Bootstrap `count` connections concurrently.
    ///
    /// Each bootstrap runs under the pool's bootstrap timeout; failures are
    /// logged and discarded, never retried. A connection joins the pool and
    /// starts racing for the snapshot as soon as its own bootstrap
    /// resolves, without waiting for the others. Returns the number of
    /// connections that bootstrapped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AllBootstrapsFailed`] if none did.
    pub async fn initialize(
        &self,
        url: &str,
        token: &Token,
        count: usize,
    ) -> Result<usize, GatewayError> {
        let timeout = self.settings.bootstrap_timeout;
        tracing::info!(count, timeout_secs = timeout.as_secs(), "Bootstrapping connection pool");

        let attempts = (0..count).map(|_| {
            let id: ConnectionId = self.next_id.fetch_add(1, Ordering::Relaxed);
            let connection = Arc::new(ProtocolConnection::new(
                id,
                Arc::clone(&self.codec),
                self.connection_settings,
                Arc::clone(&self.events),
            ));
            async move {
                match tokio::time::timeout(timeout, connection.connect(url, token)).await {
                    Ok(Ok(())) => {
                        self.admit(connection);
                        true
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(connection = connection.id(), error = %error, "Bootstrap failed, discarding");
                        connection.disconnect().await;
                        false
                    }
                    Err(_) => {
                        tracing::warn!(
                            connection = connection.id(),
                            error = %GatewayError::Timeout(timeout),
                            "Bootstrap timed out, discarding"
                        );
                        connection.disconnect().await;
                        false
                    }
                }
            }
        });

        let size = join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        if size == 0 {
            tracing::error!(count, "Every bootstrap failed");
            return Err(GatewayError::AllBootstrapsFailed(count));
        }

        tracing::info!(size, requested = count, "Connection pool initialized");
        Ok(size)
    }

    /// Add a bootstrapped connection and watch its seeds. The slot goes in
    /// first so a connection is checkable once the ready gate opens.
    fn admit(&self, connection: Arc<ProtocolConnection>) {
        self.slots.write().push(Arc::new(Slot::new(Arc::clone(&connection))));
        self.publish_gauge();
        let watcher = self.watch_seeds(connection);
        self.watchers.lock().push(watcher);
    }

    /// Capture the snapshot from whichever connection loads seeds first.
    fn watch_seeds(&self, connection: Arc<ProtocolConnection>) -> JoinHandle<()> {
        let snapshot = Arc::clone(&self.snapshot);
        let ready = Arc::clone(&self.ready);
        tokio::spawn(async move {
            match connection.wait_seeds_loaded().await {
                Ok(()) => {
                    if snapshot.set(connection.snapshot()).is_ok() {
                        tracing::info!(connection = connection.id(), "Bootstrap snapshot captured, pool ready");
                        ready.send_replace(true);
                    }
                }
                Err(error) => {
                    tracing::debug!(connection = connection.id(), error = %error, "Seeds never completed");
                }
            }
        })
    }

    // =========================================================================
    // Readiness and Snapshot
    // =========================================================================

    /// Whether the snapshot has been captured.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the ready signal.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as the pool.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Receiver for the ready signal.
    #[must_use]
    pub fn ready_rx(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// The shared bootstrap snapshot, once captured.
    #[must_use]
    pub fn snapshot(&self) -> Option<BootstrapSnapshot> {
        self.snapshot.get().cloned()
    }

    /// Shared schema.
    #[must_use]
    pub fn schema(&self) -> Option<Arc<SchemaRegistry>> {
        self.snapshot.get().map(|s| Arc::clone(&s.schema))
    }

    /// Shared market revision entries.
    #[must_use]
    pub fn markets(&self) -> Option<Arc<MarketMap>> {
        self.snapshot.get().map(|s| Arc::clone(&s.markets))
    }

    /// Shared security index.
    #[must_use]
    pub fn securities(&self) -> Option<Arc<SecurityIndex>> {
        self.snapshot.get().map(|s| Arc::clone(&s.securities))
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Take a free connection.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotReady`] before the ready signal
    /// - [`GatewayError::PoolExhausted`] if every open connection is busy
    pub fn checkout(&self) -> Result<PooledConnection, GatewayError> {
        if !self.is_ready() {
            metrics::record_checkout(CheckoutOutcome::NotReady);
            return Err(GatewayError::NotReady("pool".into()));
        }

        let slots = self.slots.read().clone();
        if !slots.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
            for offset in 0..slots.len() {
                let slot = &slots[(start + offset) % slots.len()];
                if !slot.connection.state().is_terminal() && slot.try_acquire() {
                    metrics::record_checkout(CheckoutOutcome::Acquired);
                    tracing::trace!(connection = slot.connection.id(), "Connection checked out");
                    return Ok(PooledConnection {
                        slot: Arc::clone(slot),
                    });
                }
            }
        }

        metrics::record_checkout(CheckoutOutcome::Exhausted);
        Err(GatewayError::PoolExhausted)
    }

    /// Return a checked-out connection.
    pub fn release(&self, connection: PooledConnection) {
        connection.release();
    }

    /// First open connection, used for long-lived subscriptions.
    #[must_use]
    pub fn primary(&self) -> Option<Arc<ProtocolConnection>> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.connection.is_ready())
            .map(|slot| Arc::clone(&slot.connection))
    }

    /// Every pooled connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ProtocolConnection>> {
        self.slots
            .read()
            .iter()
            .map(|slot| Arc::clone(&slot.connection))
            .collect()
    }

    /// Occupancy counts.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.read();
        PoolStats {
            size: slots.len(),
            live: slots
                .iter()
                .filter(|s| !s.connection.state().is_terminal())
                .count(),
            busy: slots.iter().filter(|s| s.is_busy()).count(),
            ready: self.is_ready(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauge(&self) {
        metrics::set_connections(self.stats().live as f64);
    }

    /// Disconnect every connection and clear the pool.
    pub async fn shutdown(&self) {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            watcher.abort();
        }
        let slots = std::mem::take(&mut *self.slots.write());
        tracing::info!(connections = slots.len(), "Shutting down connection pool");
        for slot in slots {
            slot.connection.disconnect().await;
        }
        self.ready.send_replace(false);
        self.publish_gauge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broadcast::EventHub;
    use crate::infrastructure::codec::MsgPackCodec;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(MsgPackCodec::new()),
            ConnectionSettings::default(),
            PoolSettings::default(),
            Arc::new(EventHub::with_defaults()),
        )
    }

    fn with_idle_slots(pool: &ConnectionPool, count: u64) {
        let mut slots = pool.slots.write();
        for id in 0..count {
            slots.push(Arc::new(Slot::new(Arc::new(ProtocolConnection::new(
                id,
                Arc::new(MsgPackCodec::new()),
                ConnectionSettings::default(),
                Arc::new(EventHub::with_defaults()),
            )))));
        }
    }

    #[test]
    fn checkout_before_ready_fails() {
        let pool = pool();
        with_idle_slots(&pool, 1);
        assert!(matches!(pool.checkout(), Err(GatewayError::NotReady(_))));
    }

    #[test]
    fn checkout_exhausts_without_queuing() {
        let pool = pool();
        with_idle_slots(&pool, 2);
        pool.ready.send_replace(true);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(matches!(pool.checkout(), Err(GatewayError::PoolExhausted)));
        assert_eq!(pool.stats().busy, 2);

        drop(a);
        let c = pool.checkout().unwrap();
        assert_eq!(pool.stats().busy, 2);
        pool.release(c);
        pool.release(b);
        assert_eq!(pool.stats().busy, 0);
    }

    #[test]
    fn empty_pool_is_exhausted() {
        let pool = pool();
        pool.ready.send_replace(true);
        assert!(matches!(pool.checkout(), Err(GatewayError::PoolExhausted)));
    }

    #[tokio::test]
    async fn initialize_fails_when_every_bootstrap_fails() {
        let pool = pool();
        let result = pool
            .initialize("ws://127.0.0.1:1/unreachable", &Token::new("t"), 3)
            .await;
        assert!(matches!(result, Err(GatewayError::AllBootstrapsFailed(3))));
        assert_eq!(pool.stats().size, 0);
        assert!(!pool.is_ready());
        assert!(pool.snapshot().is_none());
    }
}

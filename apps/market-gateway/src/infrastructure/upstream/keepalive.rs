//! Keepalive Monitor
//!
//! Sends periodic keepalive frames on an upstream session and declares the
//! transport dead after a stretch of inbound silence. A dead transport is
//! handled like any other transport failure; it never triggers a reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::ConnectionSettings;

/// Keepalive timing.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Interval between keepalive frames.
    pub interval: Duration,
    /// Inbound silence tolerated before the transport counts as dead.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
        }
    }
}

impl KeepaliveConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl From<&ConnectionSettings> for KeepaliveConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self::new(settings.keepalive_interval, settings.keepalive_timeout)
    }
}

/// Monitor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Time to send a keepalive frame.
    Send,
    /// Nothing arrived within the timeout.
    Expired(Duration),
}

/// Inbound activity shared between the session loop and the monitor.
#[derive(Debug)]
pub struct KeepaliveState {
    last_inbound: RwLock<Instant>,
    sent: AtomicU64,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Fresh state, counting from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
            sent: AtomicU64::new(0),
        }
    }

    /// Note that a frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Note that a keepalive frame went out.
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }

    /// Keepalive frames sent so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Periodic keepalive driver for one session.
pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: KeepaliveConfig,
        state: Arc<KeepaliveState>,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or the session expires.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let silence = self.state.silence();
                    let event = if silence > self.config.timeout {
                        tracing::warn!(
                            silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                            "Upstream silent past keepalive timeout"
                        );
                        KeepaliveEvent::Expired(silence)
                    } else {
                        KeepaliveEvent::Send
                    };
                    if self.event_tx.send(event).await.is_err()
                        || matches!(event, KeepaliveEvent::Expired(_))
                    {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tracks_inbound_and_sent() {
        let state = KeepaliveState::new();
        state.record_sent();
        state.record_sent();
        state.record_inbound();
        assert_eq!(state.sent(), 2);
        assert!(state.silence() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn monitor_requests_keepalive() {
        let state = Arc::new(KeepaliveState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let monitor = KeepaliveMonitor::new(
            KeepaliveConfig::new(Duration::from_millis(20), Duration::from_secs(5)),
            state,
            tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(monitor.run());

        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, KeepaliveEvent::Send);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn monitor_expires_on_silence() {
        let state = Arc::new(KeepaliveState::new());
        *state.last_inbound.write() = Instant::now()
            .checked_sub(Duration::from_millis(200))
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = KeepaliveMonitor::new(
            KeepaliveConfig::new(Duration::from_millis(20), Duration::from_millis(100)),
            state,
            tx,
            CancellationToken::new(),
        );
        let handle = tokio::spawn(monitor.run());

        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, KeepaliveEvent::Expired(_)));
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

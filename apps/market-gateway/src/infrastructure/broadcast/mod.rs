//! Event Broadcast
//!
//! Fans connection events out to any number of observers over tokio
//! broadcast channels.
//!
//! # Architecture
//!
//! The `EventHub` keeps two channels:
//! - Lifecycle: connected, schema/universe/seeds loaded, market status,
//!   errors, disconnects
//! - Data: historical fetch results and real-time push rows
//!
//! A slow observer lags and skips events; it never blocks a connection.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::application::ports::MarketStatus;
use crate::domain::error::GatewayError;
use crate::domain::mapping::PlainObject;
use crate::domain::subscription::SubscriptionId;
use crate::infrastructure::config::EventSettings;
use crate::infrastructure::upstream::ConnectionId;

// =============================================================================
// Events
// =============================================================================

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Transport open and handshake sent.
    Connected {
        /// Emitting connection.
        connection: ConnectionId,
    },
    /// Schema frame loaded and codec context rebuilt.
    SchemaLoaded {
        /// Emitting connection.
        connection: ConnectionId,
        /// Descriptors in the schema.
        descriptors: usize,
    },
    /// Universe revision decoded.
    UniverseLoaded {
        /// Emitting connection.
        connection: ConnectionId,
        /// Markets discovered.
        markets: usize,
    },
    /// Every seeds response arrived.
    SeedsLoaded {
        /// Emitting connection.
        connection: ConnectionId,
        /// Securities indexed.
        securities: usize,
    },
    /// Market session status changed.
    MarketStatus {
        /// Emitting connection.
        connection: ConnectionId,
        /// New status.
        status: MarketStatus,
    },
    /// Connection-level failure.
    Error {
        /// Emitting connection.
        connection: ConnectionId,
        /// The failure.
        error: GatewayError,
    },
    /// Transport closed.
    Disconnected {
        /// Emitting connection.
        connection: ConnectionId,
    },
}

/// Data notifications.
#[derive(Debug, Clone)]
pub enum DataEvent {
    /// A fetch completed.
    Historical {
        /// Emitting connection.
        connection: ConnectionId,
        /// Sequence id of the request.
        sequence_id: u32,
        /// Shape of the rows.
        qualified_name: String,
        /// Mapped rows.
        records: Arc<Vec<PlainObject>>,
    },
    /// A push row was routed to a subscription.
    RealTime {
        /// Emitting connection.
        connection: ConnectionId,
        /// Receiving subscription.
        subscription_id: SubscriptionId,
        /// Mapped row.
        record: Arc<PlainObject>,
    },
}

// =============================================================================
// Event Hub
// =============================================================================

/// Channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct EventHubConfig {
    /// Lifecycle channel capacity.
    pub lifecycle_capacity: usize,
    /// Data channel capacity.
    pub data_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            lifecycle_capacity: 1_024,
            data_capacity: 16_384,
        }
    }
}

impl From<EventSettings> for EventHubConfig {
    fn from(settings: EventSettings) -> Self {
        Self {
            lifecycle_capacity: settings.lifecycle_capacity,
            data_capacity: settings.data_capacity,
        }
    }
}

/// Lifecycle and data channels shared by the connections of a pool.
///
/// # Example
///
/// ```rust
/// use market_gateway::infrastructure::broadcast::{EventHub, EventHubConfig, LifecycleEvent};
///
/// let hub = EventHub::new(EventHubConfig::default());
/// let mut rx = hub.lifecycle_rx();
///
/// let _ = hub.send_lifecycle(LifecycleEvent::Connected { connection: 1 });
/// assert!(matches!(rx.try_recv(), Ok(LifecycleEvent::Connected { connection: 1 })));
/// ```
#[derive(Debug)]
pub struct EventHub {
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    data_tx: broadcast::Sender<DataEvent>,
}

impl EventHub {
    /// Create a hub with the given capacities.
    #[must_use]
    pub fn new(config: EventHubConfig) -> Self {
        Self {
            lifecycle_tx: broadcast::channel(config.lifecycle_capacity.max(1)).0,
            data_tx: broadcast::channel(config.data_capacity.max(1)).0,
        }
    }

    /// Create a hub with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EventHubConfig::default())
    }

    /// Publish a lifecycle event.
    ///
    /// Returns the number of receivers, or `None` if nobody listens.
    pub fn send_lifecycle(&self, event: LifecycleEvent) -> Option<usize> {
        self.lifecycle_tx.send(event).ok()
    }

    /// New lifecycle receiver.
    #[must_use]
    pub fn lifecycle_rx(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Lifecycle events as a stream.
    #[must_use]
    pub fn lifecycle_stream(&self) -> BroadcastStream<LifecycleEvent> {
        BroadcastStream::new(self.lifecycle_rx())
    }

    /// Publish a data event.
    ///
    /// Returns the number of receivers, or `None` if nobody listens.
    pub fn send_data(&self, event: DataEvent) -> Option<usize> {
        self.data_tx.send(event).ok()
    }

    /// New data receiver.
    #[must_use]
    pub fn data_rx(&self) -> broadcast::Receiver<DataEvent> {
        self.data_tx.subscribe()
    }

    /// Data events as a stream.
    #[must_use]
    pub fn data_stream(&self) -> BroadcastStream<DataEvent> {
        BroadcastStream::new(self.data_rx())
    }

    /// Receiver counts.
    #[must_use]
    pub fn stats(&self) -> EventHubStats {
        EventHubStats {
            lifecycle_receivers: self.lifecycle_tx.receiver_count(),
            data_receivers: self.data_tx.receiver_count(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Receiver counts per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventHubStats {
    /// Lifecycle receivers.
    pub lifecycle_receivers: usize,
    /// Data receivers.
    pub data_receivers: usize,
}

impl EventHubStats {
    /// Receivers across both channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.lifecycle_receivers + self.data_receivers
    }
}

/// Shared handle to an event hub.
pub type SharedEventHub = Arc<EventHub>;

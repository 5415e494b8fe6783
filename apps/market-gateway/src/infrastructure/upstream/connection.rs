//! Protocol Connection
//!
//! One upstream WebSocket session: handshake, schema and universe
//! bootstrap, then correlated fetches and streaming subscriptions.
//!
//! # Architecture
//!
//! The handle is cheap to share. All I/O happens on a spawned session task
//! that owns the socket halves and the codec context:
//!
//! ```text
//! caller ──Outbound──► session task ──frames──► upstream
//!   ▲                      │
//!   └──oneshot result──────┘ (matched by sequence id)
//! ```
//!
//! There is no automatic reconnect. A lost transport moves the connection
//! to `Closed`; the owner decides whether to `connect()` again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::ConnectionId;
use super::keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
use super::pending::{Completion, FetchResult, PendingRequest, RequestContext};
use super::session::{Closure, Session};
use super::shared::{LocalSubscription, Shared};
use super::state::{ConnectionState, SeedStatus};
use crate::application::ports::{
    FetchByCodeRequest, FetchByTimeRangeRequest, FetchByTimeRequest, PushSink, Request,
    SubscribeRequest, SubscriptionPort, WireCodec,
};
use crate::domain::correlation::RejectReason;
use crate::domain::error::GatewayError;
use crate::domain::schema::{LATEST_REVISION, NAMESPACE_GLOBAL, SchemaRegistry};
use crate::domain::subscription::{SubscriptionId, SubscriptionRequest};
use crate::domain::universe::{BootstrapSnapshot, MarketMap, SecurityIndex};
use crate::infrastructure::broadcast::{LifecycleEvent, SharedEventHub};
use crate::infrastructure::config::{ConnectionSettings, Token};
use crate::infrastructure::metrics;

// =============================================================================
// Fetch Options
// =============================================================================

/// Shape, revision, projection and time window of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Shape to fetch, with or without namespace prefix.
    pub qualified_name: String,
    /// Namespace of the shape.
    pub namespace: u32,
    /// Revision ceiling; the market's current revision when `None`.
    pub revision: Option<u32>,
    /// Fields to keep in the result; every field when `None`.
    pub fields: Option<Vec<String>>,
    /// Bar granularity.
    pub granularity: u32,
    /// Inclusive start time tag.
    pub from_time_tag: u64,
    /// Inclusive end time tag.
    pub to_time_tag: u64,
}

impl FetchOptions {
    /// Fetch every field of the latest revision over all time.
    #[must_use]
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            namespace: NAMESPACE_GLOBAL,
            revision: None,
            fields: None,
            granularity: 0,
            from_time_tag: 0,
            to_time_tag: u64::MAX,
        }
    }

    /// Set the namespace.
    #[must_use]
    pub const fn namespace(mut self, namespace: u32) -> Self {
        self.namespace = namespace;
        self
    }

    /// Pin a revision ceiling.
    #[must_use]
    pub const fn revision(mut self, revision: u32) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Keep only these fields.
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set the bar granularity.
    #[must_use]
    pub const fn granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set the inclusive time window.
    #[must_use]
    pub const fn range(mut self, from_time_tag: u64, to_time_tag: u64) -> Self {
        self.from_time_tag = from_time_tag;
        self.to_time_tag = to_time_tag;
        self
    }

    fn context(&self, revision: u32) -> RequestContext {
        RequestContext::Fetch {
            namespace: self.namespace,
            qualified_name: self.qualified_name.clone(),
            revision,
            fields: self.fields.clone(),
        }
    }

    fn wire_fields(&self) -> Vec<String> {
        self.fields.clone().unwrap_or_default()
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A request handed to the session task.
struct Outbound {
    seq: u32,
    request: Request,
}

/// The running session of a connected handle.
struct Runtime {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One upstream connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use market_gateway::infrastructure::broadcast::EventHub;
/// use market_gateway::infrastructure::codec::MsgPackCodec;
/// use market_gateway::infrastructure::config::{ConnectionSettings, Token};
/// use market_gateway::infrastructure::upstream::{FetchOptions, ProtocolConnection};
///
/// async fn example() -> Result<(), market_gateway::GatewayError> {
///     let connection = ProtocolConnection::new(
///         1,
///         Arc::new(MsgPackCodec::new()),
///         ConnectionSettings::default(),
///         Arc::new(EventHub::with_defaults()),
///     );
///     connection
///         .connect("wss://md.example.com/ws", &Token::new("secret"))
///         .await?;
///
///     let result = connection
///         .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote").fields(["close"]))
///         .await?;
///     println!("{} rows", result.count);
///
///     connection.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct ProtocolConnection {
    shared: Arc<Shared>,
    codec: Arc<dyn WireCodec>,
    settings: ConnectionSettings,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for ProtocolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolConnection")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl ProtocolConnection {
    /// Create an idle connection.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        codec: Arc<dyn WireCodec>,
        settings: ConnectionSettings,
        events: SharedEventHub,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(id, events)),
            codec,
            settings,
            runtime: Mutex::new(None),
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether fetches and subscriptions are accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the transport and bootstrap.
    ///
    /// Resolves once the universe revision is loaded; seeds keep loading in
    /// the background (see [`Self::wait_seeds_loaded`]).
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidState`] if a session is already active
    /// - [`GatewayError::Transport`] if the socket cannot be opened
    /// - Any error that ended the bootstrap
    pub async fn connect(&self, url: &str, token: &Token) -> Result<(), GatewayError> {
        self.begin()?;
        tracing::info!(connection = self.id(), url, "Connecting to upstream");

        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => self.start(stream, token.clone()).await,
            Err(e) => {
                metrics::record_transport_error("connect");
                let error = GatewayError::Transport(e.to_string());
                self.shared.set_state(ConnectionState::Failed);
                self.shared.emit(LifecycleEvent::Error {
                    connection: self.id(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Bootstrap over an already-open WebSocket.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`], minus socket opening.
    pub async fn connect_with_stream<S>(
        &self,
        stream: WebSocketStream<S>,
        token: &Token,
    ) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.begin()?;
        self.start(stream, token.clone()).await
    }

    fn begin(&self) -> Result<(), GatewayError> {
        self.shared
            .try_begin()
            .map_err(|state| GatewayError::InvalidState(format!("connect while {state}")))?;
        if let Some(stale) = self.runtime.lock().take() {
            stale.cancel.cancel();
        }
        self.shared.reset();
        Ok(())
    }

    async fn start<S>(&self, stream: WebSocketStream<S>, token: Token) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_capacity.max(1));
        let cancel = CancellationToken::new();

        let session = Session::new(Arc::clone(&self.shared), Arc::clone(&self.codec), token, ready_tx);
        let task = tokio::spawn(run_session(
            session,
            stream,
            outbound_rx,
            cancel.clone(),
            KeepaliveConfig::from(&self.settings),
        ));
        *self.runtime.lock() = Some(Runtime {
            outbound: outbound_tx,
            cancel,
            task,
        });

        ready_rx.await.unwrap_or(Err(GatewayError::ConnectionClosed))
    }

    /// Close the session, unsubscribing first. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };
        runtime.cancel.cancel();
        drop(runtime.outbound);
        if let Err(e) = runtime.task.await {
            tracing::warn!(connection = self.id(), error = %e, "Session task ended abnormally");
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Rows of one instrument over a time range.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotReady`] before the universe is loaded
    /// - [`GatewayError::Server`] when upstream rejects the request
    /// - [`GatewayError::Timeout`] when no response arrives in time
    /// - [`GatewayError::ConnectionClosed`] if the session ends first
    pub async fn fetch_by_code(
        &self,
        market: &str,
        code: &str,
        options: FetchOptions,
    ) -> Result<FetchResult, GatewayError> {
        let revision = self.revision_for(&[market], &options);
        let request = Request::FetchByCode(FetchByCodeRequest {
            namespace: options.namespace,
            qualified_name: options.qualified_name.clone(),
            revision,
            market: market.to_string(),
            code: code.to_string(),
            from_time_tag: options.from_time_tag,
            to_time_tag: options.to_time_tag,
            granularity: options.granularity,
            fields: options.wire_fields(),
        });
        self.round_trip(request, options.context(revision), Completion::Fetch)
            .await
    }

    /// Rows of many instruments at one time tag.
    ///
    /// # Errors
    ///
    /// Same as [`Self::fetch_by_code`].
    pub async fn fetch_by_time(
        &self,
        markets: &[String],
        codes: &[String],
        time_tag: u64,
        options: FetchOptions,
    ) -> Result<FetchResult, GatewayError> {
        let revision = self.revision_for(markets, &options);
        let request = Request::FetchByTime(FetchByTimeRequest {
            namespace: options.namespace,
            qualified_name: options.qualified_name.clone(),
            revision,
            markets: markets.to_vec(),
            codes: codes.to_vec(),
            time_tag,
            granularity: options.granularity,
            fields: options.wire_fields(),
        });
        self.round_trip(request, options.context(revision), Completion::Fetch)
            .await
    }

    /// Rows of many instruments over the options' time range.
    ///
    /// # Errors
    ///
    /// Same as [`Self::fetch_by_code`].
    pub async fn fetch_by_time_range(
        &self,
        markets: &[String],
        codes: &[String],
        options: FetchOptions,
    ) -> Result<FetchResult, GatewayError> {
        let revision = self.revision_for(markets, &options);
        let request = Request::FetchByTimeRange(FetchByTimeRangeRequest {
            namespace: options.namespace,
            qualified_name: options.qualified_name.clone(),
            revision,
            markets: markets.to_vec(),
            codes: codes.to_vec(),
            from_time_tag: options.from_time_tag,
            to_time_tag: options.to_time_tag,
            granularity: options.granularity,
            fields: options.wire_fields(),
        });
        self.round_trip(request, options.context(revision), Completion::Fetch)
            .await
    }

    /// Open an upstream subscription; rows matching it go to `sink`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::fetch_by_code`].
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: PushSink,
    ) -> Result<SubscriptionId, GatewayError> {
        self.ensure_ready()?;
        let id = SubscriptionId::generate();
        let wire = Request::Subscribe(SubscribeRequest {
            subscription_id: id.clone(),
            markets: request.markets.clone(),
            codes: request.codes.clone(),
            qualified_names: request.qualified_names.clone(),
            namespace: request.namespace,
            fields: request.fields.clone(),
            granularities: request.granularities.clone(),
        });
        self.shared
            .subscriptions
            .write()
            .insert(id.clone(), LocalSubscription::new(request, sink));

        let result = self
            .round_trip(
                wire,
                RequestContext::Subscribe {
                    subscription_id: id.clone(),
                },
                Completion::Subscribe,
            )
            .await;
        if let Err(error) = &result {
            self.shared.subscriptions.write().remove(&id);
            if matches!(error, GatewayError::Timeout(_)) {
                self.abandon_subscription(id);
            }
        }
        result
    }

    /// Close a subscription whose confirmation never arrived. The
    /// Subscribe frame is already on the wire, so upstream may have
    /// opened it.
    fn abandon_subscription(&self, id: SubscriptionId) {
        let Some(outbound) = self
            .runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.outbound.clone())
        else {
            return;
        };
        let seq = self
            .shared
            .correlator
            .lock()
            .track(PendingRequest::internal(RequestContext::Unsubscribe {
                subscription_id: id.clone(),
            }));
        tracing::warn!(
            connection = self.id(),
            subscription_id = %id,
            "Subscribe timed out, closing it upstream"
        );
        let request = Request::Unsubscribe {
            subscription_id: id,
        };
        if outbound.try_send(Outbound { seq, request }).is_err() {
            let _ = self.shared.correlator.lock().resolve(seq);
        }
    }

    /// Close an upstream subscription. Unknown ids are a no-op.
    ///
    /// Rows stop being routed immediately, before upstream confirms.
    ///
    /// # Errors
    ///
    /// Same as [`Self::fetch_by_code`].
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), GatewayError> {
        if self.shared.subscriptions.write().remove(&id).is_none() {
            return Ok(());
        }
        self.round_trip(
            Request::Unsubscribe {
                subscription_id: id.clone(),
            },
            RequestContext::Unsubscribe {
                subscription_id: id,
            },
            Completion::Unsubscribe,
        )
        .await
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::NotReady(state.to_string()))
        }
    }

    /// Explicit revision, else the first listed market's current one.
    fn revision_for<M: AsRef<str>>(&self, markets: &[M], options: &FetchOptions) -> u32 {
        if let Some(revision) = options.revision {
            return revision;
        }
        let markets_map = self.markets();
        markets
            .first()
            .and_then(|market| markets_map.get(market.as_ref()))
            .and_then(|entry| {
                entry
                    .revisions
                    .iter()
                    .find(|(name, _)| {
                        crate::domain::schema::local_name(name)
                            == crate::domain::schema::local_name(&options.qualified_name)
                    })
                    .map(|(_, revision)| *revision)
            })
            .unwrap_or(LATEST_REVISION)
    }

    async fn round_trip<T>(
        &self,
        request: Request,
        context: RequestContext,
        completion: fn(oneshot::Sender<Result<T, GatewayError>>) -> Completion,
    ) -> Result<T, GatewayError> {
        self.ensure_ready()?;
        let outbound = self
            .runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.outbound.clone())
            .ok_or(GatewayError::ConnectionClosed)?;

        let kind = context.kind();
        let (tx, rx) = oneshot::channel();
        let seq = self
            .shared
            .correlator
            .lock()
            .track(PendingRequest::new(context, completion(tx)));
        let started = Instant::now();

        if outbound.send(Outbound { seq, request }).await.is_err() {
            let _ = self.shared.correlator.lock().resolve(seq);
            return Err(GatewayError::ConnectionClosed);
        }

        let result = match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                let _ = self
                    .shared
                    .correlator
                    .lock()
                    .reject(seq, &RejectReason::Abandoned);
                Err(GatewayError::Timeout(self.settings.request_timeout))
            }
        };
        metrics::record_request_duration(kind, started.elapsed());
        result
    }

    // =========================================================================
    // Bootstrap State
    // =========================================================================

    /// Schema of the current session.
    #[must_use]
    pub fn schema(&self) -> Arc<SchemaRegistry> {
        self.shared.schema()
    }

    /// Market revision entries of the current session.
    #[must_use]
    pub fn markets(&self) -> Arc<MarketMap> {
        Arc::clone(&self.shared.markets.read())
    }

    /// Copy of the security index as loaded so far.
    #[must_use]
    pub fn securities(&self) -> Arc<SecurityIndex> {
        Arc::new(self.shared.securities.read().clone())
    }

    /// Schema, markets and securities captured together.
    #[must_use]
    pub fn snapshot(&self) -> BootstrapSnapshot {
        BootstrapSnapshot {
            schema: self.schema(),
            markets: self.markets(),
            securities: self.securities(),
        }
    }

    /// Seeds progress of the current session.
    #[must_use]
    pub fn seed_status(&self) -> SeedStatus {
        *self.shared.seeds.borrow()
    }

    /// Wait until every seeds response has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionClosed`] if the session ends first.
    pub async fn wait_seeds_loaded(&self) -> Result<(), GatewayError> {
        let mut rx = self.shared.seeds.subscribe();
        let status = rx
            .wait_for(|status| *status != SeedStatus::Pending)
            .await
            .map(|status| *status)
            .map_err(|_| GatewayError::ConnectionClosed)?;
        match status {
            SeedStatus::Loaded => Ok(()),
            SeedStatus::Pending | SeedStatus::Failed => Err(GatewayError::ConnectionClosed),
        }
    }

    /// Requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.lock().len()
    }

    /// Subscriptions opened on this connection.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Request timeout in effect.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }
}

impl Drop for ProtocolConnection {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.cancel.cancel();
        }
    }
}

#[async_trait]
impl SubscriptionPort for ProtocolConnection {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: PushSink,
    ) -> Result<SubscriptionId, GatewayError> {
        Self::subscribe(self, request, sink).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), GatewayError> {
        Self::unsubscribe(self, id).await
    }

    fn is_active(&self, id: &SubscriptionId) -> bool {
        self.shared.subscriptions.read().contains_key(id)
    }

    fn default_fields(&self, qualified_name: &str, namespace: u32) -> Option<Vec<String>> {
        self.schema().field_names(qualified_name, namespace)
    }
}

// =============================================================================
// Session Task
// =============================================================================

async fn run_session<S>(
    mut session: Session,
    stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    keepalive: KeepaliveConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = stream.split();

    let handshake = match session.handshake_frame() {
        Ok(bytes) => write.send(Message::Binary(bytes.into())).await.map_err(|e| {
            metrics::record_transport_error("send");
            GatewayError::Transport(e.to_string())
        }),
        Err(error) => Err(error),
    };
    if let Err(error) = handshake {
        session.teardown(Closure::Failed(error));
        return;
    }
    session.on_open();

    let keepalive_state = Arc::new(KeepaliveState::new());
    let (keepalive_tx, mut keepalive_rx) = mpsc::channel(4);
    let keepalive_cancel = cancel.child_token();
    tokio::spawn(
        KeepaliveMonitor::new(
            keepalive,
            Arc::clone(&keepalive_state),
            keepalive_tx,
            keepalive_cancel.clone(),
        )
        .run(),
    );

    let closure = 'session: loop {
        tokio::select! {
            () = cancel.cancelled() => {
                for bytes in session.unsubscribe_frames() {
                    if write.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                break Closure::Requested;
            }

            Some(outbound) = outbound_rx.recv() => {
                match session.encode_request(outbound.seq, &outbound.request) {
                    Ok(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                            metrics::record_transport_error("send");
                            break Closure::Failed(GatewayError::Transport(e.to_string()));
                        }
                    }
                    Err(error) => session.fail_request(outbound.seq, error),
                }
            }

            Some(event) = keepalive_rx.recv() => match event {
                KeepaliveEvent::Send => match session.keepalive_frame() {
                    Ok(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                            metrics::record_transport_error("send");
                            break Closure::Failed(GatewayError::Transport(e.to_string()));
                        }
                        keepalive_state.record_sent();
                    }
                    Err(error) => tracing::warn!(error = %error, "Keepalive frame not encoded"),
                },
                KeepaliveEvent::Expired(silence) => {
                    metrics::record_transport_error("keepalive");
                    break Closure::Failed(GatewayError::Transport(format!(
                        "no inbound traffic for {silence:?}"
                    )));
                }
            },

            msg = read.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    keepalive_state.record_inbound();
                    match session.handle_frame(&data) {
                        Ok(replies) => {
                            for bytes in replies {
                                if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                                    metrics::record_transport_error("send");
                                    break 'session Closure::Failed(GatewayError::Transport(e.to_string()));
                                }
                            }
                        }
                        Err(error) => break Closure::Failed(error),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    keepalive_state.record_inbound();
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        metrics::record_transport_error("send");
                        break Closure::Failed(GatewayError::Transport(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Upstream closed the connection");
                    break Closure::Failed(GatewayError::Transport("closed by upstream".into()));
                }
                Some(Ok(_)) => keepalive_state.record_inbound(),
                Some(Err(e)) => {
                    metrics::record_transport_error("read");
                    break Closure::Failed(GatewayError::Transport(e.to_string()));
                }
                None => {
                    break Closure::Failed(GatewayError::Transport("stream ended".into()));
                }
            },
        }
    };

    keepalive_cancel.cancel();
    // Later sends fail fast instead of queueing behind a dead session.
    drop(outbound_rx);
    let _ = write.close().await;
    session.teardown(closure);
}

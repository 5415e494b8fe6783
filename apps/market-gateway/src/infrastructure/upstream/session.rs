//! Frame handling for one upstream session.
//!
//! The session owns the codec context and drives the bootstrap:
//! schema, then universe revision, then one seeds request per
//! `(market, shape)`. After the universe revision arrives the session is
//! ready; seeds keep arriving in the background.
//!
//! Handlers return the frames to write next. Any error returned from
//! [`Session::handle_frame`] ends the session.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::pending::{FetchResult, PendingRequest, RequestContext};
use super::shared::Shared;
use super::state::{ConnectionState, SeedStatus};
use super::ConnectionId;
use crate::application::ports::{
    CodecContext, Command, Frame, Handshake, PROTOCOL_VERSION, PushSink, Request, Response,
    ResponseBody, UniverseSeedsRequest, WireCodec,
};
use crate::domain::correlation::RejectReason;
use crate::domain::error::GatewayError;
use crate::domain::mapping::{MapError, PlainObject, StructValueMapper};
use crate::domain::schema::{LATEST_REVISION, NAMESPACE_GLOBAL, SchemaRegistry};
use crate::domain::subscription::SubscriptionId;
use crate::domain::universe::{MARKET_QUALIFIED_NAME, MarketMap, MarketRevisionEntry, SecurityIndex};
use crate::infrastructure::broadcast::{DataEvent, LifecycleEvent};
use crate::infrastructure::config::Token;
use crate::infrastructure::metrics;

/// Frames to write after handling one inbound frame.
pub(super) type Replies = Vec<Vec<u8>>;

/// Why the session loop ended.
#[derive(Debug)]
pub(super) enum Closure {
    /// `disconnect()` was called.
    Requested,
    /// Transport failure or fatal protocol error.
    Failed(GatewayError),
}

pub(super) struct Session {
    shared: Arc<Shared>,
    codec: Arc<dyn WireCodec>,
    token: Token,
    context: Option<Box<dyn CodecContext>>,
    ready_tx: Option<oneshot::Sender<Result<(), GatewayError>>>,
    seeds_expected: usize,
    seeds_received: usize,
}

impl Session {
    pub(super) fn new(
        shared: Arc<Shared>,
        codec: Arc<dyn WireCodec>,
        token: Token,
        ready_tx: oneshot::Sender<Result<(), GatewayError>>,
    ) -> Self {
        Self {
            shared,
            codec,
            token,
            context: None,
            ready_tx: Some(ready_tx),
            seeds_expected: 0,
            seeds_received: 0,
        }
    }

    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    const fn bootstrapping(&self) -> bool {
        self.ready_tx.is_some()
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    pub(super) fn handshake_frame(&self) -> Result<Vec<u8>, GatewayError> {
        let payload = self.codec.encode_handshake(&Handshake {
            token: self.token.expose().to_string(),
            protocol_version: PROTOCOL_VERSION,
        })?;
        let bytes = self
            .codec
            .encode_frame(&Frame::new(Command::Handshake, 0, payload))?;
        metrics::record_frame_sent(Command::Handshake);
        Ok(bytes)
    }

    pub(super) fn keepalive_frame(&self) -> Result<Vec<u8>, GatewayError> {
        let bytes = self
            .codec
            .encode_frame(&Frame::new(Command::Keepalive, 0, Vec::new()))?;
        metrics::record_frame_sent(Command::Keepalive);
        Ok(bytes)
    }

    /// Transport is open and the handshake went out.
    pub(super) fn on_open(&self) {
        self.shared.set_state(ConnectionState::AwaitingSchema);
        tracing::info!(connection = self.id(), "Upstream connected, handshake sent");
        self.shared.emit(LifecycleEvent::Connected {
            connection: self.id(),
        });
    }

    pub(super) fn encode_request(&self, seq: u32, request: &Request) -> Result<Vec<u8>, GatewayError> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| GatewayError::NotReady("no codec context".into()))?;
        let payload = context.encode_request(self.token.expose(), request)?;
        let bytes = self
            .codec
            .encode_frame(&Frame::new(request.command(), seq, payload))?;
        metrics::record_frame_sent(request.command());
        Ok(bytes)
    }

    /// Fail a caller whose request never made it onto the wire.
    pub(super) fn fail_request(&self, seq: u32, error: GatewayError) {
        let pending = self.shared.correlator.lock().resolve(seq);
        if let Some(pending) = pending {
            tracing::warn!(
                connection = self.id(),
                sequence_id = seq,
                error = %error,
                "Request could not be sent"
            );
            pending.fail(error);
        }
    }

    /// Register a bootstrap request and encode it.
    fn track_internal(
        &self,
        context: RequestContext,
        request: &Request,
    ) -> Result<Vec<u8>, GatewayError> {
        let seq = self
            .shared
            .correlator
            .lock()
            .track(PendingRequest::internal(context));
        match self.encode_request(seq, request) {
            Ok(bytes) => Ok(bytes),
            Err(error) => {
                let _ = self.shared.correlator.lock().resolve(seq);
                Err(error)
            }
        }
    }

    /// Unsubscribe frames for every local subscription, sent on close.
    pub(super) fn unsubscribe_frames(&self) -> Replies {
        if self.context.is_none() {
            return Vec::new();
        }
        let ids: Vec<SubscriptionId> = self.shared.subscriptions.read().keys().cloned().collect();
        ids.into_iter()
            .filter_map(|subscription_id| {
                let seq = self.shared.correlator.lock().next_sequence_id();
                self.encode_request(seq, &Request::Unsubscribe { subscription_id })
                    .inspect_err(|error| {
                        tracing::warn!(connection = self.id(), error = %error, "Unsubscribe on close failed");
                    })
                    .ok()
            })
            .collect()
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle one inbound transport message.
    ///
    /// # Errors
    ///
    /// Returns the error that ends the session: protocol violations and
    /// server errors during bootstrap, or an encode failure for a
    /// bootstrap request.
    pub(super) fn handle_frame(&mut self, bytes: &[u8]) -> Result<Replies, GatewayError> {
        let frame = match self.codec.decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => return self.violation("undecodable_frame", format!("undecodable frame: {e}")),
        };
        metrics::record_frame_received(frame.command);

        match frame.command {
            Command::Keepalive => Ok(Vec::new()),
            Command::Handshake => {
                tracing::debug!(connection = self.id(), "Handshake acknowledged");
                Ok(Vec::new())
            }
            Command::Schema => self.on_schema(&frame.payload),
            command => {
                let Some(context) = self.context.as_ref() else {
                    return self.violation("before_schema", format!("{command} frame before schema"));
                };
                let response = match context.decode_response(command, &frame.payload) {
                    Ok(response) => response,
                    Err(e) => {
                        return self.violation("undecodable_payload", format!("{command} payload: {e}"));
                    }
                };
                self.dispatch(command, frame.sequence_id, response)
            }
        }
    }

    fn dispatch(&mut self, command: Command, seq: u32, response: Response) -> Result<Replies, GatewayError> {
        match command {
            Command::UniverseRevision => self.on_universe_revision(seq, response),
            Command::UniverseSeeds => {
                self.on_universe_seeds(seq, response);
                Ok(Vec::new())
            }
            Command::FetchByCode | Command::FetchByTime | Command::FetchByTimeRange => {
                self.on_fetch(command, seq, response);
                Ok(Vec::new())
            }
            Command::Subscribe => {
                self.on_subscribed(seq, response);
                Ok(Vec::new())
            }
            Command::Unsubscribe => {
                self.on_unsubscribed(seq, response);
                Ok(Vec::new())
            }
            Command::PushData => {
                self.on_push(response);
                Ok(Vec::new())
            }
            Command::MarketStatus => self.on_market_status(response),
            Command::Keepalive | Command::Schema | Command::Handshake => Ok(Vec::new()),
        }
    }

    /// During bootstrap a violation ends the session; afterwards the frame
    /// is dropped.
    fn violation(&self, kind: &'static str, detail: String) -> Result<Replies, GatewayError> {
        metrics::record_protocol_violation(kind);
        self.fatal_or_log(GatewayError::ProtocolViolation(detail))
    }

    fn fatal_or_log(&self, error: GatewayError) -> Result<Replies, GatewayError> {
        if self.bootstrapping() {
            return Err(error);
        }
        tracing::warn!(connection = self.id(), error = %error, "Frame dropped");
        Ok(Vec::new())
    }

    fn take_pending(&self, command: Command, seq: u32) -> Option<PendingRequest> {
        let pending = self.shared.correlator.lock().resolve(seq);
        if pending.is_none() {
            metrics::record_correlation_miss(command);
            tracing::warn!(
                connection = self.id(),
                command = %command,
                error = %GatewayError::CorrelationMiss(seq),
                "Response dropped"
            );
        }
        pending
    }

    fn on_schema(&mut self, payload: &[u8]) -> Result<Replies, GatewayError> {
        let descriptors = match self.codec.decode_schema(payload) {
            Ok(descriptors) => descriptors,
            Err(e) => return self.violation("bad_schema", format!("schema payload: {e}")),
        };
        let registry = Arc::new(SchemaRegistry::load(descriptors));
        let context = match self.codec.build_context(&registry) {
            Ok(context) => context,
            Err(e) => return self.fatal_or_log(e.into()),
        };

        // The previous context is released before the new one serves any frame.
        self.context = Some(context);
        *self.shared.schema.write() = Arc::clone(&registry);

        tracing::info!(
            connection = self.id(),
            descriptors = registry.len(),
            "Schema loaded"
        );
        self.shared.emit(LifecycleEvent::SchemaLoaded {
            connection: self.id(),
            descriptors: registry.len(),
        });

        self.shared.set_state(ConnectionState::AwaitingUniverseRevision);
        let frame = self.track_internal(RequestContext::UniverseRevision, &Request::UniverseRevision)?;
        Ok(vec![frame])
    }

    fn on_universe_revision(&mut self, seq: u32, response: Response) -> Result<Replies, GatewayError> {
        let Some(pending) = self.take_pending(Command::UniverseRevision, seq) else {
            return Ok(Vec::new());
        };
        if pending.context != RequestContext::UniverseRevision {
            let kind = pending.context.kind();
            pending.fail(GatewayError::ProtocolViolation(format!(
                "universe revision response for a {kind} request"
            )));
            return self.violation("command_mismatch", format!("universe revision answered seq {seq}"));
        }
        if !response.status.is_ok() {
            metrics::record_server_error(Command::UniverseRevision, response.status.code);
            return self.fatal_or_log(GatewayError::server(response.status.code, response.status.message));
        }

        let descriptor = match self
            .shared
            .schema()
            .resolve(NAMESPACE_GLOBAL, MARKET_QUALIFIED_NAME, LATEST_REVISION)
        {
            Ok(descriptor) => descriptor,
            Err(e) => return self.fatal_or_log(e.into()),
        };
        let mapper = StructValueMapper::bind(descriptor);

        let mut markets = MarketMap::new();
        for record in response.into_records() {
            let header = record.header();
            if header.namespace != mapper.descriptor().namespace || header.meta_id != mapper.descriptor().meta_id {
                tracing::debug!(meta_id = header.meta_id, "Skipping non-market universe row");
                continue;
            }
            let namespace = header.namespace;
            match mapper.from_record(record.as_ref()) {
                Ok(object) => {
                    if let Some(entry) = MarketRevisionEntry::from_object(namespace, &object) {
                        markets.insert(entry.market.clone(), entry);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Unreadable market row"),
            }
        }

        let mut securities = SecurityIndex::default();
        let mut frames = Vec::new();
        for entry in markets.values() {
            securities.ensure_market(&entry.market);
            for (qualified_name, revision) in &entry.revisions {
                let request = Request::UniverseSeeds(UniverseSeedsRequest {
                    namespace: entry.namespace,
                    qualified_name: qualified_name.clone(),
                    revision: *revision,
                    market: entry.market.clone(),
                    trade_day: entry.trade_day,
                });
                let context = RequestContext::UniverseSeeds {
                    namespace: entry.namespace,
                    qualified_name: qualified_name.clone(),
                    revision: *revision,
                    market: entry.market.clone(),
                };
                frames.push(self.track_internal(context, &request)?);
            }
        }

        let market_count = markets.len();
        *self.shared.markets.write() = Arc::new(markets);
        *self.shared.securities.write() = securities;
        self.seeds_expected = frames.len();
        self.seeds_received = 0;
        self.shared.seeds.send_replace(SeedStatus::Pending);

        tracing::info!(
            connection = self.id(),
            markets = market_count,
            seeds_requests = self.seeds_expected,
            "Universe loaded"
        );
        self.shared.emit(LifecycleEvent::UniverseLoaded {
            connection: self.id(),
            markets: market_count,
        });

        self.shared.set_state(ConnectionState::AwaitingUniverseSeeds {
            outstanding: self.seeds_expected,
        });
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(Ok(()));
        }
        if self.seeds_expected == 0 {
            self.finish_seeds();
        }
        Ok(frames)
    }

    fn on_universe_seeds(&mut self, seq: u32, response: Response) {
        let Some(pending) = self.take_pending(Command::UniverseSeeds, seq) else {
            return;
        };
        let RequestContext::UniverseSeeds {
            namespace,
            qualified_name,
            revision,
            market,
        } = pending.context.clone()
        else {
            metrics::record_protocol_violation("command_mismatch");
            let kind = pending.context.kind();
            pending.fail(GatewayError::ProtocolViolation(format!(
                "seeds response for a {kind} request"
            )));
            return;
        };

        // Failed responses still count toward completion.
        self.seeds_received += 1;
        if response.status.is_ok() {
            self.ingest_seeds(namespace, &qualified_name, revision, &market, response);
        } else {
            metrics::record_server_error(Command::UniverseSeeds, response.status.code);
            tracing::warn!(
                connection = self.id(),
                market = %market,
                qualified_name = %qualified_name,
                error = %GatewayError::server(response.status.code, response.status.message),
                "Seeds request failed"
            );
        }

        let outstanding = self.seeds_expected.saturating_sub(self.seeds_received);
        if outstanding == 0 {
            self.finish_seeds();
        } else {
            self.shared
                .set_state(ConnectionState::AwaitingUniverseSeeds { outstanding });
        }
    }

    fn ingest_seeds(
        &self,
        namespace: u32,
        qualified_name: &str,
        revision: u32,
        market: &str,
        response: Response,
    ) {
        let descriptor = match self.shared.schema().resolve(namespace, qualified_name, revision) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(connection = self.id(), error = %e, "Seeds shape unknown");
                return;
            }
        };
        let mapper = StructValueMapper::bind(descriptor);
        let mut securities = self.shared.securities.write();
        let mut added = 0;
        for record in response.into_records() {
            match mapper.from_record(record.as_ref()) {
                Ok(object) => added += securities.ingest(market, &object),
                Err(e) => tracing::warn!(market, error = %e, "Unreadable seeds row"),
            }
        }
        tracing::debug!(market, qualified_name, added, "Seeds ingested");
    }

    fn finish_seeds(&self) {
        self.shared.set_state(ConnectionState::Ready);
        let securities = self.shared.securities.read().len();
        self.shared.seeds.send_replace(SeedStatus::Loaded);
        tracing::info!(connection = self.id(), securities, "Seeds loaded");
        self.shared.emit(LifecycleEvent::SeedsLoaded {
            connection: self.id(),
            securities,
        });
    }

    fn on_fetch(&self, command: Command, seq: u32, response: Response) {
        let Some(pending) = self.take_pending(command, seq) else {
            return;
        };
        let RequestContext::Fetch {
            namespace,
            qualified_name,
            revision,
            fields,
        } = pending.context.clone()
        else {
            metrics::record_protocol_violation("command_mismatch");
            let kind = pending.context.kind();
            pending.fail(GatewayError::ProtocolViolation(format!(
                "{command} response for a {kind} request"
            )));
            return;
        };

        if !response.status.is_ok() {
            metrics::record_server_error(command, response.status.code);
            pending.fail(GatewayError::server(response.status.code, response.status.message));
            return;
        }

        // Rows are shaped by what was asked for, not by their header.
        let descriptor = match self.shared.schema().resolve(namespace, &qualified_name, revision) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                pending.fail(e.into());
                return;
            }
        };
        let mapper = StructValueMapper::bind(descriptor);
        let rows: Result<Vec<PlainObject>, MapError> = response
            .into_records()
            .iter()
            .map(|record| {
                mapper.from_record(record.as_ref()).map(|object| {
                    let mut plain = object.to_plain();
                    if let Some(fields) = &fields
                        && !fields.is_empty()
                    {
                        plain.retain_fields(fields);
                    }
                    plain
                })
            })
            .collect();

        match rows {
            Ok(rows) => {
                tracing::debug!(
                    connection = self.id(),
                    sequence_id = seq,
                    qualified_name = %qualified_name,
                    rows = rows.len(),
                    "Fetch completed"
                );
                let _ = self.shared.events.send_data(DataEvent::Historical {
                    connection: self.id(),
                    sequence_id: seq,
                    qualified_name,
                    records: Arc::new(rows.clone()),
                });
                pending.complete_fetch(FetchResult::new(rows));
            }
            Err(e) => pending.fail(GatewayError::Mapping(e.to_string())),
        }
    }

    fn on_subscribed(&self, seq: u32, response: Response) {
        let pending = self.shared.correlator.lock().resolve(seq);
        let id = match (&response.body, pending.as_ref().map(|p| &p.context)) {
            (ResponseBody::Subscribed { subscription_id }, _)
            | (_, Some(RequestContext::Subscribe { subscription_id })) => Some(subscription_id.clone()),
            _ => None,
        };
        let Some(id) = id.filter(|id| self.shared.subscriptions.read().contains_key(id)) else {
            metrics::record_protocol_violation("unmatched_subscription");
            let error = GatewayError::ProtocolViolation(format!(
                "subscription confirmation (seq {seq}) matches no local subscription"
            ));
            tracing::warn!(connection = self.id(), error = %error, "Confirmation dropped");
            if let Some(pending) = pending {
                pending.fail(error);
            }
            return;
        };

        if !response.status.is_ok() {
            self.shared.subscriptions.write().remove(&id);
            metrics::record_server_error(Command::Subscribe, response.status.code);
            let error = GatewayError::server(response.status.code, response.status.message);
            match pending {
                Some(pending) => pending.fail(error),
                None => tracing::warn!(subscription_id = %id, error = %error, "Subscription rejected"),
            }
            return;
        }

        if let Some(local) = self.shared.subscriptions.write().get_mut(&id) {
            local.confirmed = true;
        }
        tracing::debug!(connection = self.id(), subscription_id = %id, "Subscription confirmed");
        match pending {
            Some(pending) => pending.complete_ack(id),
            None => metrics::record_correlation_miss(Command::Subscribe),
        }
    }

    fn on_unsubscribed(&self, seq: u32, response: Response) {
        let Some(pending) = self.take_pending(Command::Unsubscribe, seq) else {
            return;
        };
        let id = match pending.context.clone() {
            RequestContext::Unsubscribe { subscription_id } => subscription_id,
            other => {
                let kind = other.kind();
                metrics::record_protocol_violation("command_mismatch");
                pending.fail(GatewayError::ProtocolViolation(format!(
                    "unsubscribe response for a {kind} request"
                )));
                return;
            }
        };
        if response.status.is_ok() {
            pending.complete_ack(id);
        } else {
            metrics::record_server_error(Command::Unsubscribe, response.status.code);
            pending.fail(GatewayError::server(response.status.code, response.status.message));
        }
    }

    fn on_push(&self, response: Response) {
        let schema = self.shared.schema();
        let mut delivered = 0_u64;
        let mut unmatched = 0_u64;

        for record in response.into_records() {
            let header = record.header();
            let Some(descriptor) = schema.get(header.namespace, header.meta_id) else {
                metrics::record_protocol_violation("unknown_meta_id");
                metrics::record_push_rows_dropped("unknown_shape", 1);
                tracing::warn!(
                    connection = self.id(),
                    namespace = header.namespace,
                    meta_id = header.meta_id,
                    "Push row with unknown shape dropped"
                );
                continue;
            };
            let object = match StructValueMapper::bind(Arc::clone(&descriptor)).from_record(record.as_ref()) {
                Ok(object) => object,
                Err(e) => {
                    metrics::record_push_rows_dropped("unreadable", 1);
                    tracing::warn!(connection = self.id(), error = %e, "Unreadable push row");
                    continue;
                }
            };

            let targets: Vec<(SubscriptionId, PushSink)> = self
                .shared
                .subscriptions
                .read()
                .iter()
                .filter(|(_, local)| local.accepts(&descriptor, &object.market, &object.code))
                .map(|(id, local)| (id.clone(), Arc::clone(&local.sink)))
                .collect();
            if targets.is_empty() {
                unmatched += 1;
                continue;
            }

            let plain = Arc::new(object.to_plain());
            for (subscription_id, sink) in targets {
                sink(plain.as_ref());
                let _ = self.shared.events.send_data(DataEvent::RealTime {
                    connection: self.id(),
                    subscription_id,
                    record: Arc::clone(&plain),
                });
                delivered += 1;
            }
        }

        metrics::record_push_rows(delivered);
        if unmatched > 0 {
            metrics::record_push_rows_dropped("no_subscription", unmatched);
            tracing::debug!(connection = self.id(), unmatched, "Push rows without subscription");
        }
    }

    fn on_market_status(&self, response: Response) -> Result<Replies, GatewayError> {
        match response.body {
            ResponseBody::MarketStatus(status) => {
                tracing::info!(
                    connection = self.id(),
                    market = %status.market,
                    state = ?status.state,
                    "Market status"
                );
                self.shared.emit(LifecycleEvent::MarketStatus {
                    connection: self.id(),
                    status,
                });
                Ok(Vec::new())
            }
            other => self.violation("bad_market_status", format!("market status body {other:?}")),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Release the context, fail every pending request and settle state.
    pub(super) fn teardown(mut self, closure: Closure) {
        self.context = None;

        let rejected = self
            .shared
            .correlator
            .lock()
            .reject_all(&RejectReason::ConnectionClosed);
        let rejected_count = rejected.len();
        for (_, pending) in rejected {
            pending.fail(GatewayError::ConnectionClosed);
        }
        self.shared.subscriptions.write().clear();
        self.shared.seeds.send_if_modified(|status| {
            if *status == SeedStatus::Pending {
                *status = SeedStatus::Failed;
                true
            } else {
                false
            }
        });

        let connection = self.id();
        let (requested, error) = match closure {
            Closure::Requested => (true, GatewayError::ConnectionClosed),
            Closure::Failed(error) => (false, error),
        };

        if let Some(ready_tx) = self.ready_tx.take() {
            self.shared.set_state(ConnectionState::Failed);
            tracing::warn!(connection, error = %error, "Bootstrap failed");
            self.shared.emit(LifecycleEvent::Error {
                connection,
                error: error.clone(),
            });
            let _ = ready_tx.send(Err(error));
            return;
        }

        self.shared.set_state(ConnectionState::Closed);
        if requested {
            tracing::info!(connection, rejected = rejected_count, "Upstream disconnected");
        } else {
            tracing::warn!(connection, rejected = rejected_count, error = %error, "Upstream connection lost");
            self.shared.emit(LifecycleEvent::Error { connection, error });
        }
        self.shared.emit(LifecycleEvent::Disconnected { connection });
    }
}

//! Fake upstream for integration tests.
//!
//! Accepts WebSocket connections on a loopback port, pushes a schema after
//! the handshake and answers requests through a pluggable responder.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use market_gateway::application::ports::{Command, Frame, Request, ResponseStatus, WireCodec};
use market_gateway::domain::record::{FieldValue, MemoryRecord, RecordHeader};
use market_gateway::domain::schema::{FieldDescriptor, FieldType, MetaDescriptor};
use market_gateway::infrastructure::codec::{MsgPackCodec, ResponsePayload};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const MARKET_META_ID: u32 = 3;
pub const QUOTE_META_ID: u32 = 12;
pub const TOKEN: &str = "test-token";

// =============================================================================
// Schema and rows
// =============================================================================

pub fn market_descriptor() -> MetaDescriptor {
    MetaDescriptor::new(
        0,
        MARKET_META_ID,
        "global::Market",
        1,
        vec![
            FieldDescriptor::new("trade_day", FieldType::Int32, 0),
            FieldDescriptor::new("name", FieldType::String, 1),
            FieldDescriptor::new("qualified_names", FieldType::StringVector, 2),
            FieldDescriptor::new("revisions", FieldType::Int32Vector, 3),
        ],
    )
}

pub fn quote_descriptor() -> MetaDescriptor {
    MetaDescriptor::new(
        0,
        QUOTE_META_ID,
        "global::SampleQuote",
        1,
        vec![
            FieldDescriptor::new("open", FieldType::Double, 0),
            FieldDescriptor::new("high", FieldType::Double, 1),
            FieldDescriptor::new("low", FieldType::Double, 2),
            FieldDescriptor::new("close", FieldType::Double, 3),
            FieldDescriptor::new("volume", FieldType::Int64, 4),
            FieldDescriptor::new("amount", FieldType::Double, 5),
        ],
    )
}

pub fn schema() -> Vec<MetaDescriptor> {
    vec![market_descriptor(), quote_descriptor()]
}

pub fn market_row(market: &str, revisions: &[(&str, i32)]) -> MemoryRecord {
    MemoryRecord::from_slots(
        RecordHeader {
            namespace: 0,
            meta_id: MARKET_META_ID,
            market: market.to_string(),
            code: market.to_string(),
            time_tag: 0,
            granularity: 0,
        },
        vec![
            Some(FieldValue::Int32(20_250_101)),
            Some(FieldValue::String(format!("{market} exchange"))),
            Some(FieldValue::StringVector(
                revisions.iter().map(|(name, _)| (*name).to_string()).collect(),
            )),
            Some(FieldValue::Int32Vector(
                revisions.iter().map(|(_, rev)| *rev).collect(),
            )),
        ],
    )
}

#[allow(clippy::cast_precision_loss)]
pub fn quote_row(market: &str, code: &str, time_tag: u64) -> MemoryRecord {
    let base = time_tag as f64;
    MemoryRecord::from_slots(
        RecordHeader {
            namespace: 0,
            meta_id: QUOTE_META_ID,
            market: market.to_string(),
            code: code.to_string(),
            time_tag,
            granularity: 0,
        },
        vec![
            Some(FieldValue::Double(base)),
            Some(FieldValue::Double(base + 2.0)),
            Some(FieldValue::Double(base - 1.0)),
            Some(FieldValue::Double(base + 1.0)),
            Some(FieldValue::Int64(1_000)),
            Some(FieldValue::Double(base * 1_000.0)),
        ],
    )
}

// =============================================================================
// Replies
// =============================================================================

/// One frame the fake sends back.
#[derive(Debug, Clone)]
pub struct Reply {
    pub command: Command,
    pub sequence_id: u32,
    pub status: ResponseStatus,
    pub body: ResponsePayload,
}

impl Reply {
    pub fn ok(command: Command, sequence_id: u32, body: ResponsePayload) -> Self {
        Self {
            command,
            sequence_id,
            status: ResponseStatus::ok(),
            body,
        }
    }

    pub fn error(command: Command, sequence_id: u32, code: i32, message: &str) -> Self {
        Self {
            command,
            sequence_id,
            status: ResponseStatus {
                code,
                message: message.to_string(),
            },
            body: ResponsePayload::Empty,
        }
    }

    pub fn push(rows: Vec<MemoryRecord>) -> Self {
        Self::ok(Command::PushData, 0, ResponsePayload::Records(rows))
    }
}

/// Maps `(sequence_id, request)` to the frames sent back.
pub type Responder = Arc<dyn Fn(u32, &Request) -> Vec<Reply> + Send + Sync>;

pub fn responder(
    f: impl Fn(u32, &Request) -> Vec<Reply> + Send + Sync + 'static,
) -> Responder {
    Arc::new(f)
}

/// DCE with one `SampleQuote` revision, empty seeds, three-row fetches and
/// acknowledged subscriptions.
pub fn default_responder() -> Responder {
    responder(|seq, request| match request {
        Request::UniverseRevision => vec![Reply::ok(
            Command::UniverseRevision,
            seq,
            ResponsePayload::Records(vec![market_row("DCE", &[("SampleQuote", 1)])]),
        )],
        Request::UniverseSeeds(_) => vec![Reply::ok(
            Command::UniverseSeeds,
            seq,
            ResponsePayload::Records(Vec::new()),
        )],
        Request::FetchByCode(fetch) => vec![Reply::ok(
            Command::FetchByCode,
            seq,
            ResponsePayload::Records(
                (1..=3)
                    .map(|t| quote_row(&fetch.market, &fetch.code, t))
                    .collect(),
            ),
        )],
        Request::FetchByTime(fetch) => vec![Reply::ok(
            Command::FetchByTime,
            seq,
            ResponsePayload::Records(
                fetch
                    .codes
                    .iter()
                    .map(|code| quote_row(&fetch.markets[0], code, fetch.time_tag))
                    .collect(),
            ),
        )],
        Request::FetchByTimeRange(fetch) => vec![Reply::ok(
            Command::FetchByTimeRange,
            seq,
            ResponsePayload::Records(vec![quote_row(&fetch.markets[0], &fetch.codes[0], 1)]),
        )],
        Request::Subscribe(subscribe) => vec![Reply::ok(
            Command::Subscribe,
            seq,
            ResponsePayload::Subscribed {
                subscription_id: subscribe.subscription_id.clone(),
            },
        )],
        Request::Unsubscribe { subscription_id } => vec![Reply::ok(
            Command::Unsubscribe,
            seq,
            ResponsePayload::Unsubscribed {
                subscription_id: subscription_id.clone(),
            },
        )],
    })
}

// =============================================================================
// Server
// =============================================================================

/// Loopback upstream speaking the reference codec.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<(u32, Request)>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    push_tx: broadcast::Sender<Reply>,
    kill: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        Self::with_responder(default_responder()).await
    }

    pub async fn with_responder(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, _) = broadcast::channel(64);
        let kill = CancellationToken::new();

        let accept_task = {
            let requests = Arc::clone(&requests);
            let tokens = Arc::clone(&tokens);
            let push_tx = push_tx.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    tokio::spawn(serve(
                        ws,
                        Arc::clone(&responder),
                        Arc::clone(&requests),
                        Arc::clone(&tokens),
                        push_tx.subscribe(),
                        kill.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            requests,
            tokens,
            push_tx,
            kill,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<(u32, Request)> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, command: Command) -> Vec<(u32, Request)> {
        self.requests()
            .into_iter()
            .filter(|(_, r)| r.command() == command)
            .collect()
    }

    pub fn handshake_tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Send an unsolicited frame on every open session.
    pub fn push(&self, reply: Reply) {
        let _ = self.push_tx.send(reply);
    }

    /// Close every open session with a close frame.
    pub fn close_sessions(&self) {
        self.kill.cancel();
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn encode(codec: &MsgPackCodec, reply: Reply) -> Message {
    let payload = codec.encode_response(reply.status, reply.body).unwrap();
    let frame = Frame::new(reply.command, reply.sequence_id, payload);
    Message::Binary(codec.encode_frame(&frame).unwrap().into())
}

async fn serve<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    responder: Responder,
    requests: Arc<Mutex<Vec<(u32, Request)>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    mut pushes: broadcast::Receiver<Reply>,
    kill: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let codec = MsgPackCodec::new();
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            () = kill.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            message = read.next() => {
                let Some(Ok(message)) = message else { return };
                let Message::Binary(bytes) = message else { continue };
                let Ok(frame) = codec.decode_frame(&bytes) else { continue };
                match frame.command {
                    Command::Handshake => {
                        let handshake = codec.decode_handshake(&frame.payload).unwrap();
                        tokens.lock().push(handshake.token);
                        let schema = codec.encode_schema(&schema()).unwrap();
                        let frame = Frame::new(Command::Schema, 0, schema);
                        let bytes = codec.encode_frame(&frame).unwrap();
                        if write.send(Message::Binary(bytes.into())).await.is_err() {
                            return;
                        }
                    }
                    Command::Keepalive => {}
                    _ => {
                        let (_, request) = codec.decode_request(&frame.payload).unwrap();
                        requests.lock().push((frame.sequence_id, request.clone()));
                        for reply in responder(frame.sequence_id, &request) {
                            if write.send(encode(&codec, reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            push = pushes.recv() => match push {
                Ok(reply) => {
                    if write.send(encode(&codec, reply)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

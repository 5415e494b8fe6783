//! Wire codec port.
//!
//! The codec owns every byte-level concern: framing, schema decoding and
//! payload encoding. The gateway hands it typed requests and receives
//! typed responses whose rows are [`StructRecord`]s.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::GatewayError;
use crate::domain::record::{RecordAllocator, StructRecord};
use crate::domain::schema::{MetaDescriptor, SchemaRegistry};
use crate::domain::subscription::SubscriptionId;

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 2_022_012_301;

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Frame carries an unrecognized command id.
    #[error("unknown command id {0:#06x}")]
    UnknownCommand(u16),

    /// The codec has no payload layout for this command.
    #[error("no payload layout for {0}")]
    Unsupported(Command),
}

impl From<CodecError> for GatewayError {
    fn from(error: CodecError) -> Self {
        Self::Codec(error.to_string())
    }
}

// =============================================================================
// Commands and Frames
// =============================================================================

/// Upstream command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness ping in either direction.
    Keepalive,
    /// Schema definition pushed after the handshake.
    Schema,
    /// Client handshake.
    Handshake,
    /// Universe revision request and response.
    UniverseRevision,
    /// Universe seeds request and response.
    UniverseSeeds,
    /// Fetch a code's rows over a time range.
    FetchByCode,
    /// Fetch many codes at one time tag.
    FetchByTime,
    /// Fetch many codes over a time range.
    FetchByTimeRange,
    /// Subscribe request and confirmation.
    Subscribe,
    /// Unsubscribe request and confirmation.
    Unsubscribe,
    /// Subscription push rows.
    PushData,
    /// Market session status push.
    MarketStatus,
}

impl Command {
    /// Stable name for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keepalive => "keepalive",
            Self::Schema => "schema",
            Self::Handshake => "handshake",
            Self::UniverseRevision => "universe_revision",
            Self::UniverseSeeds => "universe_seeds",
            Self::FetchByCode => "fetch_by_code",
            Self::FetchByTime => "fetch_by_time",
            Self::FetchByTimeRange => "fetch_by_time_range",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::PushData => "push_data",
            Self::MarketStatus => "market_status",
        }
    }

    /// Whether decoding the payload needs a codec context.
    #[must_use]
    pub const fn needs_context(self) -> bool {
        !matches!(self, Self::Keepalive | Self::Schema | Self::Handshake)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command id.
    pub command: Command,
    /// Sequence id; zero for unsolicited frames.
    pub sequence_id: u32,
    /// Command payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub const fn new(command: Command, sequence_id: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            sequence_id,
            payload,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// First frame on a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Access token.
    pub token: String,
    /// Client protocol version.
    pub protocol_version: u32,
}

/// Enumerate the instruments of one market and shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseSeedsRequest {
    /// Namespace id.
    pub namespace: u32,
    /// Shape to enumerate.
    pub qualified_name: String,
    /// Shape revision.
    pub revision: u32,
    /// Market code.
    pub market: String,
    /// Trade day as `YYYYMMDD`.
    pub trade_day: i32,
}

/// Rows of one code over a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchByCodeRequest {
    /// Namespace id.
    pub namespace: u32,
    /// Shape to fetch.
    pub qualified_name: String,
    /// Revision ceiling.
    pub revision: u32,
    /// Market code.
    pub market: String,
    /// Instrument code.
    pub code: String,
    /// Inclusive start time tag.
    pub from_time_tag: u64,
    /// Inclusive end time tag.
    pub to_time_tag: u64,
    /// Bar granularity.
    pub granularity: u32,
    /// Requested fields; empty for all.
    pub fields: Vec<String>,
}

/// Rows of many codes at one time tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchByTimeRequest {
    /// Namespace id.
    pub namespace: u32,
    /// Shape to fetch.
    pub qualified_name: String,
    /// Revision ceiling.
    pub revision: u32,
    /// Market codes.
    pub markets: Vec<String>,
    /// Instrument codes.
    pub codes: Vec<String>,
    /// Time tag.
    pub time_tag: u64,
    /// Bar granularity.
    pub granularity: u32,
    /// Requested fields; empty for all.
    pub fields: Vec<String>,
}

/// Rows of many codes over a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchByTimeRangeRequest {
    /// Namespace id.
    pub namespace: u32,
    /// Shape to fetch.
    pub qualified_name: String,
    /// Revision ceiling.
    pub revision: u32,
    /// Market codes.
    pub markets: Vec<String>,
    /// Instrument codes.
    pub codes: Vec<String>,
    /// Inclusive start time tag.
    pub from_time_tag: u64,
    /// Inclusive end time tag.
    pub to_time_tag: u64,
    /// Bar granularity.
    pub granularity: u32,
    /// Requested fields; empty for all.
    pub fields: Vec<String>,
}

/// Open a streaming subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Client-chosen subscription id.
    pub subscription_id: SubscriptionId,
    /// Market codes.
    pub markets: Vec<String>,
    /// Instrument codes.
    pub codes: Vec<String>,
    /// Shapes to stream.
    pub qualified_names: Vec<String>,
    /// Namespace id.
    pub namespace: u32,
    /// Field projection.
    pub fields: Vec<String>,
    /// Bar granularities.
    pub granularities: Vec<u32>,
}

/// Request payloads that need a codec context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask for every market's revision map.
    UniverseRevision,
    /// Enumerate instruments.
    UniverseSeeds(UniverseSeedsRequest),
    /// Fetch by code.
    FetchByCode(FetchByCodeRequest),
    /// Fetch by time.
    FetchByTime(FetchByTimeRequest),
    /// Fetch by time range.
    FetchByTimeRange(FetchByTimeRangeRequest),
    /// Subscribe.
    Subscribe(SubscribeRequest),
    /// Unsubscribe.
    Unsubscribe {
        /// Subscription to close.
        subscription_id: SubscriptionId,
    },
}

impl Request {
    /// Command id this request travels under.
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::UniverseRevision => Command::UniverseRevision,
            Self::UniverseSeeds(_) => Command::UniverseSeeds,
            Self::FetchByCode(_) => Command::FetchByCode,
            Self::FetchByTime(_) => Command::FetchByTime,
            Self::FetchByTimeRange(_) => Command::FetchByTimeRange,
            Self::Subscribe(_) => Command::Subscribe,
            Self::Unsubscribe { .. } => Command::Unsubscribe,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Response header status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    /// Error code; zero on success.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl ResponseStatus {
    /// Successful status.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    /// Whether the response succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Market session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    /// Trading open.
    Open,
    /// Trading closed.
    Close,
    /// Trade day started.
    TradeDayBegin,
    /// Trade day ended.
    TradeDayEnd,
    /// Periodic clock tick.
    Tick,
}

/// Market session status push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
    /// Market code.
    pub market: String,
    /// Trade day as `YYYYMMDD`.
    pub trade_day: i32,
    /// Session state.
    pub state: MarketState,
    /// Time tag of the transition.
    pub time_tag: u64,
}

/// Decoded response body.
#[derive(Debug)]
pub enum ResponseBody {
    /// Result rows (universe, seeds, fetch, push).
    Records(Vec<Box<dyn StructRecord>>),
    /// Subscription confirmed.
    Subscribed {
        /// Confirmed subscription id.
        subscription_id: SubscriptionId,
    },
    /// Subscription closed.
    Unsubscribed {
        /// Closed subscription id.
        subscription_id: SubscriptionId,
    },
    /// Market status.
    MarketStatus(MarketStatus),
    /// No body.
    Empty,
}

/// Decoded response: status plus body.
#[derive(Debug)]
pub struct Response {
    /// Header status.
    pub status: ResponseStatus,
    /// Body.
    pub body: ResponseBody,
}

impl Response {
    /// Successful response with `body`.
    #[must_use]
    pub const fn ok(body: ResponseBody) -> Self {
        Self {
            status: ResponseStatus::ok(),
            body,
        }
    }

    /// Take the rows of a records body; empty otherwise.
    #[must_use]
    pub fn into_records(self) -> Vec<Box<dyn StructRecord>> {
        match self.body {
            ResponseBody::Records(records) => records,
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Stateless framing and schema half of the codec.
pub trait WireCodec: Send + Sync + 'static {
    /// Frame a command payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on failure.
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError>;

    /// Split a transport message into command, sequence id and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed bytes or unknown commands.
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, CodecError>;

    /// Encode the handshake payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on failure.
    fn encode_handshake(&self, handshake: &Handshake) -> Result<Vec<u8>, CodecError>;

    /// Decode a schema payload into descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed payloads.
    fn decode_schema(&self, payload: &[u8]) -> Result<Vec<MetaDescriptor>, CodecError>;

    /// Build the context for schema-dependent payloads.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the schema cannot back a context.
    fn build_context(&self, schema: &SchemaRegistry) -> Result<Box<dyn CodecContext>, CodecError>;
}

/// Schema-bound half of the codec, owned by exactly one connection.
pub trait CodecContext: RecordAllocator + Send + Sync {
    /// Encode a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on failure.
    fn encode_request(&self, token: &str, request: &Request) -> Result<Vec<u8>, CodecError>;

    /// Decode a response payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed payloads or unsupported commands.
    fn decode_response(&self, command: Command, payload: &[u8]) -> Result<Response, CodecError>;
}

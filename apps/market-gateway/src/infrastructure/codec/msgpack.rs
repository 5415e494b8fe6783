//! `MessagePack` Reference Codec
//!
//! Frames every transport message as a `MessagePack` map:
//!
//! ```json
//! {"cmd": 1282, "seq": 7, "payload": <bytes>}
//! ```
//!
//! Payloads are `MessagePack` too: schema frames carry a descriptor list,
//! requests carry `{token, request}`, responses carry `{status, body}` with
//! rows as [`MemoryRecord`]s. The codec also exposes the server-side
//! inverse (decode requests, encode schema and responses) so a fake
//! upstream can speak the same format.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::application::ports::{
    CodecContext, CodecError, Command, Frame, Handshake, MarketStatus, Request, Response,
    ResponseBody, ResponseStatus, WireCodec,
};
use crate::domain::record::{
    MemoryRecord, RecordAllocator, RecordHeader, StructRecord,
};
use crate::domain::schema::{FieldDescriptor, FieldType, MetaDescriptor, SchemaRegistry};
use crate::domain::subscription::SubscriptionId;

// =============================================================================
// Command Ids
// =============================================================================

const COMMAND_IDS: [(Command, u16); 12] = [
    (Command::Keepalive, 0x0001),
    (Command::Schema, 0x0002),
    (Command::Handshake, 0x0501),
    (Command::UniverseRevision, 0x0502),
    (Command::UniverseSeeds, 0x0503),
    (Command::FetchByCode, 0x0510),
    (Command::FetchByTime, 0x0511),
    (Command::FetchByTimeRange, 0x0512),
    (Command::Subscribe, 0x0520),
    (Command::Unsubscribe, 0x0521),
    (Command::PushData, 0x0522),
    (Command::MarketStatus, 0x0523),
];

fn command_id(command: Command) -> u16 {
    COMMAND_IDS
        .iter()
        .find(|(c, _)| *c == command)
        .map_or(0, |(_, id)| *id)
}

fn command_from_id(id: u16) -> Result<Command, CodecError> {
    COMMAND_IDS
        .iter()
        .find(|(_, i)| *i == id)
        .map(|(c, _)| *c)
        .ok_or(CodecError::UnknownCommand(id))
}

const fn field_type_code(field_type: FieldType) -> u8 {
    match field_type {
        FieldType::Int32 => 0,
        FieldType::Double => 1,
        FieldType::String => 2,
        FieldType::Int32Vector => 3,
        FieldType::DoubleVector => 4,
        FieldType::StringVector => 5,
        FieldType::Int64 => 6,
        FieldType::Int64Vector => 7,
    }
}

fn field_type_from_code(code: u8) -> Result<FieldType, CodecError> {
    Ok(match code {
        0 => FieldType::Int32,
        1 => FieldType::Double,
        2 => FieldType::String,
        3 => FieldType::Int32Vector,
        4 => FieldType::DoubleVector,
        5 => FieldType::StringVector,
        6 => FieldType::Int64,
        7 => FieldType::Int64Vector,
        other => return Err(CodecError::Decode(format!("unknown field type {other}"))),
    })
}

fn encode_err(err: rmp_serde::encode::Error) -> CodecError {
    CodecError::Encode(err.to_string())
}

fn decode_err(err: rmp_serde::decode::Error) -> CodecError {
    CodecError::Decode(err.to_string())
}

// =============================================================================
// Wire Shapes
// =============================================================================

#[derive(Serialize, Deserialize)]
struct WireFrame {
    cmd: u16,
    seq: u32,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireField {
    name: String,
    #[serde(rename = "type")]
    field_type: u8,
    precision: u8,
}

#[derive(Serialize, Deserialize)]
struct WireDescriptor {
    namespace: u32,
    meta_id: u32,
    qualified_name: String,
    revision: u32,
    fields: Vec<WireField>,
}

#[derive(Serialize)]
struct WireRequestRef<'a> {
    token: &'a str,
    request: &'a Request,
}

#[derive(Deserialize)]
struct WireRequest {
    token: String,
    request: Request,
}

/// Response body as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Result rows.
    Records(Vec<MemoryRecord>),
    /// Subscription confirmed.
    Subscribed {
        /// Confirmed id.
        subscription_id: SubscriptionId,
    },
    /// Subscription closed.
    Unsubscribed {
        /// Closed id.
        subscription_id: SubscriptionId,
    },
    /// Market status.
    MarketStatus(MarketStatus),
    /// No body.
    Empty,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    status: ResponseStatus,
    body: ResponsePayload,
}

// =============================================================================
// Codec
// =============================================================================

/// `MessagePack` implementation of the codec port.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a schema payload (server side).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on failure.
    pub fn encode_schema(&self, descriptors: &[MetaDescriptor]) -> Result<Vec<u8>, CodecError> {
        let wire: Vec<WireDescriptor> = descriptors
            .iter()
            .map(|d| WireDescriptor {
                namespace: d.namespace,
                meta_id: d.meta_id,
                qualified_name: d.qualified_name.clone(),
                revision: d.revision,
                fields: d
                    .fields
                    .iter()
                    .map(|f| WireField {
                        name: if f.is_placeholder() {
                            String::new()
                        } else {
                            f.name.clone()
                        },
                        field_type: field_type_code(f.field_type),
                        precision: f.precision,
                    })
                    .collect(),
            })
            .collect();
        rmp_serde::to_vec_named(&wire).map_err(encode_err)
    }

    /// Decode a handshake payload (server side).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed payloads.
    pub fn decode_handshake(&self, payload: &[u8]) -> Result<Handshake, CodecError> {
        rmp_serde::from_slice(payload).map_err(decode_err)
    }

    /// Decode a request payload into `(token, request)` (server side).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed payloads.
    pub fn decode_request(&self, payload: &[u8]) -> Result<(String, Request), CodecError> {
        let wire: WireRequest = rmp_serde::from_slice(payload).map_err(decode_err)?;
        Ok((wire.token, wire.request))
    }

    /// Encode a response payload (server side).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on failure.
    pub fn encode_response(
        &self,
        status: ResponseStatus,
        body: ResponsePayload,
    ) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(&WireResponse { status, body }).map_err(encode_err)
    }
}

impl WireCodec for MsgPackCodec {
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let wire = WireFrame {
            cmd: command_id(frame.command),
            seq: frame.sequence_id,
            payload: frame.payload.clone(),
        };
        rmp_serde::to_vec_named(&wire).map_err(encode_err)
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        let wire: WireFrame = rmp_serde::from_slice(bytes).map_err(decode_err)?;
        Ok(Frame::new(command_from_id(wire.cmd)?, wire.seq, wire.payload))
    }

    fn encode_handshake(&self, handshake: &Handshake) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(handshake).map_err(encode_err)
    }

    fn decode_schema(&self, payload: &[u8]) -> Result<Vec<MetaDescriptor>, CodecError> {
        let wire: Vec<WireDescriptor> = rmp_serde::from_slice(payload).map_err(decode_err)?;
        wire.into_iter()
            .map(|d| {
                let fields = d
                    .fields
                    .into_iter()
                    .enumerate()
                    .map(|(position, f)| {
                        Ok(FieldDescriptor::new(f.name, field_type_from_code(f.field_type)?, position)
                            .with_precision(f.precision))
                    })
                    .collect::<Result<Vec<_>, CodecError>>()?;
                Ok(MetaDescriptor::new(
                    d.namespace,
                    d.meta_id,
                    d.qualified_name,
                    d.revision,
                    fields,
                ))
            })
            .collect()
    }

    fn build_context(&self, schema: &SchemaRegistry) -> Result<Box<dyn CodecContext>, CodecError> {
        if schema.is_empty() {
            return Err(CodecError::Decode("schema has no descriptors".to_string()));
        }
        Ok(Box::new(MsgPackContext {
            schema: Arc::new(schema.clone()),
        }))
    }
}

/// Context bound to one schema.
///
/// Decoded rows are resized to their descriptor's field count.
#[derive(Debug, Clone)]
pub struct MsgPackContext {
    schema: Arc<SchemaRegistry>,
}

impl MsgPackContext {
    fn shape(&self, record: MemoryRecord) -> MemoryRecord {
        let header = record.header().clone();
        let Some(descriptor) = self.schema.get(header.namespace, header.meta_id) else {
            return record;
        };
        let mut slots = record.slots().to_vec();
        slots.resize(descriptor.fields.len(), None);
        MemoryRecord::from_slots(header, slots)
    }
}

impl RecordAllocator for MsgPackContext {
    fn allocate(&self, header: RecordHeader, field_count: usize) -> Box<dyn StructRecord> {
        Box::new(MemoryRecord::new(header, field_count))
    }
}

impl CodecContext for MsgPackContext {
    fn encode_request(&self, token: &str, request: &Request) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(&WireRequestRef { token, request }).map_err(encode_err)
    }

    fn decode_response(&self, command: Command, payload: &[u8]) -> Result<Response, CodecError> {
        if !command.needs_context() {
            return Err(CodecError::Unsupported(command));
        }
        let wire: WireResponse = rmp_serde::from_slice(payload).map_err(decode_err)?;
        let body = match wire.body {
            ResponsePayload::Records(records) => ResponseBody::Records(
                records
                    .into_iter()
                    .map(|r| Box::new(self.shape(r)) as Box<dyn StructRecord>)
                    .collect(),
            ),
            ResponsePayload::Subscribed { subscription_id } => {
                ResponseBody::Subscribed { subscription_id }
            }
            ResponsePayload::Unsubscribed { subscription_id } => {
                ResponseBody::Unsubscribed { subscription_id }
            }
            ResponsePayload::MarketStatus(status) => ResponseBody::MarketStatus(status),
            ResponsePayload::Empty => ResponseBody::Empty,
        };
        Ok(Response {
            status: wire.status,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::FetchByCodeRequest;
    use crate::domain::record::FieldValue;

    fn schema() -> Vec<MetaDescriptor> {
        vec![MetaDescriptor::new(
            0,
            12,
            "global::SampleQuote",
            1,
            vec![
                FieldDescriptor::new("close", FieldType::Double, 0),
                FieldDescriptor::new("volume", FieldType::Int64, 1),
                FieldDescriptor::new("", FieldType::Int32, 2),
            ],
        )]
    }

    #[test]
    fn frame_round_trip() {
        let codec = MsgPackCodec::new();
        let frame = Frame::new(Command::FetchByCode, 42, vec![1, 2, 3]);
        let bytes = codec.encode_frame(&frame).unwrap();
        assert_eq!(codec.decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn unknown_command_id_is_rejected() {
        let codec = MsgPackCodec::new();
        let bytes = rmp_serde::to_vec_named(&WireFrame {
            cmd: 0x7777,
            seq: 1,
            payload: Vec::new(),
        })
        .unwrap();
        assert_eq!(
            codec.decode_frame(&bytes),
            Err(CodecError::UnknownCommand(0x7777))
        );
    }

    #[test]
    fn schema_keeps_placeholder_names() {
        let codec = MsgPackCodec::new();
        let payload = codec.encode_schema(&schema()).unwrap();
        let decoded = codec.decode_schema(&payload).unwrap();
        assert_eq!(decoded, schema());
        assert!(decoded[0].fields[2].is_placeholder());
    }

    #[test]
    fn request_carries_token() {
        let codec = MsgPackCodec::new();
        let context = codec
            .build_context(&SchemaRegistry::load(schema()))
            .unwrap();
        let request = Request::FetchByCode(FetchByCodeRequest {
            namespace: 0,
            qualified_name: "SampleQuote".into(),
            revision: u32::MAX,
            market: "DCE".into(),
            code: "i2409".into(),
            from_time_tag: 0,
            to_time_tag: 10,
            granularity: 0,
            fields: vec!["close".into()],
        });
        let payload = context.encode_request("secret", &request).unwrap();
        let (token, decoded) = codec.decode_request(&payload).unwrap();
        assert_eq!(token, "secret");
        assert_eq!(decoded, request);
    }

    #[test]
    fn context_pads_rows_to_descriptor_width() {
        let codec = MsgPackCodec::new();
        let context = codec
            .build_context(&SchemaRegistry::load(schema()))
            .unwrap();
        let header = RecordHeader {
            meta_id: 12,
            ..RecordHeader::default()
        };
        let row = MemoryRecord::from_slots(header, vec![Some(FieldValue::Double(1.5))]);
        let payload = codec
            .encode_response(ResponseStatus::ok(), ResponsePayload::Records(vec![row]))
            .unwrap();

        let records = context
            .decode_response(Command::FetchByCode, &payload)
            .unwrap()
            .into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field_count(), 3);
        assert_eq!(records[0].get_double(0).unwrap(), 1.5);
    }

    #[test]
    fn empty_schema_cannot_back_context() {
        let codec = MsgPackCodec::new();
        assert!(codec.build_context(&SchemaRegistry::default()).is_err());
    }
}

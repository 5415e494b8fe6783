//! Codec Adapters
//!
//! Implementations of the [`WireCodec`](crate::application::ports::WireCodec)
//! port.
//!
//! - **`MessagePack`**: self-describing reference framing used by the
//!   binary and by the fake upstream in tests

pub mod msgpack;

pub use msgpack::{MsgPackCodec, MsgPackContext, ResponsePayload};

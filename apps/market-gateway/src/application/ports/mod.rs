//! Port Interfaces
//!
//! Contracts between the gateway core and the systems around it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `WireCodec` / `CodecContext`: the binary codec that frames and
//!   decodes upstream traffic
//! - `SubscriptionPort`: upstream subscribe/unsubscribe, used by the hub

mod codec;
mod subscription;

pub use codec::{
    CodecContext, CodecError, Command, FetchByCodeRequest, FetchByTimeRangeRequest,
    FetchByTimeRequest, Frame, Handshake, MarketState, MarketStatus, PROTOCOL_VERSION, Request,
    Response, ResponseBody, ResponseStatus, SubscribeRequest, UniverseSeedsRequest, WireCodec,
};
pub use subscription::{PushSink, SubscriptionPort};

#[cfg(test)]
pub use subscription::MockSubscriptionPort;

//! Wire protocol: frame grammar and length-prefixed codec.

mod codec;
mod error;
mod frames;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use error::ProtocolError;
pub use frames::{
    event_kind, parse_client_frame, parse_server_frame, AckStatus, ClientFrame, ErrorCode,
    FrameParseError, RejectReason, ServerFrame,
};

#![forbid(unsafe_code)]

pub mod codec;
pub mod pb;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame};

/// Wire protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN identifier negotiated on the QUIC handshake.
pub const ALPN: &[u8] = b"roomcast-v1";

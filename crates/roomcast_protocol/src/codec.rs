#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size. Report evidence travels inline, so this is generous.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}
	Ok(())
}

/// Encode a protobuf message into a big-endian u32 length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = Vec::with_capacity(PREFIX_LEN + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode a single frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < PREFIX_LEN {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	check_len(len, max_frame_size)?;

	let need = PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Incremental decoder for a byte stream: feed chunks as they arrive, pull complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Bytes buffered but not yet decoded.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Next complete message, or `None` if more bytes are needed.
	///
	/// An oversized length prefix is reported before the payload arrives.
	pub fn next_message<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		if self.buf.len() < PREFIX_LEN {
			return Ok(None);
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		check_len(len, self.max_frame_size)?;

		if self.buf.len() < PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(PREFIX_LEN);
		let payload = self.buf.split_to(len).freeze();
		Ok(Some(M::decode(payload)?))
	}
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pb;

	fn chat(text: &str) -> pb::ClientEnvelope {
		pb::ClientEnvelope {
			version: crate::PROTOCOL_VERSION,
			request_id: "r1".to_string(),
			event: Some(pb::client_envelope::Event::Chat(pb::Chat { text: text.to_string() })),
		}
	}

	#[test]
	fn decode_requires_full_frame() {
		let frame = encode_frame(&chat("hello there"), DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let err = decode_frame::<pb::ClientEnvelope>(&frame[..PREFIX_LEN], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => assert!(need > have),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_too_large() {
		let err = encode_frame(&chat(&"a".repeat(1_000)), 32).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { len, max: 32 } if len > 32));
	}
}

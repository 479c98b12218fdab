#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use roomcast_domain::{Capability, ParseIdError};
use thiserror::Error;
use tracing::error;

/// Errors returned by engine operations.
///
/// Every variant except `Internal` is a domain outcome that maps to a specific user-facing message.
/// `Internal` covers store, cache and relay failures; its details stay in the logs.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("{what} not found")]
	NotFound { what: String },

	#[error("you do not have permission to do this: {capability}")]
	Permission { capability: String },

	#[error("{0}")]
	Validation(String),

	#[error("you are doing that too much, try again in {}s", .retry_after.as_secs().max(1))]
	Flood { retry_after: Duration },

	#[error("report limit reached, try again in {}s", .remaining.as_secs().max(1))]
	Limit { remaining: Duration },

	#[error("you are banned: {}", .reason.as_deref().unwrap_or("no reason given"))]
	Banned { reason: Option<String> },

	#[error("this room is closed until {until}: {reason}")]
	RoomClosed { reason: String, until: DateTime<Utc> },

	#[error("you are silenced in this room")]
	Silenced,

	#[error("server error")]
	Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
	pub fn not_found(what: impl Into<String>) -> Self {
		Self::NotFound { what: what.into() }
	}

	pub fn permission(capability: Capability) -> Self {
		Self::Permission {
			capability: capability.as_str().to_string(),
		}
	}

	/// Permission failure for an action that is not a room capability (staff-only actions, ownership).
	pub fn forbidden(action: impl Into<String>) -> Self {
		Self::Permission { capability: action.into() }
	}

	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	/// Stable wire code.
	pub fn code(&self) -> &'static str {
		match self {
			EngineError::NotFound { .. } => "NOT_FOUND",
			EngineError::Permission { .. } => "PERMISSION_DENIED",
			EngineError::Validation(_) => "VALIDATION",
			EngineError::Flood { .. } => "FLOOD",
			EngineError::Limit { .. } => "LIMIT",
			EngineError::Banned { .. } => "BANNED",
			EngineError::RoomClosed { .. } => "ROOM_CLOSED",
			EngineError::Silenced => "SILENCED",
			EngineError::Internal(_) => "INTERNAL",
		}
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			EngineError::Flood { retry_after } => Some(*retry_after),
			EngineError::Limit { remaining } => Some(*remaining),
			_ => None,
		}
	}
}

impl From<ParseIdError> for EngineError {
	fn from(e: ParseIdError) -> Self {
		EngineError::Validation(e.to_string())
	}
}

/// Log an infrastructure failure at error level and turn it into `EngineError::Internal`.
pub trait OrInternal<T> {
	fn or_internal(self, what: &'static str) -> EngineResult<T>;
}

impl<T> OrInternal<T> for anyhow::Result<T> {
	fn or_internal(self, what: &'static str) -> EngineResult<T> {
		self.map_err(|e| {
			error!(error = ?e, what, "backing store failure");
			metrics::counter!("roomcast_server_store_errors_total", "op" => what).increment(1);
			EngineError::Internal(e.context(what))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn permission_message_names_the_capability() {
		let err = EngineError::permission(Capability::Kick);
		assert_eq!(err.to_string(), "you do not have permission to do this: kick");
		assert_eq!(err.code(), "PERMISSION_DENIED");
	}

	#[test]
	fn internal_hides_details() {
		let err: EngineResult<()> = Err::<(), _>(anyhow::anyhow!("connection refused")).or_internal("load room");
		let err = err.unwrap_err();
		assert_eq!(err.to_string(), "server error");
		assert_eq!(err.code(), "INTERNAL");
	}

	#[test]
	fn limits_carry_retry_after() {
		let err = EngineError::Flood {
			retry_after: Duration::from_secs(60),
		};
		assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
		assert!(err.to_string().contains("60s"));
		assert_eq!(EngineError::Silenced.retry_after(), None);
	}
}

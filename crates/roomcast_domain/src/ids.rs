use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a room name.
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: {len} > {max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Unique room name.
///
/// Names are trimmed and limited to ASCII alphanumerics plus `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let name = name.trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.len() > MAX_ROOM_NAME_LEN {
			return Err(ParseIdError::TooLong {
				len: name.len(),
				max: MAX_ROOM_NAME_LEN,
			});
		}
		if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
			return Err(ParseIdError::InvalidFormat(format!("room name {name:?}")));
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s)
	}
}

impl TryFrom<String> for RoomName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoomName::new(value)
	}
}

impl From<RoomName> for String {
	fn from(value: RoomName) -> Self {
		value.0
	}
}

/// Transport-level connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Fresh random connection id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConnectionId::new(s)
	}
}

/// Durable account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s)
	}
}

/// Who is acting: a durable user, or an anonymous `(ip, session)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: Option<UserId>,
	pub ip: String,
	pub session_id: String,
}

impl Identity {
	pub fn user(user_id: UserId, ip: impl Into<String>, session_id: impl Into<String>) -> Self {
		Self {
			user_id: Some(user_id),
			ip: ip.into(),
			session_id: session_id.into(),
		}
	}

	pub fn anonymous(ip: impl Into<String>, session_id: impl Into<String>) -> Self {
		Self {
			user_id: None,
			ip: ip.into(),
			session_id: session_id.into(),
		}
	}

	pub fn is_anonymous(&self) -> bool {
		self.user_id.is_none()
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.user_id {
			Some(user) => write!(f, "user:{user}"),
			None => write!(f, "anon:{}/{}", self.ip, self.session_id),
		}
	}
}

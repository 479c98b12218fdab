use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::Permissions;
use crate::ids::{Identity, ParseIdError, RoomName, UserId};

/// Maximum role tag length.
pub const MAX_TAG_LEN: usize = 32;

/// Role tag: `^[a-z0-9][a-z0-9-]{0,31}$`, unique per room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleTag(String);

impl RoleTag {
	pub const MODS: &'static str = "mods";
	pub const EVERYBODY: &'static str = "everybody";

	pub fn new(tag: impl Into<String>) -> Result<Self, ParseIdError> {
		let tag = tag.into();
		if tag.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if tag.len() > MAX_TAG_LEN {
			return Err(ParseIdError::TooLong {
				len: tag.len(),
				max: MAX_TAG_LEN,
			});
		}
		let mut chars = tag.chars();
		let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
		let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
		if !first_ok || !rest_ok {
			return Err(ParseIdError::InvalidFormat(format!("role tag {tag:?}")));
		}
		Ok(Self(tag))
	}

	/// Derive a tag from a display name.
	///
	/// Lowercases, collapses runs of other characters into a single `-`, and trims dashes.
	pub fn from_name(name: &str) -> Result<Self, ParseIdError> {
		let mut out = String::with_capacity(name.len());
		let mut pending_dash = false;
		for c in name.chars() {
			if c.is_ascii_alphanumeric() {
				if pending_dash && !out.is_empty() {
					out.push('-');
				}
				pending_dash = false;
				out.push(c.to_ascii_lowercase());
			} else {
				pending_dash = true;
			}
		}
		out.truncate(MAX_TAG_LEN);
		while out.ends_with('-') {
			out.pop();
		}
		Self::new(out)
	}

	/// Append `-n`, keeping the result within the length limit.
	pub fn with_suffix(&self, n: u32) -> Result<Self, ParseIdError> {
		let suffix = format!("-{n}");
		let mut base = self.0.clone();
		base.truncate(MAX_TAG_LEN.saturating_sub(suffix.len()));
		while base.ends_with('-') {
			base.pop();
		}
		Self::new(format!("{base}{suffix}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoleTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for RoleTag {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoleTag::new(value)
	}
}

impl From<RoleTag> for String {
	fn from(value: RoleTag) -> Self {
		value.0
	}
}

/// Room-scoped permission bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
	pub id: Uuid,
	pub room: RoomName,
	pub name: String,
	pub tag: RoleTag,
	pub order: i32,
	pub permissions: Permissions,
	/// Applies to every participant without an enrollment.
	#[serde(default)]
	pub is_default: bool,
	/// Seeded with the room; cannot be deleted.
	#[serde(default)]
	pub built_in: bool,
	pub created_at: DateTime<Utc>,
}

impl Role {
	pub fn new(room: RoomName, name: impl Into<String>, tag: RoleTag, order: i32, permissions: Permissions) -> Self {
		Self {
			id: Uuid::new_v4(),
			room,
			name: name.into(),
			tag,
			order,
			permissions,
			is_default: false,
			built_in: false,
			created_at: Utc::now(),
		}
	}
}

/// Who an enrollment targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrollmentSubject {
	User { user_id: UserId },
	Anonymous { ip: String, session_id: String },
}

impl EnrollmentSubject {
	pub fn for_identity(identity: &Identity) -> Self {
		match &identity.user_id {
			Some(user_id) => Self::User {
				user_id: user_id.clone(),
			},
			None => Self::Anonymous {
				ip: identity.ip.clone(),
				session_id: identity.session_id.clone(),
			},
		}
	}
}

/// Links a role to an identity within one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
	pub id: Uuid,
	pub room: RoomName,
	pub role_id: Uuid,
	pub subject: EnrollmentSubject,
	pub enrolled_by: Option<String>,
	pub enrolled_at: DateTime<Utc>,
}

/// Enrollment query predicate. Always carries at least one identity predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentFilter {
	pub room: RoomName,
	subject: EnrollmentSubject,
}

impl EnrollmentFilter {
	/// Build a filter for an identity; rejects identities with no usable predicate.
	pub fn for_identity(room: RoomName, identity: &Identity) -> Result<Self, ParseIdError> {
		if identity.user_id.is_none() && (identity.ip.trim().is_empty() || identity.session_id.trim().is_empty()) {
			return Err(ParseIdError::InvalidFormat(
				"anonymous identity needs both ip and session id".to_string(),
			));
		}
		Ok(Self {
			room,
			subject: EnrollmentSubject::for_identity(identity),
		})
	}

	pub fn subject(&self) -> &EnrollmentSubject {
		&self.subject
	}

	pub fn matches(&self, enrollment: &Enrollment) -> bool {
		enrollment.room == self.room && enrollment.subject == self.subject
	}
}

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ParseIdError, RoomName, UserId};
use crate::room::Participant;

/// Site-ban restriction flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrictions {
	pub broadcast: bool,
	pub join: bool,
}

impl Restrictions {
	pub fn union(self, other: Restrictions) -> Restrictions {
		Restrictions {
			broadcast: self.broadcast || other.broadcast,
			join: self.join || other.join,
		}
	}

	pub fn is_empty(&self) -> bool {
		!self.broadcast && !self.join
	}
}

/// Identity fields a site ban can be keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanLookup {
	pub ip: Option<String>,
	pub session_id: Option<String>,
	pub user_id: Option<UserId>,
	pub username: Option<String>,
	pub email: Option<String>,
	pub fingerprint: Option<String>,
}

impl BanLookup {
	pub fn is_empty(&self) -> bool {
		fn blank(v: &Option<String>) -> bool {
			v.as_deref().is_none_or(|s| s.trim().is_empty())
		}
		blank(&self.ip)
			&& blank(&self.session_id)
			&& self.user_id.is_none()
			&& blank(&self.username)
			&& blank(&self.email)
			&& blank(&self.fingerprint)
	}

	pub fn for_participant(p: &Participant) -> Self {
		Self {
			ip: Some(p.ip.clone()),
			session_id: Some(p.session_id.clone()),
			user_id: p.user_id.clone(),
			..Self::default()
		}
	}
}

/// Site-wide ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteBan {
	pub id: Uuid,
	#[serde(flatten)]
	pub keys: BanLookup,
	pub restrictions: Restrictions,
	pub reason: Option<String>,
	pub created_by: Option<String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl SiteBan {
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.expires_at > now
	}

	/// True when any non-empty identity field of `lookup` equals the same field of this ban.
	pub fn matches(&self, lookup: &BanLookup) -> bool {
		fn eq(a: &Option<String>, b: &Option<String>) -> bool {
			matches!((a, b), (Some(a), Some(b)) if !a.trim().is_empty() && a == b)
		}
		eq(&self.keys.ip, &lookup.ip)
			|| eq(&self.keys.session_id, &lookup.session_id)
			|| matches!((&self.keys.user_id, &lookup.user_id), (Some(a), Some(b)) if a == b)
			|| eq(&self.keys.username, &lookup.username)
			|| eq(&self.keys.email, &lookup.email)
			|| eq(&self.keys.fingerprint, &lookup.fingerprint)
	}

	/// Fill identity fields this ban does not carry yet.
	pub fn absorb_keys(&mut self, lookup: &BanLookup) {
		fn fill<T: Clone>(slot: &mut Option<T>, v: &Option<T>) {
			if slot.is_none() {
				slot.clone_from(v);
			}
		}
		fill(&mut self.keys.ip, &lookup.ip);
		fill(&mut self.keys.session_id, &lookup.session_id);
		fill(&mut self.keys.user_id, &lookup.user_id);
		fill(&mut self.keys.username, &lookup.username);
		fill(&mut self.keys.email, &lookup.email);
		fill(&mut self.keys.fingerprint, &lookup.fingerprint);
	}
}

/// Identity snapshot stored on closures and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
	pub handle: String,
	pub ip: String,
	pub session_id: String,
	pub user_id: Option<UserId>,
}

impl From<&Participant> for IdentitySnapshot {
	fn from(p: &Participant) -> Self {
		Self {
			handle: p.handle.clone(),
			ip: p.ip.clone(),
			session_id: p.session_id.clone(),
			user_id: p.user_id.clone(),
		}
	}
}

/// Temporary room closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClosure {
	pub id: Uuid,
	pub room: RoomName,
	pub reason: String,
	pub duration_hours: u32,
	pub affected: Vec<IdentitySnapshot>,
	pub closed_by: Option<String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl RoomClosure {
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.expires_at > now
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
	pub handle: String,
	pub text: String,
	pub at: DateTime<Utc>,
}

/// How a report was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
	Dismissed,
	Warned,
	Kicked,
	Banned,
	RoomClosed,
}

impl ReportOutcome {
	pub const fn as_str(self) -> &'static str {
		match self {
			ReportOutcome::Dismissed => "dismissed",
			ReportOutcome::Warned => "warned",
			ReportOutcome::Kicked => "kicked",
			ReportOutcome::Banned => "banned",
			ReportOutcome::RoomClosed => "room_closed",
		}
	}
}

impl fmt::Display for ReportOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ReportOutcome {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"dismissed" => Ok(Self::Dismissed),
			"warned" => Ok(Self::Warned),
			"kicked" => Ok(Self::Kicked),
			"banned" => Ok(Self::Banned),
			"room_closed" => Ok(Self::RoomClosed),
			other => Err(ParseIdError::InvalidFormat(format!("unknown outcome {other:?}"))),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
	pub outcome: ReportOutcome,
	pub resolved_by: String,
	pub resolved_at: DateTime<Utc>,
}

/// Abuse report filed by a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
	pub id: Uuid,
	pub room: RoomName,
	pub reporter: IdentitySnapshot,
	pub target: IdentitySnapshot,
	pub reason: String,
	#[serde(default)]
	pub chat_context: Vec<ChatLine>,
	pub evidence: Option<String>,
	pub created_at: DateTime<Utc>,
	pub resolution: Option<Resolution>,
}

/// Moderation audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationActivity {
	pub id: Uuid,
	pub at: DateTime<Utc>,
	pub actor: String,
	pub action: String,
	pub room: Option<RoomName>,
	pub target: Option<String>,
	pub detail: Option<String>,
}

impl ModerationActivity {
	pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
		Self {
			id: Uuid::new_v4(),
			at: Utc::now(),
			actor: actor.into(),
			action: action.into(),
			room: None,
			target: None,
			detail: None,
		}
	}

	pub fn in_room(mut self, room: &RoomName) -> Self {
		self.room = Some(room.clone());
		self
	}

	pub fn target(mut self, target: impl Into<String>) -> Self {
		self.target = Some(target.into());
		self
	}

	pub fn detail(mut self, detail: impl Into<String>) -> Self {
		self.detail = Some(detail.into());
		self
	}
}

/// Site staff member eligible for report notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
	pub user_id: UserId,
	pub username: String,
	pub email: Option<String>,
	#[serde(default)]
	pub notify_reports: bool,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ConnectionId, Identity, RoomName, UserId};

/// Authoritative room document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
	pub name: RoomName,
	pub owner: Option<UserId>,
	#[serde(default)]
	pub settings: RoomSettings,
	#[serde(default)]
	pub bans: Vec<BanEntry>,
	#[serde(default)]
	pub participants: Vec<Participant>,
	pub relay: Option<RelayAttachment>,
	/// Write counter used for compare-and-swap replaces.
	#[serde(default)]
	pub version: u64,
	pub created_at: DateTime<Utc>,
}

impl Room {
	pub fn new(name: RoomName) -> Self {
		Self {
			name,
			owner: None,
			settings: RoomSettings::default(),
			bans: Vec::new(),
			participants: Vec::new(),
			relay: None,
			version: 0,
			created_at: Utc::now(),
		}
	}

	pub fn participant(&self, conn: &ConnectionId) -> Option<&Participant> {
		self.participants.iter().find(|p| &p.connection_id == conn)
	}

	pub fn participant_mut(&mut self, conn: &ConnectionId) -> Option<&mut Participant> {
		self.participants.iter_mut().find(|p| &p.connection_id == conn)
	}

	/// Remove a participant by connection id, returning it.
	pub fn remove_participant(&mut self, conn: &ConnectionId) -> Option<Participant> {
		let idx = self.participants.iter().position(|p| &p.connection_id == conn)?;
		Some(self.participants.remove(idx))
	}

	pub fn is_owner(&self, user: Option<&UserId>) -> bool {
		match (&self.owner, user) {
			(Some(owner), Some(user)) => owner == user,
			_ => false,
		}
	}

	/// Whether a room with no participants should be deleted.
	pub fn is_disposable(&self) -> bool {
		self.participants.is_empty() && self.owner.is_none()
	}

	pub fn handle_taken(&self, handle: &str, except: Option<&ConnectionId>) -> bool {
		self.participants
			.iter()
			.any(|p| Some(&p.connection_id) != except && p.handle.eq_ignore_ascii_case(handle))
	}

	/// Room-level ban entry matching the identity, if any.
	pub fn ban_for(&self, identity: &Identity) -> Option<&BanEntry> {
		self.bans.iter().find(|b| b.matches(identity))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSettings {
	pub topic: Option<Topic>,
	/// Hex sha256 digest of the room password.
	pub password_hash: Option<String>,
	#[serde(default)]
	pub moderators: Vec<UserId>,
	#[serde(default)]
	pub age_restricted: bool,
	pub display_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
	pub text: String,
	pub updated_at: DateTime<Utc>,
	pub updated_by: Option<String>,
}

/// Room-scoped ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
	pub id: Uuid,
	pub handle: String,
	pub ip: Option<String>,
	pub session_id: Option<String>,
	pub user_id: Option<UserId>,
	pub banned_by: Option<String>,
	pub timestamp: DateTime<Utc>,
}

impl BanEntry {
	pub fn for_participant(target: &Participant, banned_by: Option<String>) -> Self {
		Self {
			id: Uuid::new_v4(),
			handle: target.handle.clone(),
			ip: Some(target.ip.clone()),
			session_id: Some(target.session_id.clone()),
			user_id: target.user_id.clone(),
			banned_by,
			timestamp: Utc::now(),
		}
	}

	pub fn matches(&self, identity: &Identity) -> bool {
		if let (Some(a), Some(b)) = (&self.user_id, &identity.user_id)
			&& a == b
		{
			return true;
		}
		if let Some(ip) = &self.ip
			&& !ip.is_empty()
			&& ip == &identity.ip
		{
			return true;
		}
		matches!(&self.session_id, Some(s) if !s.is_empty() && s == &identity.session_id)
	}
}

/// One connected occupant of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
	pub connection_id: ConnectionId,
	pub session_id: String,
	pub ip: String,
	pub user_id: Option<UserId>,
	pub handle: String,
	pub color: String,
	#[serde(default)]
	pub broadcasting: bool,
	#[serde(default)]
	pub silenced: bool,
	#[serde(default)]
	pub roles: Vec<String>,
	#[serde(default)]
	pub is_admin: bool,
	#[serde(default)]
	pub is_site_mod: bool,
	pub joined_at: DateTime<Utc>,
}

impl Participant {
	pub fn identity(&self) -> Identity {
		Identity {
			user_id: self.user_id.clone(),
			ip: self.ip.clone(),
			session_id: self.session_id.clone(),
		}
	}

	/// Admins and site moderators.
	pub fn is_staff(&self) -> bool {
		self.is_admin || self.is_site_mod
	}
}

/// Media relay the room is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAttachment {
	pub node_id: String,
	pub relay_room_id: String,
}

/// Shared media queued in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
	pub id: Uuid,
	pub room: RoomName,
	pub url: String,
	pub title: Option<String>,
	pub added_by: String,
	pub added_at: DateTime<Utc>,
}

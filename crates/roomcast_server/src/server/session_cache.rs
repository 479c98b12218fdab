#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use roomcast_domain::{ConnectionId, Identity, RoomName, UserId};
use serde::{Deserialize, Serialize};

use crate::server::store::KvStore;

const F_ROOM: &str = "room";
const F_HANDLE: &str = "handle";
const F_COLOR: &str = "color";
const F_USER_ID: &str = "user_id";
const F_LIST_ID: &str = "list_id";
const F_SESSION_ID: &str = "session_id";
const F_IP: &str = "ip";
const F_RELAY_SESSION: &str = "relay_session_id";
const F_PUSH: &str = "push_subscription";
const F_DISCONNECTED: &str = "disconnected";
const F_KICKED: &str = "kicked";

/// Web-push subscription a client registered on this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
	pub endpoint: String,
	pub p256dh: String,
	pub auth: String,
}

/// Cached view of one connection: which room it is in and who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
	pub room: Option<RoomName>,
	pub handle: String,
	pub color: String,
	pub user_id: Option<UserId>,
	pub list_id: Option<String>,
	pub session_id: String,
	pub ip: String,
	pub relay_session_id: Option<String>,
	pub push_subscription: Option<PushSubscription>,
	pub disconnected: bool,
	/// Set when a moderator forced this connection out.
	pub kicked: bool,
}

impl SessionRecord {
	pub fn new(identity: &Identity, handle: impl Into<String>, color: impl Into<String>) -> Self {
		Self {
			room: None,
			handle: handle.into(),
			color: color.into(),
			user_id: identity.user_id.clone(),
			list_id: None,
			session_id: identity.session_id.clone(),
			ip: identity.ip.clone(),
			relay_session_id: None,
			push_subscription: None,
			disconnected: false,
			kicked: false,
		}
	}

	pub fn identity(&self) -> Identity {
		Identity {
			user_id: self.user_id.clone(),
			ip: self.ip.clone(),
			session_id: self.session_id.clone(),
		}
	}

	fn to_fields(&self) -> anyhow::Result<HashMap<String, String>> {
		let mut fields = HashMap::new();
		fields.insert(F_HANDLE.to_string(), self.handle.clone());
		fields.insert(F_COLOR.to_string(), self.color.clone());
		fields.insert(F_SESSION_ID.to_string(), self.session_id.clone());
		fields.insert(F_IP.to_string(), self.ip.clone());
		fields.insert(F_DISCONNECTED.to_string(), encode_bool(self.disconnected));
		fields.insert(F_KICKED.to_string(), encode_bool(self.kicked));
		if let Some(room) = &self.room {
			fields.insert(F_ROOM.to_string(), room.as_str().to_string());
		}
		if let Some(user_id) = &self.user_id {
			fields.insert(F_USER_ID.to_string(), user_id.as_str().to_string());
		}
		if let Some(list_id) = &self.list_id {
			fields.insert(F_LIST_ID.to_string(), list_id.clone());
		}
		if let Some(relay) = &self.relay_session_id {
			fields.insert(F_RELAY_SESSION.to_string(), relay.clone());
		}
		if let Some(push) = &self.push_subscription {
			fields.insert(
				F_PUSH.to_string(),
				serde_json::to_string(push).context("encode push subscription")?,
			);
		}
		Ok(fields)
	}

	fn from_fields(mut fields: HashMap<String, String>) -> anyhow::Result<Self> {
		let mut take = |name: &str| fields.remove(name).filter(|v| !v.is_empty());

		let room = take(F_ROOM).map(RoomName::new).transpose().context("session room")?;
		let user_id = take(F_USER_ID).map(UserId::new).transpose().context("session user id")?;
		let push_subscription: Option<PushSubscription> = take(F_PUSH)
			.map(|raw| serde_json::from_str(&raw))
			.transpose()
			.context("session push subscription")?;

		Ok(Self {
			room,
			handle: take(F_HANDLE).unwrap_or_default(),
			color: take(F_COLOR).unwrap_or_default(),
			user_id,
			list_id: take(F_LIST_ID),
			session_id: take(F_SESSION_ID).unwrap_or_default(),
			ip: take(F_IP).unwrap_or_default(),
			relay_session_id: take(F_RELAY_SESSION),
			push_subscription,
			disconnected: decode_bool(take(F_DISCONNECTED).as_deref())?,
			kicked: decode_bool(take(F_KICKED).as_deref())?,
		})
	}
}

fn encode_bool(v: bool) -> String {
	let flag = if v { "1" } else { "0" };
	flag.to_string()
}

fn decode_bool(raw: Option<&str>) -> anyhow::Result<bool> {
	match raw {
		None | Some("0") | Some("false") => Ok(false),
		Some("1") | Some("true") => Ok(true),
		Some(other) => Err(anyhow!("invalid session flag: {other:?}")),
	}
}

/// Result of a cache read. A missing record is never reported as a default record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
	Found(SessionRecord),
	NoSession,
}

/// Partial update applied with [`SessionCache::merge`]. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
	room: Option<Option<RoomName>>,
	handle: Option<String>,
	color: Option<String>,
	relay_session_id: Option<Option<String>>,
	push_subscription: Option<PushSubscription>,
	disconnected: Option<bool>,
	kicked: Option<bool>,
}

impl SessionPatch {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn room(mut self, room: Option<RoomName>) -> Self {
		self.room = Some(room);
		self
	}

	pub fn handle(mut self, handle: impl Into<String>) -> Self {
		self.handle = Some(handle.into());
		self
	}

	pub fn color(mut self, color: impl Into<String>) -> Self {
		self.color = Some(color.into());
		self
	}

	pub fn relay_session(mut self, id: Option<String>) -> Self {
		self.relay_session_id = Some(id);
		self
	}

	pub fn push_subscription(mut self, sub: PushSubscription) -> Self {
		self.push_subscription = Some(sub);
		self
	}

	pub fn disconnected(mut self, v: bool) -> Self {
		self.disconnected = Some(v);
		self
	}

	pub fn kicked(mut self, v: bool) -> Self {
		self.kicked = Some(v);
		self
	}

	fn into_fields(self) -> anyhow::Result<HashMap<String, String>> {
		let mut fields = HashMap::new();
		if let Some(room) = self.room {
			fields.insert(F_ROOM.to_string(), room.map(|r| r.as_str().to_string()).unwrap_or_default());
		}
		if let Some(handle) = self.handle {
			fields.insert(F_HANDLE.to_string(), handle);
		}
		if let Some(color) = self.color {
			fields.insert(F_COLOR.to_string(), color);
		}
		if let Some(relay) = self.relay_session_id {
			fields.insert(F_RELAY_SESSION.to_string(), relay.unwrap_or_default());
		}
		if let Some(push) = self.push_subscription {
			fields.insert(
				F_PUSH.to_string(),
				serde_json::to_string(&push).context("encode push subscription")?,
			);
		}
		if let Some(v) = self.disconnected {
			fields.insert(F_DISCONNECTED.to_string(), encode_bool(v));
		}
		if let Some(v) = self.kicked {
			fields.insert(F_KICKED.to_string(), encode_bool(v));
		}
		Ok(fields)
	}
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// TTL while the connection is live; refreshed by every room action.
	pub connected_ttl: Duration,

	/// Grace period after a disconnect during which the session can be resumed.
	pub disconnected_ttl: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			connected_ttl: Duration::from_secs(120),
			disconnected_ttl: Duration::from_secs(6 * 60 * 60),
		}
	}
}

/// Per-connection session records on top of a shared `KvStore`.
#[derive(Clone)]
pub struct SessionCache {
	kv: Arc<dyn KvStore>,
	settings: SessionSettings,
}

impl SessionCache {
	pub fn new(kv: Arc<dyn KvStore>, settings: SessionSettings) -> Self {
		Self { kv, settings }
	}

	pub fn settings(&self) -> &SessionSettings {
		&self.settings
	}

	fn key(conn: &ConnectionId) -> String {
		format!("session:{conn}")
	}

	fn ttl_for(&self, disconnected: bool) -> Duration {
		if disconnected {
			self.settings.disconnected_ttl
		} else {
			self.settings.connected_ttl
		}
	}

	pub async fn put(&self, conn: &ConnectionId, record: &SessionRecord) -> anyhow::Result<()> {
		self.kv
			.hput(&Self::key(conn), record.to_fields()?, self.ttl_for(record.disconnected))
			.await
	}

	pub async fn get(&self, conn: &ConnectionId) -> anyhow::Result<SessionLookup> {
		match self.kv.hgetall(&Self::key(conn)).await? {
			Some(fields) => Ok(SessionLookup::Found(
				SessionRecord::from_fields(fields).with_context(|| format!("decode session {conn}"))?,
			)),
			None => Ok(SessionLookup::NoSession),
		}
	}

	/// Merge fields into an existing record and refresh its TTL. Returns `false` if there is no session.
	pub async fn merge(&self, conn: &ConnectionId, patch: SessionPatch) -> anyhow::Result<bool> {
		let ttl = self.ttl_for(patch.disconnected.unwrap_or(false));
		let key = Self::key(conn);
		if !self.kv.hmerge(&key, patch.into_fields()?).await? {
			return Ok(false);
		}
		self.kv.expire(&key, ttl).await
	}

	pub async fn expire(&self, conn: &ConnectionId, ttl: Duration) -> anyhow::Result<bool> {
		self.kv.expire(&Self::key(conn), ttl).await
	}

	/// Extend a live session by the connected TTL.
	pub async fn touch(&self, conn: &ConnectionId) -> anyhow::Result<bool> {
		self.expire(conn, self.settings.connected_ttl).await
	}

	/// Detach the session from its room and start the reconnect grace period.
	pub async fn mark_disconnected(&self, conn: &ConnectionId) -> anyhow::Result<bool> {
		self.merge(
			conn,
			SessionPatch::new().room(None).disconnected(true).relay_session(None),
		)
		.await
	}

	pub async fn mark_kicked(&self, conn: &ConnectionId) -> anyhow::Result<bool> {
		self.merge(conn, SessionPatch::new().kicked(true)).await
	}

	pub async fn remove(&self, conn: &ConnectionId) -> anyhow::Result<bool> {
		self.kv.del(&Self::key(conn)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::MemoryKv;

	fn cache() -> SessionCache {
		SessionCache::new(Arc::new(MemoryKv::new()), SessionSettings::default())
	}

	async fn found(cache: &SessionCache, conn: &ConnectionId) -> SessionRecord {
		match cache.get(conn).await.unwrap() {
			SessionLookup::Found(r) => r,
			SessionLookup::NoSession => panic!("no session for {conn}"),
		}
	}

	fn record() -> SessionRecord {
		let identity = Identity::user(UserId::new("u1").unwrap(), "10.0.0.1", "sess-1");
		let mut r = SessionRecord::new(&identity, "alice", "#ff0000");
		r.room = Some(RoomName::new("foo").unwrap());
		r
	}

	#[tokio::test]
	async fn absent_session_is_distinct_from_defaults() {
		let cache = cache();
		let conn = ConnectionId::new("c1").unwrap();
		assert_eq!(cache.get(&conn).await.unwrap(), SessionLookup::NoSession);
		assert!(!cache.merge(&conn, SessionPatch::new().handle("x")).await.unwrap());
		assert_eq!(cache.get(&conn).await.unwrap(), SessionLookup::NoSession);
	}

	#[tokio::test]
	async fn typed_fields_survive_the_cache() {
		let cache = cache();
		let conn = ConnectionId::new("c1").unwrap();
		let mut r = record();
		r.push_subscription = Some(PushSubscription {
			endpoint: "https://push.example/abc".into(),
			p256dh: "key".into(),
			auth: "secret".into(),
		});
		cache.put(&conn, &r).await.unwrap();

		assert_eq!(cache.get(&conn).await.unwrap(), SessionLookup::Found(r));
	}

	#[tokio::test]
	async fn merge_can_clear_optional_fields() {
		let cache = cache();
		let conn = ConnectionId::new("c1").unwrap();
		cache.put(&conn, &record()).await.unwrap();

		cache
			.merge(&conn, SessionPatch::new().room(None).relay_session(Some("rs-1".into())))
			.await
			.unwrap();
		let r = found(&cache, &conn).await;
		assert_eq!(r.room, None);
		assert_eq!(r.relay_session_id.as_deref(), Some("rs-1"));
		assert_eq!(r.handle, "alice");
	}

	#[tokio::test(start_paused = true)]
	async fn disconnected_sessions_outlive_connected_ttl() {
		let cache = cache();
		let live = ConnectionId::new("live").unwrap();
		let gone = ConnectionId::new("gone").unwrap();
		cache.put(&live, &record()).await.unwrap();
		cache.put(&gone, &record()).await.unwrap();
		assert!(cache.mark_disconnected(&gone).await.unwrap());

		tokio::time::advance(Duration::from_secs(121)).await;
		assert_eq!(cache.get(&live).await.unwrap(), SessionLookup::NoSession);
		let r = found(&cache, &gone).await;
		assert!(r.disconnected);
		assert_eq!(r.room, None);
		assert_eq!(r.handle, "alice");

		tokio::time::advance(Duration::from_secs(6 * 60 * 60)).await;
		assert_eq!(cache.get(&gone).await.unwrap(), SessionLookup::NoSession);
	}

	#[tokio::test(start_paused = true)]
	async fn touch_extends_live_sessions() {
		let cache = cache();
		let conn = ConnectionId::new("c1").unwrap();
		cache.put(&conn, &record()).await.unwrap();

		tokio::time::advance(Duration::from_secs(100)).await;
		assert!(cache.touch(&conn).await.unwrap());
		tokio::time::advance(Duration::from_secs(100)).await;
		assert!(matches!(cache.get(&conn).await.unwrap(), SessionLookup::Found(_)));
	}

	#[test]
	fn malformed_flags_are_rejected() {
		let mut fields = record().to_fields().unwrap();
		fields.insert(F_DISCONNECTED.to_string(), "maybe".to_string());
		assert!(SessionRecord::from_fields(fields).is_err());
	}
}

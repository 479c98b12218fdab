#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use roomcast_domain::{
	BanLookup, Capability, ConnectionId, Identity, ModerationActivity, Participant, Permissions, PlaylistItem,
	Restrictions, Room, RoomName, Topic, UserId,
};
use roomcast_protocol::pb;
use roomcast_protocol::pb::server_envelope::Event;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::flood::FloodGovernor;
use crate::server::hub::BroadcastPort;
use crate::server::permissions::PermissionResolver;
use crate::server::relay::RelaySelector;
use crate::server::rooms::RoomDirectory;
use crate::server::session_cache::{PushSubscription, SessionCache, SessionLookup, SessionPatch, SessionRecord};

pub const MAX_HANDLE_LEN: usize = 32;
pub const MAX_TOPIC_LEN: usize = 256;
pub const MAX_CHAT_LEN: usize = 2000;
const MAX_COLOR_LEN: usize = 32;
const MAX_MEDIA_URL_LEN: usize = 2048;

/// Everything needed to place a connection in a room.
#[derive(Debug, Clone)]
pub struct JoinRequest {
	pub room: RoomName,
	pub conn: ConnectionId,
	pub identity: Identity,
	pub handle: String,
	pub color: String,
	pub password: Option<String>,
	/// Opaque client list id kept on the session.
	pub list_id: Option<String>,
	pub is_admin: bool,
	pub is_site_mod: bool,
	/// Previous connection of the same session, if the client is reconnecting.
	pub resume_from: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
	pub room: Room,
	pub participant: Participant,
	pub permissions: Permissions,
	pub resumed: bool,
}

/// A connection acting in the room its session points at.
#[derive(Debug, Clone)]
pub struct Actor {
	pub conn: ConnectionId,
	pub room: RoomName,
	pub identity: Identity,
	pub session: SessionRecord,
}

impl Actor {
	/// Label stored on activity records and enrollments.
	pub fn label(&self) -> String {
		format!("{} ({})", self.session.handle, self.identity)
	}
}

pub fn wire_participant(p: &Participant) -> pb::Participant {
	pb::Participant {
		connection_id: p.connection_id.to_string(),
		handle: p.handle.clone(),
		color: p.color.clone(),
		broadcasting: p.broadcasting,
		silenced: p.silenced,
		roles: p.roles.clone(),
		is_admin: p.is_admin,
		is_site_mod: p.is_site_mod,
		has_account: p.user_id.is_some(),
	}
}

pub(crate) fn participant_updated(p: &Participant) -> Event {
	Event::ParticipantUpdated(pb::ParticipantUpdated {
		participant: Some(wire_participant(p)),
	})
}

/// Hex sha256 of a room password.
pub fn hash_password(password: &str) -> String {
	hex::encode(Sha256::digest(password.as_bytes()))
}

fn validate_handle(handle: &str) -> EngineResult<String> {
	let handle = handle.trim();
	let len = handle.chars().count();
	if len == 0 || len > MAX_HANDLE_LEN || handle.chars().any(char::is_control) {
		return Err(EngineError::validation(format!(
			"handle must be 1-{MAX_HANDLE_LEN} printable characters"
		)));
	}
	Ok(handle.to_string())
}

fn validate_color(color: &str) -> EngineResult<String> {
	let color = color.trim();
	if color.len() > MAX_COLOR_LEN || color.chars().any(char::is_control) {
		return Err(EngineError::validation("invalid color"));
	}
	Ok(color.to_string())
}

fn missing_participant(conn: &ConnectionId) -> EngineError {
	EngineError::not_found(format!("participant {conn}"))
}

/// Owns the participant list of every room and the per-connection actions on it.
#[derive(Clone)]
pub struct PresenceManager {
	rooms: RoomDirectory,
	perms: PermissionResolver,
	sessions: SessionCache,
	flood: FloodGovernor,
	relay: RelaySelector,
	port: Arc<dyn BroadcastPort>,
}

impl PresenceManager {
	pub fn new(
		rooms: RoomDirectory,
		perms: PermissionResolver,
		sessions: SessionCache,
		flood: FloodGovernor,
		relay: RelaySelector,
		port: Arc<dyn BroadcastPort>,
	) -> Self {
		Self {
			rooms,
			perms,
			sessions,
			flood,
			relay,
			port,
		}
	}

	/// Resolve the connection's live session and refresh its TTL.
	pub async fn actor(&self, conn: &ConnectionId) -> EngineResult<Actor> {
		let session = match self.sessions.get(conn).await.or_internal("load session")? {
			SessionLookup::Found(r) if !r.disconnected => r,
			_ => return Err(EngineError::not_found("session")),
		};
		let Some(room) = session.room.clone() else {
			return Err(EngineError::not_found("room membership"));
		};
		self.sessions.touch(conn).await.or_internal("refresh session")?;
		Ok(Actor {
			conn: conn.clone(),
			room,
			identity: session.identity(),
			session,
		})
	}

	/// Extend a live connection's session so an idle participant keeps it.
	pub async fn keep_alive(&self, conn: &ConnectionId) -> EngineResult<bool> {
		self.sessions.touch(conn).await.or_internal("refresh session")
	}

	/// The actor's own participant entry.
	pub async fn actor_participant(&self, actor: &Actor) -> EngineResult<(Room, Participant)> {
		let room = self.rooms.load(&actor.room).await?;
		let p = room
			.participant(&actor.conn)
			.cloned()
			.ok_or_else(|| missing_participant(&actor.conn))?;
		Ok((room, p))
	}

	/// Union of active site-ban restrictions matching the lookup, with the first ban's reason.
	pub async fn site_restrictions(&self, lookup: &BanLookup) -> EngineResult<(Restrictions, Option<String>)> {
		let bans = self
			.rooms
			.docs()
			.active_site_bans(Utc::now())
			.await
			.or_internal("load site bans")?;
		let mut restrictions = Restrictions::default();
		let mut reason = None;
		for ban in bans.iter().filter(|b| b.matches(lookup)) {
			restrictions = restrictions.union(ban.restrictions);
			if reason.is_none() {
				reason.clone_from(&ban.reason);
			}
		}
		Ok((restrictions, reason))
	}

	pub async fn join(&self, req: JoinRequest) -> EngineResult<JoinOutcome> {
		let mut handle = req.handle.clone();
		let mut color = req.color.clone();
		let mut resumed = false;

		if let Some(prev) = &req.resume_from
			&& prev != &req.conn
			&& let SessionLookup::Found(old) = self.sessions.get(prev).await.or_internal("load session")?
			&& old.disconnected
			&& !old.kicked
			&& old.session_id == req.identity.session_id
		{
			handle = old.handle;
			color = old.color;
			resumed = true;
		}

		let handle = validate_handle(&handle)?;
		let color = validate_color(&color)?;

		// A connection sits in one room at a time.
		if let SessionLookup::Found(current) = self.sessions.get(&req.conn).await.or_internal("load session")?
			&& !current.disconnected
			&& current.room.is_some()
		{
			self.leave(&req.conn, "switched rooms").await?;
		}

		let _guard = self.rooms.lock(&req.room).await;

		let lookup = BanLookup {
			ip: Some(req.identity.ip.clone()),
			session_id: Some(req.identity.session_id.clone()),
			user_id: req.identity.user_id.clone(),
			..BanLookup::default()
		};
		let (restrictions, reason) = self.site_restrictions(&lookup).await?;
		if restrictions.join {
			return Err(EngineError::Banned { reason });
		}

		if let Some(closure) = self
			.rooms
			.docs()
			.active_closure(&req.room, Utc::now())
			.await
			.or_internal("load closure")?
		{
			return Err(EngineError::RoomClosed {
				reason: closure.reason,
				until: closure.expires_at,
			});
		}

		let existing = self.rooms.find(&req.room).await?;
		if existing.as_ref().is_none_or(|r| r.relay.is_none()) {
			let attachment = self.relay.attach_new_room().await?;
			match existing {
				None => {
					let mut room = Room::new(req.room.clone());
					room.relay = attachment;
					self.rooms.create(&room).await?;
				}
				Some(_) if attachment.is_some() => {
					self.rooms
						.modify(&req.room, |r| {
							if r.relay.is_none() {
								r.relay.clone_from(&attachment);
							}
							Ok(())
						})
						.await?;
				}
				Some(_) => {}
			}
		}

		let roles = self.perms.role_tags(&req.room, &req.identity).await?;
		let participant = Participant {
			connection_id: req.conn.clone(),
			session_id: req.identity.session_id.clone(),
			ip: req.identity.ip.clone(),
			user_id: req.identity.user_id.clone(),
			handle: handle.clone(),
			color: color.clone(),
			broadcasting: false,
			silenced: false,
			roles,
			is_admin: req.is_admin,
			is_site_mod: req.is_site_mod,
			joined_at: Utc::now(),
		};

		let password_hash = req.password.as_deref().filter(|p| !p.is_empty()).map(hash_password);
		let (room, ()) = self
			.rooms
			.modify(&req.room, |room| {
				if room.ban_for(&req.identity).is_some() {
					return Err(EngineError::Banned {
						reason: Some("you are banned from this room".to_string()),
					});
				}
				if let Some(expected) = &room.settings.password_hash
					&& !room.is_owner(req.identity.user_id.as_ref())
					&& password_hash.as_ref() != Some(expected)
				{
					return Err(EngineError::validation("incorrect room password"));
				}
				if room.handle_taken(&handle, Some(&req.conn)) {
					return Err(EngineError::validation(format!("handle {handle} is taken")));
				}
				room.remove_participant(&req.conn);
				room.participants.push(participant.clone());
				Ok(())
			})
			.await?;

		let mut record = SessionRecord::new(&req.identity, &handle, &color);
		record.room = Some(req.room.clone());
		record.list_id.clone_from(&req.list_id);
		self.sessions.put(&req.conn, &record).await.or_internal("save session")?;
		if resumed && let Some(prev) = &req.resume_from {
			self.sessions.remove(prev).await.or_internal("drop resumed session")?;
		}

		self.port.attach(&req.conn, &req.room).await;
		self.port
			.to_room(
				&req.room,
				Event::ParticipantJoined(pb::ParticipantJoined {
					participant: Some(wire_participant(&participant)),
				}),
				Some(&req.conn),
			)
			.await;

		let permissions = self.perms.effective_permissions(&req.room, &req.identity).await?;

		info!(room = %req.room, conn_id = %req.conn, identity = %req.identity, resumed, "participant joined");
		metrics::counter!("roomcast_server_joins_total").increment(1);

		Ok(JoinOutcome {
			room,
			participant,
			permissions,
			resumed,
		})
	}

	/// Remove the connection from its room.
	///
	/// Without a cached session the rooms the connection is attached to are used instead.
	pub async fn leave(&self, conn: &ConnectionId, reason: &str) -> EngineResult<()> {
		let rooms = match self.sessions.get(conn).await.or_internal("load session")? {
			SessionLookup::Found(r) => r.room.into_iter().collect(),
			SessionLookup::NoSession => {
				let rooms = self.port.rooms_of(conn).await;
				if !rooms.is_empty() {
					debug!(conn_id = %conn, rooms = rooms.len(), "session expired, leaving attached rooms");
				}
				rooms
			}
		};
		for room in &rooms {
			let _guard = self.rooms.lock(room).await;
			self.remove_participant_locked(room, conn, reason).await?;
		}
		self.sessions
			.mark_disconnected(conn)
			.await
			.or_internal("mark session disconnected")?;
		Ok(())
	}

	/// Remove one participant and clean up the room if it is now empty. Caller holds the room lock.
	pub(crate) async fn remove_participant_locked(
		&self,
		room: &RoomName,
		conn: &ConnectionId,
		reason: &str,
	) -> EngineResult<Option<Participant>> {
		self.port.detach(conn, room).await;

		let Some(current) = self.rooms.find(room).await? else {
			return Ok(None);
		};
		if current.participant(conn).is_none() {
			return Ok(None);
		}

		let (after, (removed, released)) = self
			.rooms
			.modify(room, |r| {
				let removed = r.remove_participant(conn);
				let released = if r.participants.is_empty() && r.owner.is_some() {
					r.relay.take()
				} else {
					None
				};
				Ok((removed, released))
			})
			.await?;

		if let Some(attachment) = &current.relay
			&& let SessionLookup::Found(rec) = self.sessions.get(conn).await.or_internal("load session")?
			&& let Some(session_id) = rec.relay_session_id
		{
			self.relay.close_session(attachment, &session_id).await;
		}

		self.port
			.to_room(
				room,
				Event::ParticipantLeft(pb::ParticipantLeft {
					connection_id: conn.to_string(),
					reason: reason.to_string(),
				}),
				None,
			)
			.await;
		debug!(room = %room, conn_id = %conn, reason, "participant removed");

		if after.is_disposable() {
			self.rooms.delete(room).await?;
			if let Some(attachment) = &after.relay {
				self.relay.release(attachment).await;
			}
			info!(room = %room, "empty room deleted");
		} else if let Some(attachment) = &released {
			self.relay.release(attachment).await;
			debug!(room = %room, "owned room emptied, relay released");
		}

		Ok(removed)
	}

	/// Tell a participant why, close its connection and take it out of the room. Caller holds the lock.
	pub(crate) async fn force_out(&self, room: &RoomName, target: &ConnectionId, event: Event, reason: &str) -> EngineResult<()> {
		self.sessions.mark_kicked(target).await.or_internal("flag session")?;
		self.port.to_connection(target, event).await;
		self.port.disconnect(target, reason).await;
		self.remove_participant_locked(room, target, reason).await?;
		self.sessions
			.mark_disconnected(target)
			.await
			.or_internal("mark session disconnected")?;
		Ok(())
	}

	/// End a participant's broadcast without disconnecting it. Caller holds the room lock.
	pub(crate) async fn stop_broadcast_locked(&self, room: &RoomName, target: &ConnectionId, reason: &str) -> EngineResult<()> {
		self.port
			.to_connection(
				target,
				Event::StopBroadcasting(pb::StopBroadcasting {
					reason: reason.to_string(),
				}),
			)
			.await;

		let current = self.rooms.load(room).await?;
		if let Some(attachment) = &current.relay
			&& let SessionLookup::Found(rec) = self.sessions.get(target).await.or_internal("load session")?
			&& let Some(session_id) = rec.relay_session_id
		{
			self.relay.close_session(attachment, &session_id).await;
			self.sessions
				.merge(target, SessionPatch::new().relay_session(None))
				.await
				.or_internal("save session")?;
		}

		if current.participant(target).is_some_and(|p| p.broadcasting) {
			let (after, ()) = self
				.rooms
				.modify(room, |r| {
					if let Some(p) = r.participant_mut(target) {
						p.broadcasting = false;
					}
					Ok(())
				})
				.await?;
			if let Some(p) = after.participant(target) {
				self.port.to_room(room, participant_updated(p), None).await;
			}
		}
		Ok(())
	}

	/// Apply `f` to the actor's participant entry and announce the result.
	async fn update_self<F>(&self, actor: &Actor, f: F) -> EngineResult<Participant>
	where
		F: FnMut(&Room, &mut Participant) -> EngineResult<()> + Send,
	{
		let _guard = self.rooms.lock(&actor.room).await;
		self.update_self_locked(actor, f).await
	}

	/// [`update_self`](Self::update_self) for callers already holding the room lock.
	async fn update_self_locked<F>(&self, actor: &Actor, mut f: F) -> EngineResult<Participant>
	where
		F: FnMut(&Room, &mut Participant) -> EngineResult<()> + Send,
	{
		let (room, ()) = self
			.rooms
			.modify(&actor.room, |room| {
				let snapshot = room.clone();
				let p = room
					.participant_mut(&actor.conn)
					.ok_or_else(|| missing_participant(&actor.conn))?;
				f(&snapshot, p)
			})
			.await?;
		let p = room
			.participant(&actor.conn)
			.cloned()
			.ok_or_else(|| missing_participant(&actor.conn))?;
		self.port.to_room(&actor.room, participant_updated(&p), None).await;
		Ok(p)
	}

	pub async fn change_handle(&self, conn: &ConnectionId, handle: &str) -> EngineResult<Participant> {
		self.flood.check_and_increment(conn).await?;
		let actor = self.actor(conn).await?;
		let handle = validate_handle(handle)?;

		let p = self
			.update_self(&actor, |room, p| {
				if room.handle_taken(&handle, Some(conn)) {
					return Err(EngineError::validation(format!("handle {handle} is taken")));
				}
				p.handle.clone_from(&handle);
				Ok(())
			})
			.await?;
		self.sessions
			.merge(conn, SessionPatch::new().handle(&handle))
			.await
			.or_internal("save session")?;
		Ok(p)
	}

	pub async fn change_color(&self, conn: &ConnectionId, color: &str) -> EngineResult<Participant> {
		let actor = self.actor(conn).await?;
		let color = validate_color(color)?;

		let p = self
			.update_self(&actor, |_, p| {
				p.color.clone_from(&color);
				Ok(())
			})
			.await?;
		self.sessions
			.merge(conn, SessionPatch::new().color(&color))
			.await
			.or_internal("save session")?;
		Ok(p)
	}

	/// Set or clear the topic. Returns `false` when the trimmed text equals the current topic.
	pub async fn set_topic(&self, conn: &ConnectionId, text: &str) -> EngineResult<bool> {
		self.flood.check_and_increment(conn).await?;
		let actor = self.actor(conn).await?;

		let text = text.trim();
		if text.chars().count() > MAX_TOPIC_LEN {
			return Err(EngineError::validation(format!("topic is limited to {MAX_TOPIC_LEN} characters")));
		}

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::RoomDetails).await?;
		let current = self.rooms.load(&actor.room).await?;
		let current_text = current.settings.topic.as_ref().map_or("", |t| t.text.as_str());
		if current_text == text {
			return Ok(false);
		}

		let updated_by = actor.session.handle.clone();
		self.rooms
			.modify(&actor.room, |room| {
				room.settings.topic = (!text.is_empty()).then(|| Topic {
					text: text.to_string(),
					updated_at: Utc::now(),
					updated_by: Some(updated_by.clone()),
				});
				Ok(())
			})
			.await?;

		self.port
			.to_room(
				&actor.room,
				Event::TopicChanged(pb::TopicChanged {
					text: text.to_string(),
					updated_by,
				}),
				None,
			)
			.await;
		Ok(true)
	}

	/// Set the room password (owner or `roomDetails`). `None` or empty removes it.
	pub async fn set_password(&self, conn: &ConnectionId, password: Option<&str>) -> EngineResult<()> {
		let actor = self.actor(conn).await?;
		let hash = password.filter(|p| !p.is_empty()).map(hash_password);

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::RoomDetails).await?;
		self.rooms
			.modify(&actor.room, |room| {
				room.settings.password_hash.clone_from(&hash);
				Ok(())
			})
			.await?;
		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), if hash.is_some() { "set password" } else { "clear password" })
					.in_room(&actor.room),
			)
			.await;
		Ok(())
	}

	pub async fn chat(&self, conn: &ConnectionId, text: &str) -> EngineResult<()> {
		self.flood.check_and_increment(conn).await?;
		let actor = self.actor(conn).await?;

		let text = text.trim();
		if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
			return Err(EngineError::validation(format!("message must be 1-{MAX_CHAT_LEN} characters")));
		}

		let (_, me) = self.actor_participant(&actor).await?;
		if me.silenced {
			return Err(EngineError::Silenced);
		}

		self.port
			.to_room(
				&actor.room,
				Event::ChatMessage(pb::ChatMessage {
					from_connection_id: conn.to_string(),
					handle: me.handle,
					color: me.color,
					text: text.to_string(),
				}),
				None,
			)
			.await;
		metrics::counter!("roomcast_server_chat_messages_total").increment(1);
		Ok(())
	}

	pub async fn private_message(&self, conn: &ConnectionId, to: &ConnectionId, text: &str) -> EngineResult<()> {
		self.flood.check_and_increment(conn).await?;
		let actor = self.actor(conn).await?;

		let text = text.trim();
		if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
			return Err(EngineError::validation(format!("message must be 1-{MAX_CHAT_LEN} characters")));
		}

		let (room, me) = self.actor_participant(&actor).await?;
		if room.participant(to).is_none() {
			return Err(missing_participant(to));
		}

		self.port
			.to_connection(
				to,
				Event::PrivateMessage(pb::PrivateMessage {
					from_connection_id: conn.to_string(),
					handle: me.handle,
					text: text.to_string(),
				}),
			)
			.await;
		Ok(())
	}

	/// Start or stop broadcasting. Starting opens a relay session and sends its id to the caller.
	pub async fn set_broadcasting(&self, conn: &ConnectionId, broadcasting: bool) -> EngineResult<Participant> {
		let actor = self.actor(conn).await?;

		let _guard = self.rooms.lock(&actor.room).await;
		if broadcasting {
			self.perms.require(&actor.room, &actor.identity, Capability::Broadcast).await?;
			let lookup = BanLookup {
				ip: Some(actor.identity.ip.clone()),
				session_id: Some(actor.identity.session_id.clone()),
				user_id: actor.identity.user_id.clone(),
				..BanLookup::default()
			};
			let (restrictions, reason) = self.site_restrictions(&lookup).await?;
			if restrictions.broadcast {
				return Err(EngineError::Banned { reason });
			}
		}

		let room = self.rooms.load(&actor.room).await?;
		if let Some(attachment) = &room.relay {
			match (&actor.session.relay_session_id, broadcasting) {
				(None, true) => {
					let session_id = self.relay.open_session(attachment).await?;
					self.sessions
						.merge(conn, SessionPatch::new().relay_session(Some(session_id.clone())))
						.await
						.or_internal("save session")?;
					self.port
						.to_connection(
							conn,
							Event::BroadcastSession(pb::BroadcastSession {
								relay_node_id: attachment.node_id.clone(),
								relay_room_id: attachment.relay_room_id.clone(),
								relay_session_id: session_id,
							}),
						)
						.await;
				}
				(Some(session_id), false) => {
					self.relay.close_session(attachment, session_id).await;
					self.sessions
						.merge(conn, SessionPatch::new().relay_session(None))
						.await
						.or_internal("save session")?;
				}
				_ => {}
			}
		}

		self.update_self_locked(&actor, |_, p| {
			p.broadcasting = broadcasting;
			Ok(())
		})
		.await
	}

	/// Remove a participant by force. Site staff cannot be kicked.
	pub async fn kick(&self, conn: &ConnectionId, target: &ConnectionId) -> EngineResult<()> {
		let actor = self.actor(conn).await?;
		if target == conn {
			return Err(EngineError::validation("you cannot kick yourself"));
		}

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::Kick).await?;
		let room = self.rooms.load(&actor.room).await?;
		let victim = room.participant(target).cloned().ok_or_else(|| missing_participant(target))?;
		if victim.is_staff() {
			return Err(EngineError::forbidden("kick site staff"));
		}

		self.force_out(
			&actor.room,
			target,
			Event::Kicked(pb::Kicked {
				reason: format!("kicked by {}", actor.session.handle),
			}),
			"kicked",
		)
		.await?;

		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), "kick")
					.in_room(&actor.room)
					.target(victim.handle.clone()),
			)
			.await;
		info!(room = %actor.room, conn_id = %conn, target = %target, "participant kicked");
		Ok(())
	}

	/// Take ownership of an ownerless room, creating it if needed.
	pub async fn claim_room(&self, name: &RoomName, user: &UserId) -> EngineResult<Room> {
		let _guard = self.rooms.lock(name).await;
		match self.rooms.find(name).await? {
			None => {
				let mut room = Room::new(name.clone());
				room.owner = Some(user.clone());
				self.rooms.create(&room).await?;
				info!(room = %name, owner = %user, "room claimed");
				Ok(room)
			}
			Some(room) if room.owner.as_ref() == Some(user) => Ok(room),
			Some(room) if room.owner.is_some() => Err(EngineError::forbidden("claim a room owned by someone else")),
			Some(_) => {
				let (room, ()) = self
					.rooms
					.modify(name, |r| {
						r.owner = Some(user.clone());
						Ok(())
					})
					.await?;
				info!(room = %name, owner = %user, "room claimed");
				Ok(room)
			}
		}
	}

	/// Claim the actor's current room for their account.
	pub async fn claim_current_room(&self, conn: &ConnectionId) -> EngineResult<Room> {
		let actor = self.actor(conn).await?;
		let Some(user) = actor.identity.user_id.clone() else {
			return Err(EngineError::validation("claiming a room needs an account"));
		};
		let room = self.claim_room(&actor.room, &user).await?;
		self.rooms
			.record_activity(ModerationActivity::new(actor.label(), "claim room").in_room(&actor.room))
			.await;
		Ok(room)
	}

	/// Store the web-push subscription for this connection's session.
	pub async fn register_push(&self, conn: &ConnectionId, subscription: PushSubscription) -> EngineResult<()> {
		if !subscription.endpoint.starts_with("https://") || subscription.p256dh.is_empty() || subscription.auth.is_empty()
		{
			return Err(EngineError::validation("push subscription needs an https endpoint and keys"));
		}
		self.actor(conn).await?;
		self.sessions
			.merge(conn, SessionPatch::new().push_subscription(subscription))
			.await
			.or_internal("save session")?;
		Ok(())
	}

	/// Queue shared media for the room.
	pub async fn play_media(&self, conn: &ConnectionId, url: &str, title: Option<&str>) -> EngineResult<PlaylistItem> {
		let actor = self.actor(conn).await?;

		let url = url.trim();
		if !(url.starts_with("https://") || url.starts_with("http://")) || url.len() > MAX_MEDIA_URL_LEN {
			return Err(EngineError::validation("media url must be an http(s) link"));
		}

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::PlayMedia).await?;

		let item = PlaylistItem {
			id: Uuid::new_v4(),
			room: actor.room.clone(),
			url: url.to_string(),
			title: title.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
			added_by: actor.session.handle.clone(),
			added_at: Utc::now(),
		};
		self.rooms
			.docs()
			.push_playlist_item(&item)
			.await
			.or_internal("save playlist item")?;

		self.port
			.to_room(
				&actor.room,
				Event::MediaQueued(pb::MediaQueued {
					url: item.url.clone(),
					title: item.title.clone().unwrap_or_default(),
					added_by: item.added_by.clone(),
				}),
				None,
			)
			.await;
		Ok(item)
	}

	pub async fn create_role(
		&self,
		conn: &ConnectionId,
		name: &str,
		capabilities: &[Capability],
	) -> EngineResult<roomcast_domain::Role> {
		let actor = self.actor(conn).await?;
		self.perms
			.create_role(
				&actor.room,
				&actor.identity,
				name,
				Permissions::from_granted(capabilities.iter().copied()),
			)
			.await
	}

	pub async fn update_role(
		&self,
		conn: &ConnectionId,
		tag: &str,
		name: Option<&str>,
		capabilities: Option<&[Capability]>,
	) -> EngineResult<roomcast_domain::Role> {
		let actor = self.actor(conn).await?;
		self.perms
			.update_role(
				&actor.room,
				&actor.identity,
				tag,
				name,
				capabilities.map(|c| Permissions::from_granted(c.iter().copied())),
			)
			.await
	}

	/// Delete a custom role and drop its tag from everyone holding it.
	pub async fn delete_role(&self, conn: &ConnectionId, tag: &str) -> EngineResult<()> {
		let actor = self.actor(conn).await?;
		self.perms.delete_role(&actor.room, &actor.identity, tag).await?;

		let _guard = self.rooms.lock(&actor.room).await;
		let (room, changed) = self
			.rooms
			.modify(&actor.room, |r| {
				let mut changed = Vec::new();
				for p in &mut r.participants {
					let before = p.roles.len();
					p.roles.retain(|t| t != tag);
					if p.roles.len() != before {
						changed.push(p.connection_id.clone());
					}
				}
				Ok(changed)
			})
			.await?;
		for p in changed.iter().filter_map(|c| room.participant(c)) {
			self.port.to_room(&actor.room, participant_updated(p), None).await;
		}

		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), "delete role")
					.in_room(&actor.room)
					.detail(tag),
			)
			.await;
		Ok(())
	}

	/// Enroll another participant in a role and announce their new role list.
	pub async fn assign_role(&self, conn: &ConnectionId, target: &ConnectionId, tag: &str) -> EngineResult<Participant> {
		let actor = self.actor(conn).await?;
		let target_identity = self.participant_identity(&actor.room, target).await?;
		self.perms.enroll(&actor.room, &actor.identity, tag, &target_identity).await?;
		self.refresh_roles(&actor, target, &target_identity, "assign role", tag).await
	}

	pub async fn unassign_role(&self, conn: &ConnectionId, target: &ConnectionId, tag: &str) -> EngineResult<Participant> {
		let actor = self.actor(conn).await?;
		let target_identity = self.participant_identity(&actor.room, target).await?;
		self.perms.unenroll(&actor.room, &actor.identity, tag, &target_identity).await?;
		self.refresh_roles(&actor, target, &target_identity, "unassign role", tag).await
	}

	async fn participant_identity(&self, room: &RoomName, conn: &ConnectionId) -> EngineResult<Identity> {
		let room = self.rooms.load(room).await?;
		room.participant(conn)
			.map(Participant::identity)
			.ok_or_else(|| missing_participant(conn))
	}

	async fn refresh_roles(
		&self,
		actor: &Actor,
		target: &ConnectionId,
		target_identity: &Identity,
		action: &str,
		tag: &str,
	) -> EngineResult<Participant> {
		let tags = self.perms.role_tags(&actor.room, target_identity).await?;

		let _guard = self.rooms.lock(&actor.room).await;
		let (room, ()) = self
			.rooms
			.modify(&actor.room, |room| {
				let p = room.participant_mut(target).ok_or_else(|| missing_participant(target))?;
				p.roles.clone_from(&tags);
				Ok(())
			})
			.await?;
		let p = room.participant(target).cloned().ok_or_else(|| missing_participant(target))?;

		self.port.to_room(&actor.room, participant_updated(&p), None).await;
		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), action)
					.in_room(&actor.room)
					.target(p.handle.clone())
					.detail(tag),
			)
			.await;
		Ok(p)
	}
}

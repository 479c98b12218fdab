#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use roomcast_domain::{
	BanEntry, BanLookup, Capability, ConnectionId, IdentitySnapshot, ModerationActivity, Restrictions, RoomClosure,
	RoomName, SiteBan, UserId,
};
use roomcast_protocol::pb;
use roomcast_protocol::pb::server_envelope::Event;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::hub::BroadcastPort;
use crate::server::permissions::PermissionResolver;
use crate::server::presence::{Actor, PresenceManager, participant_updated};
use crate::server::rooms::RoomDirectory;
use crate::server::store::Page;
use crate::util::time::{add_duration, hours};

#[derive(Debug, Clone)]
pub struct ModerationSettings {
	pub default_closure_hours: u32,
	pub default_site_ban_hours: u32,
}

impl Default for ModerationSettings {
	fn default() -> Self {
		Self {
			default_closure_hours: 24,
			default_site_ban_hours: 24,
		}
	}
}

/// Admin listing row for an occupied room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
	pub name: RoomName,
	pub owner: Option<UserId>,
	pub participants: usize,
	pub topic: Option<String>,
	pub relay_node: Option<String>,
}

/// Room bans, silences, site bans and room closures.
#[derive(Clone)]
pub struct ModerationService {
	rooms: RoomDirectory,
	perms: PermissionResolver,
	presence: PresenceManager,
	port: Arc<dyn BroadcastPort>,
	settings: ModerationSettings,
	/// Serializes find-then-extend on site bans.
	site_ban_lock: Arc<Mutex<()>>,
}

impl ModerationService {
	pub fn new(
		rooms: RoomDirectory,
		perms: PermissionResolver,
		presence: PresenceManager,
		port: Arc<dyn BroadcastPort>,
		settings: ModerationSettings,
	) -> Self {
		Self {
			rooms,
			perms,
			presence,
			port,
			settings,
			site_ban_lock: Arc::new(Mutex::new(())),
		}
	}

	async fn staff_actor(&self, conn: &ConnectionId, action: &str) -> EngineResult<Actor> {
		let actor = self.presence.actor(conn).await?;
		let (_, me) = self.presence.actor_participant(&actor).await?;
		if !me.is_staff() {
			return Err(EngineError::forbidden(action));
		}
		Ok(actor)
	}

	/// Ban a participant from the actor's room and remove them.
	pub async fn ban(&self, conn: &ConnectionId, target: &ConnectionId, reason: &str) -> EngineResult<BanEntry> {
		let actor = self.presence.actor(conn).await?;
		if target == conn {
			return Err(EngineError::validation("you cannot ban yourself"));
		}

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::Ban).await?;
		let room = self.rooms.load(&actor.room).await?;
		let victim = room
			.participant(target)
			.cloned()
			.ok_or_else(|| EngineError::not_found(format!("participant {target}")))?;
		if victim.is_staff() {
			return Err(EngineError::forbidden("ban site staff"));
		}

		let entry = BanEntry::for_participant(&victim, Some(actor.label()));
		self.rooms
			.modify(&actor.room, |r| {
				r.bans.push(entry.clone());
				Ok(())
			})
			.await?;

		let reason = reason.trim();
		if let Err(err) = self
			.presence
			.force_out(
				&actor.room,
				target,
				Event::ForcedBan(pb::ForcedBan {
					reason: reason.to_string(),
					restrict_join: true,
					restrict_broadcast: false,
				}),
				"banned",
			)
			.await
		{
			warn!(error = %err, room = %actor.room, target = %target, "ban recorded but removal failed");
		}

		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), "ban")
					.in_room(&actor.room)
					.target(victim.handle.clone())
					.detail(reason),
			)
			.await;
		info!(room = %actor.room, target = %target, "participant banned from room");
		Ok(entry)
	}

	pub async fn unban(&self, conn: &ConnectionId, ban_id: Uuid) -> EngineResult<()> {
		let actor = self.presence.actor(conn).await?;

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms.require(&actor.room, &actor.identity, Capability::Ban).await?;
		let (_, removed) = self
			.rooms
			.modify(&actor.room, |r| {
				let idx = r
					.bans
					.iter()
					.position(|b| b.id == ban_id)
					.ok_or_else(|| EngineError::not_found(format!("ban {ban_id}")))?;
				Ok(r.bans.remove(idx))
			})
			.await?;

		self.rooms
			.record_activity(
				ModerationActivity::new(actor.label(), "unban")
					.in_room(&actor.room)
					.target(removed.handle),
			)
			.await;
		Ok(())
	}

	/// Toggle whether a participant may chat.
	pub async fn silence(&self, conn: &ConnectionId, target: &ConnectionId, silenced: bool) -> EngineResult<()> {
		let actor = self.presence.actor(conn).await?;

		let _guard = self.rooms.lock(&actor.room).await;
		self.perms
			.require(&actor.room, &actor.identity, Capability::MuteUserChat)
			.await?;
		let (room, ()) = self
			.rooms
			.modify(&actor.room, |r| {
				let p = r
					.participant_mut(target)
					.ok_or_else(|| EngineError::not_found(format!("participant {target}")))?;
				if p.is_staff() {
					return Err(EngineError::forbidden("silence site staff"));
				}
				p.silenced = silenced;
				Ok(())
			})
			.await?;

		if let Some(p) = room.participant(target) {
			self.port.to_room(&actor.room, participant_updated(p), None).await;
			self.rooms
				.record_activity(
					ModerationActivity::new(actor.label(), if silenced { "silence" } else { "unsilence" })
						.in_room(&actor.room)
						.target(p.handle.clone()),
				)
				.await;
		}
		Ok(())
	}

	/// Create a site ban, or widen and extend the active one matching any of the same identity keys.
	///
	/// Then applies it to every room the identity occupies. Enforcement is best-effort and never undoes
	/// the stored ban.
	pub async fn create_or_extend_site_ban(
		&self,
		actor: &str,
		lookup: BanLookup,
		restrictions: Restrictions,
		duration_hours: Option<u32>,
		reason: Option<String>,
	) -> EngineResult<SiteBan> {
		if lookup.is_empty() {
			return Err(EngineError::validation("a site ban needs at least one identity field"));
		}
		if restrictions.is_empty() {
			return Err(EngineError::validation("a site ban needs at least one restriction"));
		}
		let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
		let hours_requested = duration_hours
			.filter(|h| *h > 0)
			.unwrap_or(self.settings.default_site_ban_hours);

		let ban = {
			let _guard = self.site_ban_lock.lock().await;
			let docs = self.rooms.docs();
			let now = Utc::now();
			let expires_at = add_duration(now, hours(hours_requested));

			let existing = docs
				.active_site_bans(now)
				.await
				.or_internal("load site bans")?
				.into_iter()
				.find(|b| b.matches(&lookup));

			let ban = match existing {
				Some(mut ban) => {
					ban.restrictions = ban.restrictions.union(restrictions);
					ban.expires_at = ban.expires_at.max(expires_at);
					ban.absorb_keys(&lookup);
					if ban.reason.is_none() {
						ban.reason = reason;
					}
					info!(ban_id = %ban.id, "site ban extended");
					ban
				}
				None => SiteBan {
					id: Uuid::new_v4(),
					keys: lookup,
					restrictions,
					reason,
					created_by: Some(actor.to_string()),
					created_at: now,
					expires_at,
				},
			};
			docs.put_site_ban(&ban).await.or_internal("save site ban")?;
			ban
		};

		self.enforce_site_ban(&ban).await;
		self.rooms
			.record_activity(
				ModerationActivity::new(actor, "site ban")
					.target(ban.id.to_string())
					.detail(format!(
						"join={} broadcast={} until={}",
						ban.restrictions.join, ban.restrictions.broadcast, ban.expires_at
					)),
			)
			.await;
		metrics::counter!("roomcast_server_site_bans_total").increment(1);
		Ok(ban)
	}

	async fn enforce_site_ban(&self, ban: &SiteBan) {
		let rooms = match self.rooms.docs().rooms().await {
			Ok(rooms) => rooms,
			Err(err) => {
				warn!(error = ?err, ban_id = %ban.id, "site ban stored but rooms could not be listed");
				return;
			}
		};

		let hit = |room: &roomcast_domain::Room| -> Vec<ConnectionId> {
			room.participants
				.iter()
				.filter(|p| ban.matches(&BanLookup::for_participant(p)))
				.map(|p| p.connection_id.clone())
				.collect()
		};

		for room in rooms {
			if hit(&room).is_empty() {
				continue;
			}

			// Participants may have changed since the listing.
			let _guard = self.rooms.lock(&room.name).await;
			let hits = match self.rooms.find(&room.name).await {
				Ok(Some(current)) => hit(&current),
				Ok(None) => continue,
				Err(err) => {
					warn!(error = %err, room = %room.name, "site ban enforcement could not reload room");
					continue;
				}
			};
			for conn in hits {
				if let Err(err) = self.apply_site_ban(&room.name, &conn, ban).await {
					warn!(error = %err, room = %room.name, conn_id = %conn, "site ban enforcement failed");
				}
			}
		}
	}

	async fn apply_site_ban(&self, room: &RoomName, conn: &ConnectionId, ban: &SiteBan) -> EngineResult<()> {
		let event = Event::ForcedBan(pb::ForcedBan {
			reason: ban.reason.clone().unwrap_or_default(),
			restrict_join: ban.restrictions.join,
			restrict_broadcast: ban.restrictions.broadcast,
		});

		if ban.restrictions.join {
			return self.presence.force_out(room, conn, event, "site banned").await;
		}

		self.port.to_connection(conn, event).await;
		if ban.restrictions.broadcast {
			self.presence
				.stop_broadcast_locked(room, conn, "broadcasting is restricted")
				.await?;
		}
		Ok(())
	}

	/// Site-ban another participant of the actor's room. Staff only.
	pub async fn site_ban_participant(
		&self,
		conn: &ConnectionId,
		target: &ConnectionId,
		restrictions: Restrictions,
		duration_hours: Option<u32>,
		reason: Option<String>,
	) -> EngineResult<SiteBan> {
		let actor = self.staff_actor(conn, "site ban").await?;
		let room = self.rooms.load(&actor.room).await?;
		let victim = room
			.participant(target)
			.ok_or_else(|| EngineError::not_found(format!("participant {target}")))?;
		if victim.is_staff() {
			return Err(EngineError::forbidden("site ban site staff"));
		}
		self.create_or_extend_site_ban(
			&actor.label(),
			BanLookup::for_participant(victim),
			restrictions,
			duration_hours,
			reason,
		)
		.await
	}

	/// Close a room for a while and remove everyone in it.
	pub async fn close_room(
		&self,
		actor: &str,
		name: &RoomName,
		reason: &str,
		duration_hours: Option<u32>,
	) -> EngineResult<RoomClosure> {
		let reason = reason.trim();
		if reason.is_empty() {
			return Err(EngineError::validation("a closure needs a reason"));
		}
		let hours_requested = duration_hours
			.filter(|h| *h > 0)
			.unwrap_or(self.settings.default_closure_hours);

		let _guard = self.rooms.lock(name).await;
		let participants = self
			.rooms
			.find(name)
			.await?
			.map(|r| r.participants)
			.unwrap_or_default();
		let now = Utc::now();
		let closure = RoomClosure {
			id: Uuid::new_v4(),
			room: name.clone(),
			reason: reason.to_string(),
			duration_hours: hours_requested,
			affected: participants.iter().map(IdentitySnapshot::from).collect(),
			closed_by: Some(actor.to_string()),
			created_at: now,
			expires_at: add_duration(now, hours(hours_requested)),
		};
		self.rooms
			.docs()
			.put_closure(&closure)
			.await
			.or_internal("save closure")?;

		for p in &participants {
			let event = Event::RoomClosed(pb::RoomClosed {
				reason: closure.reason.clone(),
				expires_at_unix_ms: closure.expires_at.timestamp_millis(),
			});
			if let Err(err) = self
				.presence
				.force_out(name, &p.connection_id, event, "room closed")
				.await
			{
				warn!(error = %err, room = %name, conn_id = %p.connection_id, "closure removal failed");
			}
		}

		self.rooms
			.record_activity(
				ModerationActivity::new(actor, "close room")
					.in_room(name)
					.detail(format!("{reason} ({hours_requested}h)")),
			)
			.await;
		info!(room = %name, hours = hours_requested, affected = closure.affected.len(), "room closed");
		Ok(closure)
	}

	/// Close the actor's own room. Staff only.
	pub async fn close_current_room(
		&self,
		conn: &ConnectionId,
		reason: &str,
		duration_hours: Option<u32>,
	) -> EngineResult<RoomClosure> {
		let actor = self.staff_actor(conn, "close room").await?;
		self.close_room(&actor.label(), &actor.room, reason, duration_hours).await
	}

	pub async fn list_active_rooms(&self, page: Page) -> EngineResult<Vec<RoomSummary>> {
		let rooms = self.rooms.docs().rooms().await.or_internal("list rooms")?;
		Ok(page.apply(rooms.into_iter().filter(|r| !r.participants.is_empty()).map(|r| {
			RoomSummary {
				participants: r.participants.len(),
				topic: r.settings.topic.map(|t| t.text),
				relay_node: r.relay.map(|a| a.node_id),
				owner: r.owner,
				name: r.name,
			}
		})))
	}

	/// Active site bans, newest first.
	pub async fn list_site_bans(&self, page: Page) -> EngineResult<Vec<SiteBan>> {
		let mut bans = self
			.rooms
			.docs()
			.active_site_bans(Utc::now())
			.await
			.or_internal("list site bans")?;
		bans.sort_by_key(|b| std::cmp::Reverse(b.created_at));
		Ok(page.apply(bans))
	}

	pub async fn list_activity(&self, page: Page) -> EngineResult<Vec<ModerationActivity>> {
		self.rooms.docs().activity(page).await.or_internal("list activity")
	}

	/// Active closure for a room, if any.
	pub async fn closure(&self, name: &RoomName, at: DateTime<Utc>) -> EngineResult<Option<RoomClosure>> {
		self.rooms
			.docs()
			.active_closure(name, at)
			.await
			.or_internal("load closure")
	}
}

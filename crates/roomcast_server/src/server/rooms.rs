#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use roomcast_domain::{Capability, ModerationActivity, Permissions, Role, RoleTag, Room, RoomName};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::store::DocumentStore;

const MAX_CAS_ATTEMPTS: usize = 8;

/// Room lookup and serialized mutation. Depends on nothing but the document store.
///
/// Every write goes through [`RoomDirectory::modify`], a versioned compare-and-swap. Callers that
/// check-then-act across several steps hold [`RoomDirectory::lock`] for the duration.
#[derive(Clone)]
pub struct RoomDirectory {
	docs: Arc<dyn DocumentStore>,
	locks: Arc<parking_lot::Mutex<HashMap<RoomName, Arc<Mutex<()>>>>>,
}

impl RoomDirectory {
	pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
		Self {
			docs,
			locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
		}
	}

	pub fn docs(&self) -> &Arc<dyn DocumentStore> {
		&self.docs
	}

	/// Exclusive per-room guard.
	pub async fn lock(&self, name: &RoomName) -> OwnedMutexGuard<()> {
		let lock = {
			let mut locks = self.locks.lock();
			locks.retain(|_, l| Arc::strong_count(l) > 1);
			locks.entry(name.clone()).or_default().clone()
		};
		lock.lock_owned().await
	}

	pub async fn find(&self, name: &RoomName) -> EngineResult<Option<Room>> {
		self.docs.room(name).await.or_internal("load room")
	}

	pub async fn load(&self, name: &RoomName) -> EngineResult<Room> {
		self.find(name)
			.await?
			.ok_or_else(|| EngineError::not_found(format!("room {name}")))
	}

	/// Persist a new room with its built-in roles. Returns `false` if the name is taken.
	pub async fn create(&self, room: &Room) -> EngineResult<bool> {
		if !self.docs.insert_room(room).await.or_internal("insert room")? {
			return Ok(false);
		}
		for role in builtin_roles(&room.name)? {
			self.docs.put_role(&role).await.or_internal("seed role")?;
		}
		debug!(room = %room.name, "room created");
		metrics::counter!("roomcast_server_rooms_created_total").increment(1);
		Ok(true)
	}

	/// Apply `f` to the current room and write it back if nobody else wrote in between.
	///
	/// `f` may run more than once; an error from `f` aborts without writing.
	pub async fn modify<T, F>(&self, name: &RoomName, mut f: F) -> EngineResult<(Room, T)>
	where
		F: FnMut(&mut Room) -> EngineResult<T> + Send,
		T: Send,
	{
		for attempt in 1..=MAX_CAS_ATTEMPTS {
			let mut room = self.load(name).await?;
			let expected = room.version;
			let out = f(&mut room)?;
			room.version = expected + 1;

			if self.docs.replace_room(&room, expected).await.or_internal("replace room")? {
				return Ok((room, out));
			}
			warn!(room = %name, attempt, "room write conflict, retrying");
			metrics::counter!("roomcast_server_room_write_conflicts_total").increment(1);
		}

		Err(anyhow!("room {name}: gave up after {MAX_CAS_ATTEMPTS} conflicting writes")).or_internal("modify room")
	}

	/// Append to the moderation log. A failed write is logged and does not undo the action.
	pub async fn record_activity(&self, entry: ModerationActivity) {
		if let Err(err) = self.docs.append_activity(&entry).await {
			warn!(error = ?err, action = %entry.action, "failed to record moderation activity");
			metrics::counter!("roomcast_server_store_errors_total", "op" => "append activity").increment(1);
		}
	}

	/// Delete the room and everything scoped to it.
	pub async fn delete(&self, name: &RoomName) -> EngineResult<()> {
		self.docs.delete_room(name).await.or_internal("delete room")?;
		debug!(room = %name, "room deleted");
		Ok(())
	}
}

/// `mods` grants everything but is opt-in; `everybody` applies to all participants.
pub fn builtin_roles(room: &RoomName) -> EngineResult<[Role; 2]> {
	let mut mods = Role::new(room.clone(), "Moderators", RoleTag::new(RoleTag::MODS)?, 0, Permissions::all());
	mods.built_in = true;

	let mut everybody = Role::new(
		room.clone(),
		"Everybody",
		RoleTag::new(RoleTag::EVERYBODY)?,
		100,
		Permissions::from_granted([Capability::Broadcast]),
	);
	everybody.built_in = true;
	everybody.is_default = true;

	Ok([mods, everybody])
}

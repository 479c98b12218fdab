#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use roomcast_domain::{
	Enrollment, EnrollmentFilter, ModerationActivity, PlaylistItem, Report, Role, Room, RoomClosure, RoomName, SiteBan,
	Staff,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Offset/limit window for admin listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
	pub offset: usize,
	pub limit: usize,
}

impl Page {
	pub const MAX_LIMIT: usize = 200;

	pub fn new(offset: usize, limit: usize) -> Self {
		Self {
			offset,
			limit: limit.clamp(1, Self::MAX_LIMIT),
		}
	}

	pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
		items.into_iter().skip(self.offset).take(self.limit).collect()
	}
}

impl Default for Page {
	fn default() -> Self {
		Self::new(0, 50)
	}
}

/// Durable documents: rooms and everything scoped to them, plus site-wide moderation records.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
	async fn room(&self, name: &RoomName) -> anyhow::Result<Option<Room>>;

	/// Insert a new room. Returns `false` if a room with that name already exists.
	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool>;

	/// Replace a room only if the stored version still equals `expected_version`.
	async fn replace_room(&self, room: &Room, expected_version: u64) -> anyhow::Result<bool>;

	/// Delete a room together with its roles, enrollments and playlist.
	async fn delete_room(&self, name: &RoomName) -> anyhow::Result<()>;

	async fn rooms(&self) -> anyhow::Result<Vec<Room>>;

	async fn roles(&self, room: &RoomName) -> anyhow::Result<Vec<Role>>;

	async fn put_role(&self, role: &Role) -> anyhow::Result<()>;

	/// Delete a role and its enrollments. Returns `false` if the role did not exist.
	async fn delete_role(&self, room: &RoomName, role_id: Uuid) -> anyhow::Result<bool>;

	async fn enrollments(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>>;

	async fn put_enrollment(&self, enrollment: &Enrollment) -> anyhow::Result<()>;

	async fn delete_enrollment(&self, id: Uuid) -> anyhow::Result<bool>;

	async fn active_site_bans(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<SiteBan>>;

	async fn put_site_ban(&self, ban: &SiteBan) -> anyhow::Result<()>;

	async fn active_closure(&self, room: &RoomName, now: DateTime<Utc>) -> anyhow::Result<Option<RoomClosure>>;

	async fn put_closure(&self, closure: &RoomClosure) -> anyhow::Result<()>;

	async fn report(&self, id: Uuid) -> anyhow::Result<Option<Report>>;

	async fn put_report(&self, report: &Report) -> anyhow::Result<()>;

	async fn append_activity(&self, entry: &ModerationActivity) -> anyhow::Result<()>;

	/// Newest first.
	async fn activity(&self, page: Page) -> anyhow::Result<Vec<ModerationActivity>>;

	async fn staff(&self) -> anyhow::Result<Vec<Staff>>;

	async fn put_staff(&self, staff: &Staff) -> anyhow::Result<()>;

	async fn push_playlist_item(&self, item: &PlaylistItem) -> anyhow::Result<()>;

	async fn playlist(&self, room: &RoomName) -> anyhow::Result<Vec<PlaylistItem>>;
}

#[derive(Debug, Default)]
struct MemoryState {
	rooms: HashMap<RoomName, Room>,
	roles: HashMap<Uuid, Role>,
	enrollments: HashMap<Uuid, Enrollment>,
	site_bans: HashMap<Uuid, SiteBan>,
	closures: Vec<RoomClosure>,
	reports: HashMap<Uuid, Report>,
	activity: Vec<ModerationActivity>,
	staff: HashMap<String, Staff>,
	playlist: Vec<PlaylistItem>,
}

/// In-process document store used when persistence is disabled.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
	state: RwLock<MemoryState>,
}

impl MemoryDocuments {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocuments {
	async fn room(&self, name: &RoomName) -> anyhow::Result<Option<Room>> {
		Ok(self.state.read().rooms.get(name).cloned())
	}

	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool> {
		let mut st = self.state.write();
		if st.rooms.contains_key(&room.name) {
			return Ok(false);
		}
		st.rooms.insert(room.name.clone(), room.clone());
		Ok(true)
	}

	async fn replace_room(&self, room: &Room, expected_version: u64) -> anyhow::Result<bool> {
		let mut st = self.state.write();
		match st.rooms.get_mut(&room.name) {
			Some(current) if current.version == expected_version => {
				*current = room.clone();
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn delete_room(&self, name: &RoomName) -> anyhow::Result<()> {
		let mut st = self.state.write();
		st.rooms.remove(name);
		st.roles.retain(|_, r| &r.room != name);
		st.enrollments.retain(|_, e| &e.room != name);
		st.playlist.retain(|p| &p.room != name);
		Ok(())
	}

	async fn rooms(&self) -> anyhow::Result<Vec<Room>> {
		let mut rooms: Vec<Room> = self.state.read().rooms.values().cloned().collect();
		rooms.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(rooms)
	}

	async fn roles(&self, room: &RoomName) -> anyhow::Result<Vec<Role>> {
		let mut roles: Vec<Role> = self
			.state
			.read()
			.roles
			.values()
			.filter(|r| &r.room == room)
			.cloned()
			.collect();
		roles.sort_by_key(|r| r.order);
		Ok(roles)
	}

	async fn put_role(&self, role: &Role) -> anyhow::Result<()> {
		self.state.write().roles.insert(role.id, role.clone());
		Ok(())
	}

	async fn delete_role(&self, room: &RoomName, role_id: Uuid) -> anyhow::Result<bool> {
		let mut st = self.state.write();
		let existed = st.roles.get(&role_id).is_some_and(|r| &r.room == room);
		if existed {
			st.roles.remove(&role_id);
			st.enrollments.retain(|_, e| e.role_id != role_id);
		}
		Ok(existed)
	}

	async fn enrollments(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>> {
		Ok(self
			.state
			.read()
			.enrollments
			.values()
			.filter(|e| filter.matches(e))
			.cloned()
			.collect())
	}

	async fn put_enrollment(&self, enrollment: &Enrollment) -> anyhow::Result<()> {
		self.state.write().enrollments.insert(enrollment.id, enrollment.clone());
		Ok(())
	}

	async fn delete_enrollment(&self, id: Uuid) -> anyhow::Result<bool> {
		Ok(self.state.write().enrollments.remove(&id).is_some())
	}

	async fn active_site_bans(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<SiteBan>> {
		let mut bans: Vec<SiteBan> = self
			.state
			.read()
			.site_bans
			.values()
			.filter(|b| b.is_active(now))
			.cloned()
			.collect();
		bans.sort_by_key(|b| b.created_at);
		Ok(bans)
	}

	async fn put_site_ban(&self, ban: &SiteBan) -> anyhow::Result<()> {
		self.state.write().site_bans.insert(ban.id, ban.clone());
		Ok(())
	}

	async fn active_closure(&self, room: &RoomName, now: DateTime<Utc>) -> anyhow::Result<Option<RoomClosure>> {
		Ok(self
			.state
			.read()
			.closures
			.iter()
			.filter(|c| &c.room == room && c.is_active(now))
			.max_by_key(|c| c.expires_at)
			.cloned())
	}

	async fn put_closure(&self, closure: &RoomClosure) -> anyhow::Result<()> {
		let mut st = self.state.write();
		st.closures.retain(|c| c.id != closure.id);
		st.closures.push(closure.clone());
		Ok(())
	}

	async fn report(&self, id: Uuid) -> anyhow::Result<Option<Report>> {
		Ok(self.state.read().reports.get(&id).cloned())
	}

	async fn put_report(&self, report: &Report) -> anyhow::Result<()> {
		self.state.write().reports.insert(report.id, report.clone());
		Ok(())
	}

	async fn append_activity(&self, entry: &ModerationActivity) -> anyhow::Result<()> {
		self.state.write().activity.push(entry.clone());
		Ok(())
	}

	async fn activity(&self, page: Page) -> anyhow::Result<Vec<ModerationActivity>> {
		Ok(page.apply(self.state.read().activity.iter().rev().cloned()))
	}

	async fn staff(&self) -> anyhow::Result<Vec<Staff>> {
		let mut staff: Vec<Staff> = self.state.read().staff.values().cloned().collect();
		staff.sort_by(|a, b| a.user_id.cmp(&b.user_id));
		Ok(staff)
	}

	async fn put_staff(&self, staff: &Staff) -> anyhow::Result<()> {
		self.state
			.write()
			.staff
			.insert(staff.user_id.as_str().to_string(), staff.clone());
		Ok(())
	}

	async fn push_playlist_item(&self, item: &PlaylistItem) -> anyhow::Result<()> {
		self.state.write().playlist.push(item.clone());
		Ok(())
	}

	async fn playlist(&self, room: &RoomName) -> anyhow::Result<Vec<PlaylistItem>> {
		Ok(self
			.state
			.read()
			.playlist
			.iter()
			.filter(|p| &p.room == room)
			.cloned()
			.collect())
	}
}

const KIND_ROOM: &str = "room";
const KIND_ROLE: &str = "role";
const KIND_ENROLLMENT: &str = "enrollment";
const KIND_SITE_BAN: &str = "site_ban";
const KIND_CLOSURE: &str = "closure";
const KIND_REPORT: &str = "report";
const KIND_ACTIVITY: &str = "activity";
const KIND_STAFF: &str = "staff";
const KIND_PLAYLIST: &str = "playlist";

/// SQL-backed store keeping each record as a JSON body in a single `documents` table.
#[derive(Clone)]
pub struct SqlDocuments {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Row written by the store: `(kind, id)` is the key, `room` the scope column.
struct Doc<'a> {
	kind: &'static str,
	id: String,
	room: Option<&'a str>,
	version: i64,
	created_at: i64,
	body: String,
}

impl<'a> Doc<'a> {
	fn new<T: Serialize>(
		kind: &'static str,
		id: impl ToString,
		room: Option<&'a RoomName>,
		created_at: DateTime<Utc>,
		value: &T,
	) -> anyhow::Result<Self> {
		Ok(Self {
			kind,
			id: id.to_string(),
			room: room.map(RoomName::as_str),
			version: 0,
			created_at: created_at.timestamp_millis(),
			body: serde_json::to_string(value).with_context(|| format!("encode {kind} document"))?,
		})
	}
}

fn decode_all<T: DeserializeOwned>(kind: &str, bodies: Vec<(String,)>) -> anyhow::Result<Vec<T>> {
	bodies
		.into_iter()
		.map(|(body,)| serde_json::from_str(&body).with_context(|| format!("decode {kind} document")))
		.collect()
}

impl SqlDocuments {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	async fn upsert(&self, doc: Doc<'_>) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO documents (kind, id, room, version, created_at, body) VALUES (?, ?, ?, ?, ?, ?) \
					ON CONFLICT(kind, id) DO UPDATE SET room = excluded.room, version = excluded.version, body = excluded.body",
				)
				.bind(doc.kind)
				.bind(&doc.id)
				.bind(doc.room)
				.bind(doc.version)
				.bind(doc.created_at)
				.bind(&doc.body)
				.execute(pool)
				.await
				.with_context(|| format!("upsert {} (sqlite)", doc.kind))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO documents (kind, id, room, version, created_at, body) VALUES ($1, $2, $3, $4, $5, $6) \
					ON CONFLICT (kind, id) DO UPDATE SET room = EXCLUDED.room, version = EXCLUDED.version, body = EXCLUDED.body",
				)
				.bind(doc.kind)
				.bind(&doc.id)
				.bind(doc.room)
				.bind(doc.version)
				.bind(doc.created_at)
				.bind(&doc.body)
				.execute(pool)
				.await
				.with_context(|| format!("upsert {} (postgres)", doc.kind))?;
			}
		}
		Ok(())
	}

	async fn insert_new(&self, doc: Doc<'_>) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"INSERT INTO documents (kind, id, room, version, created_at, body) VALUES (?, ?, ?, ?, ?, ?) \
				ON CONFLICT(kind, id) DO NOTHING",
			)
			.bind(doc.kind)
			.bind(&doc.id)
			.bind(doc.room)
			.bind(doc.version)
			.bind(doc.created_at)
			.bind(&doc.body)
			.execute(pool)
			.await
			.with_context(|| format!("insert {} (sqlite)", doc.kind))?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO documents (kind, id, room, version, created_at, body) VALUES ($1, $2, $3, $4, $5, $6) \
				ON CONFLICT (kind, id) DO NOTHING",
			)
			.bind(doc.kind)
			.bind(&doc.id)
			.bind(doc.room)
			.bind(doc.version)
			.bind(doc.created_at)
			.bind(&doc.body)
			.execute(pool)
			.await
			.with_context(|| format!("insert {} (postgres)", doc.kind))?
			.rows_affected(),
		};
		Ok(affected == 1)
	}

	async fn compare_and_swap(&self, doc: Doc<'_>, expected_version: i64) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE documents SET version = ?, body = ? WHERE kind = ? AND id = ? AND version = ?",
			)
			.bind(doc.version)
			.bind(&doc.body)
			.bind(doc.kind)
			.bind(&doc.id)
			.bind(expected_version)
			.execute(pool)
			.await
			.context("compare-and-swap (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE documents SET version = $1, body = $2 WHERE kind = $3 AND id = $4 AND version = $5",
			)
			.bind(doc.version)
			.bind(&doc.body)
			.bind(doc.kind)
			.bind(&doc.id)
			.bind(expected_version)
			.execute(pool)
			.await
			.context("compare-and-swap (postgres)")?
			.rows_affected(),
		};
		Ok(affected == 1)
	}

	async fn fetch_one<T: DeserializeOwned>(&self, kind: &'static str, id: &str) -> anyhow::Result<Option<T>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT body FROM documents WHERE kind = ? AND id = ?")
				.bind(kind)
				.bind(id)
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select {kind} (sqlite)"))?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT body FROM documents WHERE kind = $1 AND id = $2")
				.bind(kind)
				.bind(id)
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select {kind} (postgres)"))?,
		};
		row.map(|(body,)| serde_json::from_str(&body).with_context(|| format!("decode {kind} document")))
			.transpose()
	}

	async fn fetch_kind<T: DeserializeOwned>(&self, kind: &'static str) -> anyhow::Result<Vec<T>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT body FROM documents WHERE kind = ? ORDER BY created_at")
				.bind(kind)
				.fetch_all(pool)
				.await
				.with_context(|| format!("select all {kind} (sqlite)"))?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT body FROM documents WHERE kind = $1 ORDER BY created_at")
					.bind(kind)
					.fetch_all(pool)
					.await
					.with_context(|| format!("select all {kind} (postgres)"))?
			}
		};
		decode_all(kind, rows)
	}

	async fn fetch_in_room<T: DeserializeOwned>(&self, kind: &'static str, room: &RoomName) -> anyhow::Result<Vec<T>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT body FROM documents WHERE kind = ? AND room = ? ORDER BY created_at")
					.bind(kind)
					.bind(room.as_str())
					.fetch_all(pool)
					.await
					.with_context(|| format!("select {kind} by room (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT body FROM documents WHERE kind = $1 AND room = $2 ORDER BY created_at")
					.bind(kind)
					.bind(room.as_str())
					.fetch_all(pool)
					.await
					.with_context(|| format!("select {kind} by room (postgres)"))?
			}
		};
		decode_all(kind, rows)
	}

	async fn delete_doc(&self, kind: &'static str, id: &str) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM documents WHERE kind = ? AND id = ?")
				.bind(kind)
				.bind(id)
				.execute(pool)
				.await
				.with_context(|| format!("delete {kind} (sqlite)"))?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM documents WHERE kind = $1 AND id = $2")
				.bind(kind)
				.bind(id)
				.execute(pool)
				.await
				.with_context(|| format!("delete {kind} (postgres)"))?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn delete_in_room(&self, kinds: &[&'static str], room: &RoomName) -> anyhow::Result<()> {
		for kind in kinds {
			match &self.backend {
				SqlBackend::Sqlite(pool) => {
					sqlx::query("DELETE FROM documents WHERE kind = ? AND room = ?")
						.bind(*kind)
						.bind(room.as_str())
						.execute(pool)
						.await
						.with_context(|| format!("cascade delete {kind} (sqlite)"))?;
				}
				SqlBackend::Postgres(pool) => {
					sqlx::query("DELETE FROM documents WHERE kind = $1 AND room = $2")
						.bind(*kind)
						.bind(room.as_str())
						.execute(pool)
						.await
						.with_context(|| format!("cascade delete {kind} (postgres)"))?;
				}
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl DocumentStore for SqlDocuments {
	async fn room(&self, name: &RoomName) -> anyhow::Result<Option<Room>> {
		self.fetch_one(KIND_ROOM, name.as_str()).await
	}

	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool> {
		let mut doc = Doc::new(KIND_ROOM, &room.name, Some(&room.name), room.created_at, room)?;
		doc.version = room.version as i64;
		self.insert_new(doc).await
	}

	async fn replace_room(&self, room: &Room, expected_version: u64) -> anyhow::Result<bool> {
		let mut doc = Doc::new(KIND_ROOM, &room.name, Some(&room.name), room.created_at, room)?;
		doc.version = room.version as i64;
		self.compare_and_swap(doc, expected_version as i64).await
	}

	async fn delete_room(&self, name: &RoomName) -> anyhow::Result<()> {
		self.delete_in_room(&[KIND_ROLE, KIND_ENROLLMENT, KIND_PLAYLIST], name).await?;
		self.delete_doc(KIND_ROOM, name.as_str()).await?;
		Ok(())
	}

	async fn rooms(&self) -> anyhow::Result<Vec<Room>> {
		let mut rooms: Vec<Room> = self.fetch_kind(KIND_ROOM).await?;
		rooms.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(rooms)
	}

	async fn roles(&self, room: &RoomName) -> anyhow::Result<Vec<Role>> {
		let mut roles: Vec<Role> = self.fetch_in_room(KIND_ROLE, room).await?;
		roles.sort_by_key(|r| r.order);
		Ok(roles)
	}

	async fn put_role(&self, role: &Role) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_ROLE, role.id, Some(&role.room), role.created_at, role)?)
			.await
	}

	async fn delete_role(&self, room: &RoomName, role_id: Uuid) -> anyhow::Result<bool> {
		let enrollments: Vec<Enrollment> = self.fetch_in_room(KIND_ENROLLMENT, room).await?;
		for e in enrollments.iter().filter(|e| e.role_id == role_id) {
			self.delete_doc(KIND_ENROLLMENT, &e.id.to_string()).await?;
		}
		self.delete_doc(KIND_ROLE, &role_id.to_string()).await
	}

	async fn enrollments(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>> {
		let all: Vec<Enrollment> = self.fetch_in_room(KIND_ENROLLMENT, &filter.room).await?;
		Ok(all.into_iter().filter(|e| filter.matches(e)).collect())
	}

	async fn put_enrollment(&self, enrollment: &Enrollment) -> anyhow::Result<()> {
		self.upsert(Doc::new(
			KIND_ENROLLMENT,
			enrollment.id,
			Some(&enrollment.room),
			enrollment.enrolled_at,
			enrollment,
		)?)
		.await
	}

	async fn delete_enrollment(&self, id: Uuid) -> anyhow::Result<bool> {
		self.delete_doc(KIND_ENROLLMENT, &id.to_string()).await
	}

	async fn active_site_bans(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<SiteBan>> {
		let bans: Vec<SiteBan> = self.fetch_kind(KIND_SITE_BAN).await?;
		Ok(bans.into_iter().filter(|b| b.is_active(now)).collect())
	}

	async fn put_site_ban(&self, ban: &SiteBan) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_SITE_BAN, ban.id, None, ban.created_at, ban)?).await
	}

	async fn active_closure(&self, room: &RoomName, now: DateTime<Utc>) -> anyhow::Result<Option<RoomClosure>> {
		let closures: Vec<RoomClosure> = self.fetch_in_room(KIND_CLOSURE, room).await?;
		Ok(closures
			.into_iter()
			.filter(|c| c.is_active(now))
			.max_by_key(|c| c.expires_at))
	}

	async fn put_closure(&self, closure: &RoomClosure) -> anyhow::Result<()> {
		self.upsert(Doc::new(
			KIND_CLOSURE,
			closure.id,
			Some(&closure.room),
			closure.created_at,
			closure,
		)?)
		.await
	}

	async fn report(&self, id: Uuid) -> anyhow::Result<Option<Report>> {
		self.fetch_one(KIND_REPORT, &id.to_string()).await
	}

	async fn put_report(&self, report: &Report) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_REPORT, report.id, Some(&report.room), report.created_at, report)?)
			.await
	}

	async fn append_activity(&self, entry: &ModerationActivity) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_ACTIVITY, entry.id, entry.room.as_ref(), entry.at, entry)?)
			.await
	}

	async fn activity(&self, page: Page) -> anyhow::Result<Vec<ModerationActivity>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT body FROM documents WHERE kind = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
			)
			.bind(KIND_ACTIVITY)
			.bind(page.limit as i64)
			.bind(page.offset as i64)
			.fetch_all(pool)
			.await
			.context("select activity (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT body FROM documents WHERE kind = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
			)
			.bind(KIND_ACTIVITY)
			.bind(page.limit as i64)
			.bind(page.offset as i64)
			.fetch_all(pool)
			.await
			.context("select activity (postgres)")?,
		};
		decode_all(KIND_ACTIVITY, rows)
	}

	async fn staff(&self) -> anyhow::Result<Vec<Staff>> {
		self.fetch_kind(KIND_STAFF).await
	}

	async fn put_staff(&self, staff: &Staff) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_STAFF, &staff.user_id, None, Utc::now(), staff)?)
			.await
	}

	async fn push_playlist_item(&self, item: &PlaylistItem) -> anyhow::Result<()> {
		self.upsert(Doc::new(KIND_PLAYLIST, item.id, Some(&item.room), item.added_at, item)?)
			.await
	}

	async fn playlist(&self, room: &RoomName) -> anyhow::Result<Vec<PlaylistItem>> {
		self.fetch_in_room(KIND_PLAYLIST, room).await
	}
}

#[cfg(test)]
mod tests {
	use roomcast_domain::{BanLookup, EnrollmentSubject, Identity, Permissions, Restrictions, RoleTag, UserId};

	use super::*;

	fn room_name(s: &str) -> RoomName {
		RoomName::new(s).unwrap()
	}

	#[tokio::test]
	async fn replace_room_rejects_stale_version() {
		let docs = MemoryDocuments::new();
		let mut room = Room::new(room_name("foo"));
		assert!(docs.insert_room(&room).await.unwrap());
		assert!(!docs.insert_room(&room).await.unwrap());

		let stale = room.clone();
		room.version = 1;
		assert!(docs.replace_room(&room, 0).await.unwrap());

		let mut stale = stale;
		stale.version = 1;
		assert!(!docs.replace_room(&stale, 0).await.unwrap());
	}

	#[tokio::test]
	async fn deleting_a_room_cascades_scoped_records() {
		let docs = MemoryDocuments::new();
		let foo = room_name("foo");
		let bar = room_name("bar");
		docs.insert_room(&Room::new(foo.clone())).await.unwrap();

		for room in [&foo, &bar] {
			let role = Role::new(room.clone(), "DJ", RoleTag::new("dj").unwrap(), 1, Permissions::none());
			docs.put_role(&role).await.unwrap();
			docs.put_enrollment(&Enrollment {
				id: Uuid::new_v4(),
				room: room.clone(),
				role_id: role.id,
				subject: roomcast_domain::EnrollmentSubject::User {
					user_id: UserId::new("u1").unwrap(),
				},
				enrolled_by: None,
				enrolled_at: Utc::now(),
			})
			.await
			.unwrap();
		}

		docs.delete_room(&foo).await.unwrap();

		assert!(docs.room(&foo).await.unwrap().is_none());
		assert!(docs.roles(&foo).await.unwrap().is_empty());
		assert_eq!(docs.roles(&bar).await.unwrap().len(), 1);

		let user = Identity::user(UserId::new("u1").unwrap(), "", "");
		let foo_filter = EnrollmentFilter::for_identity(foo, &user).unwrap();
		let bar_filter = EnrollmentFilter::for_identity(bar, &user).unwrap();
		assert!(docs.enrollments(&foo_filter).await.unwrap().is_empty());
		assert_eq!(docs.enrollments(&bar_filter).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn activity_is_newest_first_and_paged() {
		let docs = MemoryDocuments::new();
		for i in 0..5 {
			docs.append_activity(&ModerationActivity::new("mod", format!("action-{i}")))
				.await
				.unwrap();
		}

		let page = docs.activity(Page::new(1, 2)).await.unwrap();
		let actions: Vec<_> = page.iter().map(|a| a.action.as_str()).collect();
		assert_eq!(actions, vec!["action-3", "action-2"]);
	}

	async fn sqlite() -> (tempfile::TempDir, SqlDocuments) {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("roomcast.db").display());
		let docs = SqlDocuments::connect(&url).await.unwrap();
		(dir, docs)
	}

	fn enrollment(room: &RoomName, role_id: Uuid, identity: &Identity) -> Enrollment {
		Enrollment {
			id: Uuid::new_v4(),
			room: room.clone(),
			role_id,
			subject: EnrollmentSubject::for_identity(identity),
			enrolled_by: None,
			enrolled_at: Utc::now(),
		}
	}

	#[tokio::test]
	async fn sqlite_replace_room_rejects_stale_version() {
		let (_dir, docs) = sqlite().await;
		let mut room = Room::new(room_name("foo"));
		assert!(docs.insert_room(&room).await.unwrap());
		assert!(!docs.insert_room(&room).await.unwrap());

		let mut stale = room.clone();
		room.version = 1;
		room.owner = Some(UserId::new("u1").unwrap());
		assert!(docs.replace_room(&room, 0).await.unwrap());

		stale.version = 1;
		assert!(!docs.replace_room(&stale, 0).await.unwrap());

		let stored = docs.room(&room_name("foo")).await.unwrap().unwrap();
		assert_eq!(stored.version, 1);
		assert_eq!(stored.owner, room.owner);
	}

	#[tokio::test]
	async fn sqlite_enrollments_match_only_their_subject() {
		let (_dir, docs) = sqlite().await;
		let foo = room_name("foo");
		let role = Role::new(foo.clone(), "DJ", RoleTag::new("dj").unwrap(), 1, Permissions::none());
		docs.put_role(&role).await.unwrap();

		let alice = Identity::user(UserId::new("alice").unwrap(), "10.0.0.1", "s1");
		let guest = Identity::anonymous("10.0.0.2", "s2");
		let other_guest = Identity::anonymous("10.0.0.2", "s3");
		docs.put_enrollment(&enrollment(&foo, role.id, &alice)).await.unwrap();
		docs.put_enrollment(&enrollment(&foo, role.id, &guest)).await.unwrap();

		let found = |identity: &Identity| EnrollmentFilter::for_identity(foo.clone(), identity).unwrap();
		assert_eq!(docs.enrollments(&found(&alice)).await.unwrap().len(), 1);
		assert_eq!(docs.enrollments(&found(&guest)).await.unwrap().len(), 1);
		assert!(docs.enrollments(&found(&other_guest)).await.unwrap().is_empty());

		let in_bar = EnrollmentFilter::for_identity(room_name("bar"), &alice).unwrap();
		assert!(docs.enrollments(&in_bar).await.unwrap().is_empty());

		assert!(docs.delete_role(&foo, role.id).await.unwrap());
		assert!(docs.enrollments(&found(&alice)).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn sqlite_bans_and_closures_expire() {
		let (_dir, docs) = sqlite().await;
		let now = Utc::now();
		let foo = room_name("foo");

		docs.put_site_ban(&SiteBan {
			id: Uuid::new_v4(),
			keys: BanLookup {
				ip: Some("10.0.0.9".to_string()),
				..BanLookup::default()
			},
			restrictions: Restrictions {
				broadcast: false,
				join: true,
			},
			reason: Some("spam".to_string()),
			created_by: None,
			created_at: now,
			expires_at: now + chrono::Duration::hours(1),
		})
		.await
		.unwrap();
		docs.put_closure(&RoomClosure {
			id: Uuid::new_v4(),
			room: foo.clone(),
			reason: "raid".to_string(),
			duration_hours: 2,
			affected: Vec::new(),
			closed_by: None,
			created_at: now,
			expires_at: now + chrono::Duration::hours(2),
		})
		.await
		.unwrap();

		let bans = docs.active_site_bans(now).await.unwrap();
		assert_eq!(bans.len(), 1);
		assert_eq!(bans[0].keys.ip.as_deref(), Some("10.0.0.9"));
		assert!(docs.active_site_bans(now + chrono::Duration::hours(2)).await.unwrap().is_empty());

		let closure = docs.active_closure(&foo, now).await.unwrap().unwrap();
		assert_eq!(closure.reason, "raid");
		assert!(docs.active_closure(&room_name("bar"), now).await.unwrap().is_none());
		assert!(
			docs.active_closure(&foo, now + chrono::Duration::hours(3))
				.await
				.unwrap()
				.is_none()
		);
	}

	#[tokio::test]
	async fn sqlite_deleting_a_room_cascades_scoped_records() {
		let (_dir, docs) = sqlite().await;
		let foo = room_name("foo");
		let bar = room_name("bar");
		let alice = Identity::user(UserId::new("alice").unwrap(), "", "");
		let now = Utc::now();

		for room in [&foo, &bar] {
			docs.insert_room(&Room::new(room.clone())).await.unwrap();
			let role = Role::new(room.clone(), "DJ", RoleTag::new("dj").unwrap(), 1, Permissions::none());
			docs.put_role(&role).await.unwrap();
			docs.put_enrollment(&enrollment(room, role.id, &alice)).await.unwrap();
			docs.push_playlist_item(&PlaylistItem {
				id: Uuid::new_v4(),
				room: room.clone(),
				url: "https://example.org/a.mp4".to_string(),
				title: None,
				added_by: "alice".to_string(),
				added_at: now,
			})
			.await
			.unwrap();
		}
		docs.put_closure(&RoomClosure {
			id: Uuid::new_v4(),
			room: foo.clone(),
			reason: "raid".to_string(),
			duration_hours: 1,
			affected: Vec::new(),
			closed_by: None,
			created_at: now,
			expires_at: now + chrono::Duration::hours(1),
		})
		.await
		.unwrap();

		docs.delete_room(&foo).await.unwrap();

		assert!(docs.room(&foo).await.unwrap().is_none());
		assert!(docs.roles(&foo).await.unwrap().is_empty());
		assert!(docs.playlist(&foo).await.unwrap().is_empty());
		let foo_filter = EnrollmentFilter::for_identity(foo.clone(), &alice).unwrap();
		assert!(docs.enrollments(&foo_filter).await.unwrap().is_empty());
		// Closures outlive the room so it stays closed.
		assert!(docs.active_closure(&foo, now).await.unwrap().is_some());

		assert!(docs.room(&bar).await.unwrap().is_some());
		assert_eq!(docs.roles(&bar).await.unwrap().len(), 1);
		assert_eq!(docs.playlist(&bar).await.unwrap().len(), 1);
		let bar_filter = EnrollmentFilter::for_identity(bar, &alice).unwrap();
		assert_eq!(docs.enrollments(&bar_filter).await.unwrap().len(), 1);
		assert_eq!(
			docs.rooms().await.unwrap().into_iter().map(|r| r.name).collect::<Vec<_>>(),
			vec![room_name("bar")]
		);
	}

	#[test]
	fn page_limit_is_clamped() {
		assert_eq!(Page::new(0, 0).limit, 1);
		assert_eq!(Page::new(0, 10_000).limit, Page::MAX_LIMIT);
	}
}

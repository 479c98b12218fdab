#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use roomcast_domain::{
	ChatLine, ConnectionId, IdentitySnapshot, ModerationActivity, Report, ReportOutcome, Resolution, Staff,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::flood::{FixedWindowCounter, WindowOutcome};
use crate::server::presence::PresenceManager;
use crate::server::rooms::RoomDirectory;
use crate::server::work_queue::WorkQueue;

pub const MAX_REASON_LEN: usize = 500;
pub const MAX_CONTEXT_LINES: usize = 50;
pub const MAX_EVIDENCE_BYTES: usize = 5 * 1024 * 1024;

/// Where evidence images end up. Returns a reference stored on the report.
#[async_trait::async_trait]
pub trait EvidenceStore: Send + Sync {
	async fn put(&self, bytes: &[u8], extension: &str) -> anyhow::Result<String>;
}

/// Content-addressed files under one directory.
#[derive(Debug, Clone)]
pub struct FsEvidenceStore {
	dir: PathBuf,
}

impl FsEvidenceStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}
}

#[async_trait::async_trait]
impl EvidenceStore for FsEvidenceStore {
	async fn put(&self, bytes: &[u8], extension: &str) -> anyhow::Result<String> {
		let name = format!("{}.{extension}", hex::encode(Sha256::digest(bytes)));
		tokio::fs::create_dir_all(&self.dir)
			.await
			.with_context(|| format!("create {}", self.dir.display()))?;
		let path = self.dir.join(&name);
		tokio::fs::write(&path, bytes)
			.await
			.with_context(|| format!("write {}", path.display()))?;
		Ok(name)
	}
}

/// Image type by magic bytes.
fn image_extension(bytes: &[u8]) -> Option<&'static str> {
	if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
		Some("png")
	} else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
		Some("jpg")
	} else {
		None
	}
}

/// One staff member to tell about one report.
#[derive(Debug, Clone)]
pub struct StaffNotice {
	pub staff: Staff,
	pub report_id: Uuid,
	pub room: String,
	pub reason: String,
}

#[async_trait::async_trait]
pub trait StaffNotifier: Send + Sync {
	async fn notify(&self, notice: &StaffNotice) -> anyhow::Result<()>;
}

/// Writes notices to the log. Used when no mail or push channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl StaffNotifier for LogNotifier {
	async fn notify(&self, notice: &StaffNotice) -> anyhow::Result<()> {
		info!(
			staff = %notice.staff.username,
			report_id = %notice.report_id,
			room = %notice.room,
			reason = %notice.reason,
			"new report"
		);
		Ok(())
	}
}

/// Report intake and resolution.
#[derive(Clone)]
pub struct ReportService {
	rooms: RoomDirectory,
	presence: PresenceManager,
	limiter: FixedWindowCounter,
	evidence: Arc<dyn EvidenceStore>,
	notices: Arc<WorkQueue<StaffNotice>>,
}

impl ReportService {
	pub fn new(
		rooms: RoomDirectory,
		presence: PresenceManager,
		limiter: FixedWindowCounter,
		evidence: Arc<dyn EvidenceStore>,
		notifier: Arc<dyn StaffNotifier>,
		notify_concurrency: usize,
	) -> Self {
		let notices = WorkQueue::new(notify_concurrency, move |notice: StaffNotice| {
			let notifier = notifier.clone();
			async move { notifier.notify(&notice).await }
		});
		Self {
			rooms,
			presence,
			limiter,
			evidence,
			notices: Arc::new(notices),
		}
	}

	/// The notification queue, for callers that need to wait on fan-out.
	pub fn notices(&self) -> &WorkQueue<StaffNotice> {
		&self.notices
	}

	/// File a report against another participant of the reporter's room.
	pub async fn file_report(
		&self,
		conn: &ConnectionId,
		target: &ConnectionId,
		reason: &str,
		mut chat_context: Vec<ChatLine>,
		evidence: Option<Vec<u8>>,
	) -> EngineResult<Report> {
		let reason = reason.trim();
		if reason.is_empty() || reason.chars().count() > MAX_REASON_LEN {
			return Err(EngineError::validation(format!("reason must be 1-{MAX_REASON_LEN} characters")));
		}
		if target == conn {
			return Err(EngineError::validation("you cannot report yourself"));
		}

		let actor = self.presence.actor(conn).await?;
		let (room, me) = self.presence.actor_participant(&actor).await?;
		let victim = room
			.participant(target)
			.ok_or_else(|| EngineError::not_found(format!("participant {target}")))?;

		let evidence = match evidence.filter(|b| !b.is_empty()) {
			None => None,
			Some(bytes) => {
				if bytes.len() > MAX_EVIDENCE_BYTES {
					return Err(EngineError::validation("evidence image is too large"));
				}
				let ext = image_extension(&bytes)
					.ok_or_else(|| EngineError::validation("evidence must be a png or jpeg image"))?;
				Some((bytes, ext))
			}
		};

		// Only well-formed reports count against the limit.
		match self
			.limiter
			.hit(&actor.identity.to_string())
			.await
			.or_internal("report limiter")?
		{
			WindowOutcome::Allowed { .. } => {}
			WindowOutcome::Exceeded { retry_after } => {
				debug!(identity = %actor.identity, "report limit reached");
				return Err(EngineError::Limit { remaining: retry_after });
			}
		}

		let evidence = match evidence {
			Some((bytes, ext)) => Some(self.evidence.put(&bytes, ext).await.or_internal("store evidence")?),
			None => None,
		};

		let start = chat_context.len().saturating_sub(MAX_CONTEXT_LINES);
		chat_context.drain(..start);

		let report = Report {
			id: Uuid::new_v4(),
			room: actor.room.clone(),
			reporter: IdentitySnapshot::from(&me),
			target: IdentitySnapshot::from(victim),
			reason: reason.to_string(),
			chat_context,
			evidence,
			created_at: Utc::now(),
			resolution: None,
		};
		let docs = self.rooms.docs();
		docs.put_report(&report).await.or_internal("save report")?;

		let staff = docs.staff().await.or_internal("load staff")?;
		let mut notified = 0usize;
		for s in staff.into_iter().filter(|s| s.notify_reports) {
			self.notices.enqueue(StaffNotice {
				staff: s,
				report_id: report.id,
				room: report.room.to_string(),
				reason: report.reason.clone(),
			});
			notified += 1;
		}

		info!(report_id = %report.id, room = %report.room, notified, "report filed");
		metrics::counter!("roomcast_server_reports_total").increment(1);
		Ok(report)
	}

	/// Resolve a report on behalf of a connected staff member.
	pub async fn resolve(&self, conn: &ConnectionId, report_id: Uuid, outcome: ReportOutcome) -> EngineResult<Report> {
		let actor = self.presence.actor(conn).await?;
		let (_, me) = self.presence.actor_participant(&actor).await?;
		if !me.is_staff() {
			return Err(EngineError::forbidden("resolve reports"));
		}
		self.resolve_as(&actor.label(), report_id, outcome).await
	}

	pub async fn resolve_as(&self, by: &str, report_id: Uuid, outcome: ReportOutcome) -> EngineResult<Report> {
		let docs = self.rooms.docs();
		let mut report = docs
			.report(report_id)
			.await
			.or_internal("load report")?
			.ok_or_else(|| EngineError::not_found(format!("report {report_id}")))?;

		report.resolution = Some(Resolution {
			outcome,
			resolved_by: by.to_string(),
			resolved_at: Utc::now(),
		});
		docs.put_report(&report).await.or_internal("save report")?;

		self.rooms
			.record_activity(
				ModerationActivity::new(by, "resolve report")
					.in_room(&report.room)
					.target(report.target.handle.clone())
					.detail(outcome.as_str()),
			)
			.await;
		Ok(report)
	}
}

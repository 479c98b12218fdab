#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::flood::{FixedWindowCounter, FloodGovernor, WindowLimit};
use crate::server::hub::{BroadcastPort, ConnectionHub, HubConfig};
use crate::server::moderation::{ModerationService, ModerationSettings};
use crate::server::permissions::PermissionResolver;
use crate::server::presence::PresenceManager;
use crate::server::relay::{RelayControl, RelayNode, RelaySelector};
use crate::server::reports::{EvidenceStore, ReportService, StaffNotifier};
use crate::server::rooms::RoomDirectory;
use crate::server::session_cache::{SessionCache, SessionSettings};
use crate::server::store::{DocumentStore, KvStore};

#[derive(Debug, Clone)]
pub struct EngineSettings {
	pub session: SessionSettings,
	pub flood: WindowLimit,
	pub reports: WindowLimit,
	pub moderation: ModerationSettings,
	pub relay_nodes: Vec<RelayNode>,
	pub notify_concurrency: usize,
	pub hub: HubConfig,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			session: SessionSettings::default(),
			flood: WindowLimit::flood_default(),
			reports: WindowLimit::reports_default(),
			moderation: ModerationSettings::default(),
			relay_nodes: Vec::new(),
			notify_concurrency: 4,
			hub: HubConfig::default(),
		}
	}
}

/// External seams the engine is built over.
pub struct EngineBackends {
	pub docs: Arc<dyn DocumentStore>,
	pub kv: Arc<dyn KvStore>,
	pub relay: Arc<dyn RelayControl>,
	pub evidence: Arc<dyn EvidenceStore>,
	pub notifier: Arc<dyn StaffNotifier>,
}

/// Every coordination service, wired once at startup and shared by all connections.
#[derive(Clone)]
pub struct Engine {
	pub hub: ConnectionHub,
	pub rooms: RoomDirectory,
	pub perms: PermissionResolver,
	pub sessions: SessionCache,
	pub presence: PresenceManager,
	pub moderation: ModerationService,
	pub reports: ReportService,
}

impl Engine {
	pub fn new(settings: EngineSettings, backends: EngineBackends) -> Self {
		let EngineBackends {
			docs,
			kv,
			relay,
			evidence,
			notifier,
		} = backends;

		let hub = ConnectionHub::new(settings.hub);
		let port: Arc<dyn BroadcastPort> = Arc::new(hub.clone());

		let rooms = RoomDirectory::new(docs.clone());
		let perms = PermissionResolver::new(rooms.clone());
		let sessions = SessionCache::new(kv.clone(), settings.session);
		let flood = FloodGovernor::new(kv.clone(), settings.flood);
		let relay = RelaySelector::new(settings.relay_nodes, relay, docs);

		let presence = PresenceManager::new(
			rooms.clone(),
			perms.clone(),
			sessions.clone(),
			flood,
			relay,
			port.clone(),
		);
		let moderation = ModerationService::new(
			rooms.clone(),
			perms.clone(),
			presence.clone(),
			port,
			settings.moderation,
		);
		let reports = ReportService::new(
			rooms.clone(),
			presence.clone(),
			FixedWindowCounter::new(kv, "report", settings.reports),
			evidence,
			notifier,
			settings.notify_concurrency,
		);

		Self {
			hub,
			rooms,
			perms,
			sessions,
			presence,
			moderation,
			reports,
		}
	}
}

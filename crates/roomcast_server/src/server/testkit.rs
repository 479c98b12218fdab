#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use roomcast_domain::{ConnectionId, Identity, RoomName, UserId};
use roomcast_protocol::pb::server_envelope::Event;

use crate::server::engine::{Engine, EngineBackends, EngineSettings};
use crate::server::errors::EngineResult;
use crate::server::hub::{HubItem, HubSubscription};
use crate::server::presence::{JoinOutcome, JoinRequest};
use crate::server::relay::RelayNode;
use crate::server::relay::testing::FakeRelay;
use crate::server::reports::{EvidenceStore, StaffNotice, StaffNotifier};
use crate::server::store::{MemoryDocuments, MemoryKv};

#[derive(Default)]
pub struct MemoryEvidence {
	pub stored: Mutex<Vec<(String, usize)>>,
}

#[async_trait::async_trait]
impl EvidenceStore for MemoryEvidence {
	async fn put(&self, bytes: &[u8], extension: &str) -> anyhow::Result<String> {
		let mut stored = self.stored.lock();
		let name = format!("ev-{}.{extension}", stored.len());
		stored.push((name.clone(), bytes.len()));
		Ok(name)
	}
}

#[derive(Default)]
pub struct RecordingNotifier {
	pub notices: Mutex<Vec<StaffNotice>>,
}

#[async_trait::async_trait]
impl StaffNotifier for RecordingNotifier {
	async fn notify(&self, notice: &StaffNotice) -> anyhow::Result<()> {
		self.notices.lock().push(notice.clone());
		Ok(())
	}
}

pub struct Harness {
	pub engine: Engine,
	pub docs: Arc<MemoryDocuments>,
	pub relay: Arc<FakeRelay>,
	pub evidence: Arc<MemoryEvidence>,
	pub notifier: Arc<RecordingNotifier>,
}

pub fn nodes() -> Vec<RelayNode> {
	vec![
		RelayNode {
			id: "a".to_string(),
			url: "http://relay-a".to_string(),
		},
		RelayNode {
			id: "b".to_string(),
			url: "http://relay-b".to_string(),
		},
	]
}

pub fn harness() -> Harness {
	harness_with(EngineSettings {
		relay_nodes: nodes(),
		..EngineSettings::default()
	})
}

pub fn harness_with(settings: EngineSettings) -> Harness {
	let docs = Arc::new(MemoryDocuments::new());
	let relay = Arc::new(FakeRelay::default());
	let evidence = Arc::new(MemoryEvidence::default());
	let notifier = Arc::new(RecordingNotifier::default());
	let engine = Engine::new(
		settings,
		EngineBackends {
			docs: docs.clone(),
			kv: Arc::new(MemoryKv::new()),
			relay: relay.clone(),
			evidence: evidence.clone(),
			notifier: notifier.clone(),
		},
	);
	Harness {
		engine,
		docs,
		relay,
		evidence,
		notifier,
	}
}

pub fn room(name: &str) -> RoomName {
	RoomName::new(name).unwrap()
}

pub fn conn(id: &str) -> ConnectionId {
	ConnectionId::new(id).unwrap()
}

pub fn user(id: &str) -> UserId {
	UserId::new(id).unwrap()
}

/// Anonymous identity unique to the connection name.
pub fn anon(conn: &str) -> Identity {
	Identity::anonymous(format!("ip-{conn}"), format!("sess-{conn}"))
}

/// A connection registered with the hub, so it receives events.
pub struct Client {
	pub conn: ConnectionId,
	pub identity: Identity,
	pub sub: HubSubscription,
}

impl Client {
	/// Every event queued so far, skipping lag markers.
	pub fn drain(&mut self) -> Vec<Event> {
		let mut out = Vec::new();
		while let Ok(item) = self.sub.events.try_recv() {
			if let HubItem::Event(ev) = item {
				out.push(*ev);
			}
		}
		out
	}

	pub fn closed_with(&mut self) -> Option<String> {
		self.sub.close.try_recv().ok()
	}
}

impl Harness {
	pub async fn client(&self, id: &str, identity: Identity) -> Client {
		let conn = conn(id);
		let sub = self.engine.hub.register(&conn).await;
		Client { conn, identity, sub }
	}

	pub async fn anon_client(&self, id: &str) -> Client {
		self.client(id, anon(id)).await
	}

	pub async fn user_client(&self, id: &str, user_id: &str) -> Client {
		self.client(id, Identity::user(user(user_id), format!("ip-{id}"), format!("sess-{id}")))
			.await
	}

	pub fn request(&self, client: &Client, room_name: &str, handle: &str) -> JoinRequest {
		JoinRequest {
			room: room(room_name),
			conn: client.conn.clone(),
			identity: client.identity.clone(),
			handle: handle.to_string(),
			color: "#fff".to_string(),
			password: None,
			list_id: None,
			is_admin: false,
			is_site_mod: false,
			resume_from: None,
		}
	}

	pub async fn join(&self, client: &Client, room_name: &str, handle: &str) -> EngineResult<JoinOutcome> {
		self.engine.presence.join(self.request(client, room_name, handle)).await
	}

	pub async fn join_staff(&self, client: &Client, room_name: &str, handle: &str) -> EngineResult<JoinOutcome> {
		let mut req = self.request(client, room_name, handle);
		req.is_admin = true;
		self.engine.presence.join(req).await
	}

	pub async fn participants(&self, room_name: &str) -> Vec<String> {
		match self.engine.rooms.find(&room(room_name)).await.unwrap() {
			Some(r) => r.participants.iter().map(|p| p.handle.clone()).collect(),
			None => Vec::new(),
		}
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use roomcast_domain::{RelayAttachment, Room};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::server::errors::{EngineResult, OrInternal};
use crate::server::store::DocumentStore;

/// A media relay the engine may attach rooms to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
	pub id: String,
	pub url: String,
}

/// Occupancy of one relay node across its non-empty rooms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeLoad {
	pub rooms: u64,
	pub total: u64,
}

impl NodeLoad {
	pub fn average(&self) -> f64 {
		if self.rooms == 0 {
			0.0
		} else {
			self.total as f64 / self.rooms as f64
		}
	}

	pub fn score(&self) -> f64 {
		load_score(self.average(), self.total as f64)
	}
}

/// Approximate peer-connection load: `average * total² − total`.
pub fn load_score(average: f64, total: f64) -> f64 {
	average * total * total - total
}

/// Index of the lowest score; the earliest index wins ties.
pub fn pick_least_loaded(scores: &[f64]) -> Option<usize> {
	let mut best: Option<(usize, f64)> = None;
	for (idx, &score) in scores.iter().enumerate() {
		match best {
			Some((_, b)) if score >= b => {}
			_ => best = Some((idx, score)),
		}
	}
	best.map(|(idx, _)| idx)
}

/// Per-node load in declared node order. Rooms without participants are not counted.
pub fn aggregate_loads(rooms: &[Room], nodes: &[RelayNode]) -> Vec<NodeLoad> {
	let mut loads = vec![NodeLoad::default(); nodes.len()];
	for room in rooms.iter().filter(|r| !r.participants.is_empty()) {
		let Some(attachment) = &room.relay else {
			continue;
		};
		if let Some(idx) = nodes.iter().position(|n| n.id == attachment.node_id) {
			loads[idx].rooms += 1;
			loads[idx].total += room.participants.len() as u64;
		}
	}
	loads
}

/// Control-plane calls against a relay node.
#[async_trait::async_trait]
pub trait RelayControl: Send + Sync {
	/// Returns the relay-assigned room id.
	async fn create_room(&self, node: &RelayNode) -> anyhow::Result<String>;

	async fn destroy_room(&self, node: &RelayNode, relay_room_id: &str) -> anyhow::Result<()>;

	/// Returns the relay-assigned session id.
	async fn create_session(&self, node: &RelayNode, relay_room_id: &str) -> anyhow::Result<String>;

	async fn destroy_session(&self, node: &RelayNode, relay_room_id: &str, session_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
	id: String,
}

/// JSON-over-HTTP relay control.
#[derive(Debug, Clone, Default)]
pub struct HttpRelayControl {
	client: reqwest::Client,
}

impl HttpRelayControl {
	pub fn new() -> Self {
		Self::default()
	}

	fn url(node: &RelayNode, path: &str) -> String {
		format!("{}/{}", node.url.trim_end_matches('/'), path)
	}
}

#[async_trait::async_trait]
impl RelayControl for HttpRelayControl {
	async fn create_room(&self, node: &RelayNode) -> anyhow::Result<String> {
		let resp = self
			.client
			.post(Self::url(node, "rooms"))
			.send()
			.await
			.with_context(|| format!("relay {} create room", node.id))?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => {
				let body: CreatedResponse = resp.json().await.context("relay create room body")?;
				Ok(body.id)
			}
			status => Err(anyhow!("relay {} create room failed: status={}", node.id, status)),
		}
	}

	async fn destroy_room(&self, node: &RelayNode, relay_room_id: &str) -> anyhow::Result<()> {
		let resp = self
			.client
			.delete(Self::url(node, &format!("rooms/{relay_room_id}")))
			.send()
			.await
			.with_context(|| format!("relay {} destroy room", node.id))?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
			status => Err(anyhow!("relay {} destroy room failed: status={}", node.id, status)),
		}
	}

	async fn create_session(&self, node: &RelayNode, relay_room_id: &str) -> anyhow::Result<String> {
		let resp = self
			.client
			.post(Self::url(node, &format!("rooms/{relay_room_id}/sessions")))
			.send()
			.await
			.with_context(|| format!("relay {} create session", node.id))?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => {
				let body: CreatedResponse = resp.json().await.context("relay create session body")?;
				Ok(body.id)
			}
			status => Err(anyhow!("relay {} create session failed: status={}", node.id, status)),
		}
	}

	async fn destroy_session(&self, node: &RelayNode, relay_room_id: &str, session_id: &str) -> anyhow::Result<()> {
		let resp = self
			.client
			.delete(Self::url(node, &format!("rooms/{relay_room_id}/sessions/{session_id}")))
			.send()
			.await
			.with_context(|| format!("relay {} destroy session", node.id))?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
			status => Err(anyhow!("relay {} destroy session failed: status={}", node.id, status)),
		}
	}
}

/// Chooses relay nodes for new rooms and proxies relay control calls.
#[derive(Clone)]
pub struct RelaySelector {
	nodes: Vec<RelayNode>,
	control: Arc<dyn RelayControl>,
	docs: Arc<dyn DocumentStore>,
}

impl RelaySelector {
	pub fn new(nodes: Vec<RelayNode>, control: Arc<dyn RelayControl>, docs: Arc<dyn DocumentStore>) -> Self {
		Self { nodes, control, docs }
	}

	pub fn nodes(&self) -> &[RelayNode] {
		&self.nodes
	}

	fn node(&self, id: &str) -> Option<&RelayNode> {
		self.nodes.iter().find(|n| n.id == id)
	}

	/// Least-loaded node given the current room documents.
	pub async fn select_node(&self) -> EngineResult<Option<&RelayNode>> {
		if self.nodes.is_empty() {
			return Ok(None);
		}
		let rooms = self.docs.rooms().await.or_internal("list rooms for relay selection")?;
		let scores: Vec<f64> = aggregate_loads(&rooms, &self.nodes).iter().map(NodeLoad::score).collect();
		Ok(pick_least_loaded(&scores).and_then(|idx| self.nodes.get(idx)))
	}

	/// Pick a node and create a relay room on it. `None` when no relay nodes are configured.
	pub async fn attach_new_room(&self) -> EngineResult<Option<RelayAttachment>> {
		let Some(node) = self.select_node().await? else {
			return Ok(None);
		};
		let relay_room_id = self.control.create_room(node).await.or_internal("relay create room")?;
		info!(node = %node.id, relay_room_id = %relay_room_id, "relay room attached");
		Ok(Some(RelayAttachment {
			node_id: node.id.clone(),
			relay_room_id,
		}))
	}

	/// Destroy the relay room. Failures are logged and never block cleanup.
	pub async fn release(&self, attachment: &RelayAttachment) {
		let Some(node) = self.node(&attachment.node_id) else {
			warn!(node = %attachment.node_id, "release on unknown relay node");
			return;
		};
		if let Err(err) = self.control.destroy_room(node, &attachment.relay_room_id).await {
			warn!(error = ?err, node = %node.id, relay_room_id = %attachment.relay_room_id, "relay room teardown failed");
			metrics::counter!("roomcast_server_relay_errors_total", "op" => "destroy_room").increment(1);
		}
	}

	pub async fn open_session(&self, attachment: &RelayAttachment) -> EngineResult<String> {
		let node = self
			.node(&attachment.node_id)
			.ok_or_else(|| anyhow!("unknown relay node {}", attachment.node_id))
			.or_internal("relay lookup")?;
		self.control
			.create_session(node, &attachment.relay_room_id)
			.await
			.or_internal("relay create session")
	}

	/// Best-effort session teardown.
	pub async fn close_session(&self, attachment: &RelayAttachment, session_id: &str) {
		let Some(node) = self.node(&attachment.node_id) else {
			return;
		};
		if let Err(err) = self
			.control
			.destroy_session(node, &attachment.relay_room_id, session_id)
			.await
		{
			warn!(error = ?err, node = %node.id, session_id, "relay session teardown failed");
			metrics::counter!("roomcast_server_relay_errors_total", "op" => "destroy_session").increment(1);
		}
	}
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roomcast_domain::{ConnectionId, RoomName};
use roomcast_protocol::pb::server_envelope::Event;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

/// Outbound side of the engine: who gets told about what.
///
/// Delivery is best-effort. Sending to, or disconnecting, a connection that is already gone is a no-op.
#[async_trait::async_trait]
pub trait BroadcastPort: Send + Sync {
	async fn to_connection(&self, conn: &ConnectionId, event: Event);

	async fn to_room(&self, room: &RoomName, event: Event, except: Option<&ConnectionId>);

	async fn attach(&self, conn: &ConnectionId, room: &RoomName);

	async fn detach(&self, conn: &ConnectionId, room: &RoomName);

	/// Rooms the connection is attached to.
	async fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomName>;

	/// Ask the transport to close the connection.
	async fn disconnect(&self, conn: &ConnectionId, reason: &str);
}

/// Items emitted on a connection's outbound stream.
#[derive(Debug, Clone)]
pub enum HubItem {
	Event(Box<Event>),

	/// The connection's queue was full and items were dropped.
	Lagged { dropped: u64 },
}

/// Receiving ends handed to the connection task on registration.
#[derive(Debug)]
pub struct HubSubscription {
	pub events: mpsc::Receiver<HubItem>,

	/// Fires with a reason when the engine forces the connection closed.
	pub close: oneshot::Receiver<String>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued events per connection.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// In-process [`BroadcastPort`] over per-connection bounded queues.
#[derive(Debug, Clone)]
pub struct ConnectionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

#[derive(Debug, Default)]
struct Inner {
	connections: HashMap<ConnectionId, ConnEntry>,
	rooms: HashMap<RoomName, HashSet<ConnectionId>>,
}

#[derive(Debug)]
struct ConnEntry {
	tx: mpsc::Sender<HubItem>,
	close: Option<oneshot::Sender<String>>,
	pending_lag: u64,
	rooms: HashSet<RoomName>,
}

impl ConnEntry {
	/// Queue an item, emitting a lag marker first if earlier items were dropped.
	fn push(&mut self, item: HubItem) -> bool {
		if self.pending_lag > 0
			&& self
				.tx
				.try_send(HubItem::Lagged {
					dropped: self.pending_lag,
				})
				.is_ok()
		{
			self.pending_lag = 0;
		}

		match self.tx.try_send(item) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.pending_lag = self.pending_lag.saturating_add(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

impl Inner {
	fn remove_connection(&mut self, conn: &ConnectionId) -> Option<ConnEntry> {
		let entry = self.connections.remove(conn)?;
		for room in &entry.rooms {
			if let Some(members) = self.rooms.get_mut(room) {
				members.remove(conn);
				if members.is_empty() {
					self.rooms.remove(room);
				}
			}
		}
		Some(entry)
	}
}

impl ConnectionHub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection; a second registration under the same id replaces the first.
	pub async fn register(&self, conn: &ConnectionId) -> HubSubscription {
		let (tx, events) = mpsc::channel(self.cfg.outbound_queue_capacity);
		let (close_tx, close) = oneshot::channel();

		let mut inner = self.inner.lock().await;
		inner.remove_connection(conn);
		inner.connections.insert(
			conn.clone(),
			ConnEntry {
				tx,
				close: Some(close_tx),
				pending_lag: 0,
				rooms: HashSet::new(),
			},
		);

		if self.cfg.debug_logs {
			debug!(conn_id = %conn, total = inner.connections.len(), "hub: registered");
		}

		HubSubscription { events, close }
	}

	pub async fn unregister(&self, conn: &ConnectionId) {
		let mut inner = self.inner.lock().await;
		if inner.remove_connection(conn).is_some() && self.cfg.debug_logs {
			debug!(conn_id = %conn, "hub: unregistered");
		}
	}

	pub async fn connection_count(&self) -> usize {
		self.inner.lock().await.connections.len()
	}

	/// Connections currently attached to a room.
	pub async fn room_members(&self, room: &RoomName) -> Vec<ConnectionId> {
		let inner = self.inner.lock().await;
		let mut members: Vec<ConnectionId> = inner
			.rooms
			.get(room)
			.map(|m| m.iter().cloned().collect())
			.unwrap_or_default();
		members.sort();
		members
	}
}

#[async_trait::async_trait]
impl BroadcastPort for ConnectionHub {
	async fn to_connection(&self, conn: &ConnectionId, event: Event) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.connections.get_mut(conn) {
			entry.push(HubItem::Event(Box::new(event)));
		}
	}

	async fn to_room(&self, room: &RoomName, event: Event, except: Option<&ConnectionId>) {
		let mut inner = self.inner.lock().await;
		let Inner { connections, rooms } = &mut *inner;
		let Some(members) = rooms.get(room) else {
			return;
		};

		let mut dropped: u64 = 0;
		for conn in members.iter().filter(|c| Some(*c) != except) {
			if let Some(entry) = connections.get_mut(conn)
				&& !entry.push(HubItem::Event(Box::new(event.clone())))
			{
				dropped += 1;
			}
		}

		if dropped > 0 {
			metrics::counter!("roomcast_server_hub_dropped_total").increment(dropped);
			if self.cfg.debug_logs {
				debug!(room = %room, dropped, "hub: dropped due to full connection queues");
			}
		}
	}

	async fn attach(&self, conn: &ConnectionId, room: &RoomName) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.connections.get_mut(conn) else {
			return;
		};
		entry.rooms.insert(room.clone());
		inner.rooms.entry(room.clone()).or_default().insert(conn.clone());
	}

	async fn detach(&self, conn: &ConnectionId, room: &RoomName) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.connections.get_mut(conn) {
			entry.rooms.remove(room);
		}
		if let Some(members) = inner.rooms.get_mut(room) {
			members.remove(conn);
			if members.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	async fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomName> {
		let inner = self.inner.lock().await;
		let mut rooms: Vec<RoomName> = inner
			.connections
			.get(conn)
			.map(|e| e.rooms.iter().cloned().collect())
			.unwrap_or_default();
		rooms.sort();
		rooms
	}

	async fn disconnect(&self, conn: &ConnectionId, reason: &str) {
		let mut inner = self.inner.lock().await;
		let Some(mut entry) = inner.remove_connection(conn) else {
			debug!(conn_id = %conn, "hub: disconnect for unknown connection ignored");
			return;
		};
		if let Some(close) = entry.close.take() {
			let _ = close.send(reason.to_string());
		}
		metrics::counter!("roomcast_server_forced_disconnects_total").increment(1);
	}
}

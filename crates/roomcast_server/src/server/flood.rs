#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use roomcast_domain::ConnectionId;
use tracing::debug;

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::store::KvStore;

/// Fixed-window limit: `limit` hits per `window`, then locked out for `cooldown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
	pub limit: u32,
	pub window: Duration,
	pub cooldown: Duration,
}

impl WindowLimit {
	pub fn flood_default() -> Self {
		Self {
			limit: 10,
			window: Duration::from_secs(5),
			cooldown: Duration::from_secs(60),
		}
	}

	pub fn reports_default() -> Self {
		Self {
			limit: 3,
			window: Duration::from_secs(60 * 60),
			cooldown: Duration::from_secs(60 * 60),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
	Allowed { count: u32 },
	Exceeded { retry_after: Duration },
}

/// Counter keyed by `{namespace}:{key}` in the shared KV store.
#[derive(Clone)]
pub struct FixedWindowCounter {
	kv: Arc<dyn KvStore>,
	namespace: &'static str,
	limit: WindowLimit,
}

impl FixedWindowCounter {
	pub fn new(kv: Arc<dyn KvStore>, namespace: &'static str, limit: WindowLimit) -> Self {
		Self { kv, namespace, limit }
	}

	pub fn limit(&self) -> WindowLimit {
		self.limit
	}

	/// Count one hit against `key`.
	///
	/// The first hit opens the window. A hit past the limit pushes the expiry out to the cooldown, so
	/// hammering during a lockout keeps the key locked.
	pub async fn hit(&self, key: &str) -> anyhow::Result<WindowOutcome> {
		let key = format!("{}:{key}", self.namespace);
		let count = self.kv.incr(&key).await?;

		if count == 1 || self.kv.ttl(&key).await?.is_none() {
			self.kv.expire(&key, self.limit.window).await?;
		}

		if count > i64::from(self.limit.limit) {
			self.kv.expire(&key, self.limit.cooldown).await?;
			return Ok(WindowOutcome::Exceeded {
				retry_after: self.limit.cooldown,
			});
		}

		Ok(WindowOutcome::Allowed { count: count as u32 })
	}
}

/// Per-connection gate in front of chat, handle, topic and private-message actions.
#[derive(Clone)]
pub struct FloodGovernor {
	counter: FixedWindowCounter,
}

impl FloodGovernor {
	pub fn new(kv: Arc<dyn KvStore>, limit: WindowLimit) -> Self {
		Self {
			counter: FixedWindowCounter::new(kv, "flood", limit),
		}
	}

	/// Reject the triggering action with `EngineError::Flood` once the window is exhausted.
	pub async fn check_and_increment(&self, conn: &ConnectionId) -> EngineResult<()> {
		match self.counter.hit(conn.as_str()).await.or_internal("flood counter")? {
			WindowOutcome::Allowed { .. } => Ok(()),
			WindowOutcome::Exceeded { retry_after } => {
				debug!(conn_id = %conn, "flood limit exceeded");
				metrics::counter!("roomcast_server_flood_rejections_total").increment(1);
				Err(EngineError::Flood { retry_after })
			}
		}
	}
}

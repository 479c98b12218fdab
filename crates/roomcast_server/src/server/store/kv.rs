#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// TTL-capable key-value cache holding session hashes and counters.
///
/// Keys are logically owned by one connection each; implementations must be safe for concurrent use
/// without external locking.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
	/// Replace the hash at `key` and set its TTL.
	async fn hput(&self, key: &str, fields: HashMap<String, String>, ttl: Duration) -> anyhow::Result<()>;

	async fn hgetall(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>>;

	/// Merge fields into an existing hash. Returns `false` (and writes nothing) if the key is absent.
	async fn hmerge(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<bool>;

	/// Increment a counter, creating it at 1 (without expiry) if absent.
	async fn incr(&self, key: &str) -> anyhow::Result<i64>;

	/// Set the key's TTL. Returns `false` if the key is absent.
	async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

	/// Remaining TTL; `None` for absent keys and keys without expiry.
	async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>>;

	async fn del(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
enum Value {
	Hash(HashMap<String, String>),
	Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
	value: Value,
	expires_at: Option<Instant>,
}

impl Entry {
	fn live(&self, now: Instant) -> bool {
		self.expires_at.is_none_or(|at| at > now)
	}
}

/// In-process `KvStore` with lazy expiry.
///
/// Uses `tokio::time::Instant`, so paused-clock tests can advance past TTLs.
#[derive(Debug, Default)]
pub struct MemoryKv {
	entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
	pub fn new() -> Self {
		Self::default()
	}

	fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		if entries.get(key).is_some_and(|e| !e.live(now)) {
			entries.remove(key);
		}
		f(entries.get_mut(key))
	}

	/// Drop every expired entry.
	pub fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		let before = entries.len();
		entries.retain(|_, e| e.live(now));
		before - entries.len()
	}

	/// Stored entries, expired or not.
	pub fn entry_count(&self) -> usize {
		self.entries.lock().len()
	}
}

/// Purge expired entries every `every` until the task is aborted.
///
/// Reads expire lazily; this keeps keys nobody reads again from piling up.
pub fn spawn_purge_task(kv: Arc<MemoryKv>, every: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(every);
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			let purged = kv.purge_expired();
			if purged > 0 {
				debug!(purged, remaining = kv.entry_count(), "purged expired kv entries");
			}
		}
	})
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
	async fn hput(&self, key: &str, fields: HashMap<String, String>, ttl: Duration) -> anyhow::Result<()> {
		let entry = Entry {
			value: Value::Hash(fields),
			expires_at: Some(Instant::now() + ttl),
		};
		self.entries.lock().insert(key.to_string(), entry);
		Ok(())
	}

	async fn hgetall(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
		self.with_live(key, |entry| match entry {
			None => Ok(None),
			Some(Entry {
				value: Value::Hash(h), ..
			}) => Ok(Some(h.clone())),
			Some(_) => Err(anyhow!("WRONGTYPE key {key} does not hold a hash")),
		})
	}

	async fn hmerge(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<bool> {
		self.with_live(key, |entry| match entry {
			None => Ok(false),
			Some(Entry {
				value: Value::Hash(h), ..
			}) => {
				h.extend(fields);
				Ok(true)
			}
			Some(_) => Err(anyhow!("WRONGTYPE key {key} does not hold a hash")),
		})
	}

	async fn incr(&self, key: &str) -> anyhow::Result<i64> {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		if entries.get(key).is_some_and(|e| !e.live(now)) {
			entries.remove(key);
		}
		let entry = entries.entry(key.to_string()).or_insert(Entry {
			value: Value::Counter(0),
			expires_at: None,
		});
		match &mut entry.value {
			Value::Counter(n) => {
				*n = n.saturating_add(1);
				Ok(*n)
			}
			Value::Hash(_) => Err(anyhow!("WRONGTYPE key {key} does not hold a counter")),
		}
	}

	async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
		Ok(self.with_live(key, |entry| match entry {
			None => false,
			Some(e) => {
				e.expires_at = Some(Instant::now() + ttl);
				true
			}
		}))
	}

	async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
		let now = Instant::now();
		Ok(self.with_live(key, |entry| {
			entry.and_then(|e| e.expires_at).map(|at| at.saturating_duration_since(now))
		}))
	}

	async fn del(&self, key: &str) -> anyhow::Result<bool> {
		Ok(self.entries.lock().remove(key).is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	#[tokio::test(start_paused = true)]
	async fn hash_expires_after_ttl() {
		let kv = MemoryKv::new();
		kv.hput("s", fields(&[("a", "1")]), Duration::from_secs(10)).await.unwrap();
		assert!(kv.hgetall("s").await.unwrap().is_some());

		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(kv.hgetall("s").await.unwrap().is_none());
		assert!(!kv.hmerge("s", fields(&[("b", "2")])).await.unwrap());
	}

	#[tokio::test]
	async fn merge_only_touches_existing_hashes() {
		let kv = MemoryKv::new();
		assert!(!kv.hmerge("missing", fields(&[("a", "1")])).await.unwrap());
		assert!(kv.hgetall("missing").await.unwrap().is_none());

		kv.hput("s", fields(&[("a", "1"), ("b", "1")]), Duration::from_secs(60))
			.await
			.unwrap();
		assert!(kv.hmerge("s", fields(&[("b", "2")])).await.unwrap());
		assert_eq!(kv.hgetall("s").await.unwrap().unwrap(), fields(&[("a", "1"), ("b", "2")]));
	}

	#[tokio::test(start_paused = true)]
	async fn counter_restarts_after_expiry() {
		let kv = MemoryKv::new();
		assert_eq!(kv.incr("c").await.unwrap(), 1);
		assert_eq!(kv.ttl("c").await.unwrap(), None);
		assert!(kv.expire("c", Duration::from_secs(5)).await.unwrap());
		assert_eq!(kv.incr("c").await.unwrap(), 2);

		tokio::time::advance(Duration::from_secs(6)).await;
		assert_eq!(kv.incr("c").await.unwrap(), 1);
		assert_eq!(kv.purge_expired(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn purge_drops_only_expired_entries() {
		let kv = MemoryKv::new();
		kv.hput("short", fields(&[("a", "1")]), Duration::from_secs(5)).await.unwrap();
		kv.hput("long", fields(&[("a", "1")]), Duration::from_secs(60)).await.unwrap();
		kv.incr("counter").await.unwrap();
		kv.expire("counter", Duration::from_secs(5)).await.unwrap();
		kv.incr("forever").await.unwrap();

		tokio::time::advance(Duration::from_secs(6)).await;
		assert_eq!(kv.entry_count(), 4);
		assert_eq!(kv.purge_expired(), 2);
		assert_eq!(kv.entry_count(), 2);
		assert!(kv.hgetall("long").await.unwrap().is_some());
		assert_eq!(kv.incr("forever").await.unwrap(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn purge_task_sweeps_unread_keys() {
		let kv = Arc::new(MemoryKv::new());
		kv.hput("s", fields(&[("a", "1")]), Duration::from_secs(5)).await.unwrap();
		let task = spawn_purge_task(kv.clone(), Duration::from_secs(10));

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(kv.entry_count(), 1);

		tokio::time::sleep(Duration::from_secs(11)).await;
		assert_eq!(kv.entry_count(), 0);
		task.abort();
	}

	#[tokio::test]
	async fn type_mismatch_is_an_error() {
		let kv = MemoryKv::new();
		kv.incr("c").await.unwrap();
		assert!(kv.hgetall("c").await.is_err());
	}
}

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore, broadcast};
use tracing::{debug, warn};

type Worker<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Signals emitted by a [`WorkQueue`].
#[derive(Debug, Clone)]
pub enum QueueEvent {
	/// A job returned an error or panicked. Other jobs keep running.
	Failed { job: u64, error: String },

	/// The backlog reached zero.
	Drained,
}

/// Fixed-concurrency job runner.
///
/// `enqueue` never blocks the caller; at most `concurrency` worker invocations run at once.
pub struct WorkQueue<A> {
	worker: Worker<A>,
	permits: Arc<Semaphore>,
	pending: Arc<AtomicUsize>,
	next_job: AtomicU64,
	events: broadcast::Sender<QueueEvent>,
	drained: Arc<Notify>,
}

impl<A: Send + 'static> WorkQueue<A> {
	pub fn new<F, Fut>(concurrency: usize, worker: F) -> Self
	where
		F: Fn(A) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let (events, _) = broadcast::channel(256);
		Self {
			worker: Arc::new(move |args| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(worker(args)) }),
			permits: Arc::new(Semaphore::new(concurrency.max(1))),
			pending: Arc::new(AtomicUsize::new(0)),
			next_job: AtomicU64::new(1),
			events,
			drained: Arc::new(Notify::new()),
		}
	}

	/// Schedule one worker call; returns the job id used in failure events.
	pub fn enqueue(&self, args: A) -> u64 {
		let job = self.next_job.fetch_add(1, Ordering::Relaxed);
		self.pending.fetch_add(1, Ordering::SeqCst);
		metrics::gauge!("roomcast_server_work_queue_pending").increment(1.0);

		let worker = self.worker.clone();
		let permits = self.permits.clone();
		let pending = self.pending.clone();
		let events = self.events.clone();
		let drained = self.drained.clone();

		tokio::spawn(async move {
			let result = match permits.acquire_owned().await {
				Ok(_permit) => match tokio::spawn(worker(args)).await {
					Ok(res) => res.map_err(|e| format!("{e:#}")),
					Err(join) => Err(format!("worker panicked: {join}")),
				},
				Err(_) => Err("work queue closed".to_string()),
			};

			if let Err(error) = result {
				warn!(job, error = %error, "work queue job failed");
				metrics::counter!("roomcast_server_work_queue_failures_total").increment(1);
				let _ = events.send(QueueEvent::Failed { job, error });
			}

			metrics::gauge!("roomcast_server_work_queue_pending").decrement(1.0);
			if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
				debug!("work queue drained");
				let _ = events.send(QueueEvent::Drained);
				drained.notify_waiters();
			}
		});

		job
	}

	pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
		self.events.subscribe()
	}

	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::SeqCst)
	}

	/// Resolve once nothing is queued or running.
	pub async fn drained(&self) {
		loop {
			let notified = self.drained.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.pending() == 0 {
				return;
			}
			notified.await;
		}
	}
}

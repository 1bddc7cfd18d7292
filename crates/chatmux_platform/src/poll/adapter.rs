#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatmux_domain::{Platform, Resource, RoomId, SessionId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::{DEFAULT_SCHEDULER_QUEUE_CAPACITY, RequestScheduler};
use super::worker::{ListeningWorker, WorkerStatus};
use super::{LiveChatApi, SharedApi};
use crate::{
	AdapterError, AdapterSinks, AdapterStreams, DEFAULT_ERRORS_CAPACITY, DEFAULT_EVENTS_CAPACITY, SourceAdapter,
	SubscriberIndex, adapter_channels, platform_matches,
};

#[derive(Debug, Clone)]
pub struct PollConfig {
	pub platform: Platform,
	/// Flat wait before re-resolving a room after any error.
	pub retry_cooldown: Duration,
	pub scheduler_queue_capacity: usize,
	pub events_capacity: usize,
	pub errors_capacity: usize,
}

impl Default for PollConfig {
	fn default() -> Self {
		Self {
			platform: Platform::YouTube,
			retry_cooldown: Duration::from_secs(30),
			scheduler_queue_capacity: DEFAULT_SCHEDULER_QUEUE_CAPACITY,
			events_capacity: DEFAULT_EVENTS_CAPACITY,
			errors_capacity: DEFAULT_ERRORS_CAPACITY,
		}
	}
}

/// Lifecycle of one room's worker. Created by the first register, cancelled by the last
/// deregister; never shared.
struct RoomWorker {
	stop: CancellationToken,
	status: watch::Receiver<WorkerStatus>,
	task: JoinHandle<()>,
}

struct Inner {
	subscribers: SubscriberIndex,
	workers: HashMap<RoomId, RoomWorker>,
	sinks: Option<AdapterSinks>,
}

/// Poll-based source adapter: one listening worker per active room, all sharing one
/// rate-limited scheduler.
pub struct PollAdapter {
	cfg: PollConfig,
	api: SharedApi,
	scheduler: RequestScheduler,
	inner: Mutex<Inner>,
	streams: Mutex<Option<AdapterStreams>>,
}

impl PollAdapter {
	/// Create the adapter and start its scheduler. Must be called inside a tokio runtime.
	///
	/// `api` may be `None` when credentials arrive later through [`PollAdapter::set_api`];
	/// rooms registered before that back off with a credentials error.
	pub fn new(cfg: PollConfig, api: Option<Arc<dyn LiveChatApi>>) -> Self {
		let api = SharedApi::new(api);
		let scheduler = RequestScheduler::spawn(api.clone(), cfg.scheduler_queue_capacity);
		let (sinks, streams) = adapter_channels(cfg.events_capacity, cfg.errors_capacity);

		Self {
			cfg,
			api,
			scheduler,
			inner: Mutex::new(Inner {
				subscribers: SubscriberIndex::new(),
				workers: HashMap::new(),
				sinks: Some(sinks),
			}),
			streams: Mutex::new(Some(streams)),
		}
	}

	/// Install or replace the API client (e.g. after an OAuth token arrives).
	pub fn set_api(&self, api: Arc<dyn LiveChatApi>) {
		self.api.set(api);
		info!(platform = %self.cfg.platform, "poll api client updated");
	}

	/// Current status of a room's worker, if one is running.
	pub fn worker_status(&self, room: &RoomId) -> Option<WorkerStatus> {
		let inner = self.inner.lock();
		inner.workers.get(room).map(|w| w.status.borrow().clone())
	}

	/// Watch a room's worker status transitions.
	pub fn watch_worker(&self, room: &RoomId) -> Option<watch::Receiver<WorkerStatus>> {
		let inner = self.inner.lock();
		inner.workers.get(room).map(|w| w.status.clone())
	}

	fn spawn_worker(&self, resource: &Resource, sinks: AdapterSinks) -> RoomWorker {
		let stop = CancellationToken::new();
		let (status_tx, status_rx) = watch::channel(WorkerStatus::Resolving);
		let worker = ListeningWorker {
			resource: resource.clone(),
			api: self.api.clone(),
			scheduler: self.scheduler.handle(),
			sinks,
			cooldown: self.cfg.retry_cooldown,
			stop: stop.clone(),
			status: status_tx,
		};

		RoomWorker {
			stop,
			status: status_rx,
			task: tokio::spawn(worker.run()),
		}
	}
}

#[async_trait]
impl SourceAdapter for PollAdapter {
	fn platform(&self) -> Platform {
		self.cfg.platform
	}

	fn register(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.cfg.platform, resource, "register") {
			return;
		}

		let mut inner = self.inner.lock();
		let Some(sinks) = inner.sinks.clone() else {
			debug!(room = %resource, "poll adapter closed; ignoring register");
			return;
		};
		if !inner.subscribers.add(&resource.room_id, subscriber) {
			return;
		}

		info!(room = %resource, "starting listening worker");
		if let Some(old) = inner.workers.remove(&resource.room_id) {
			old.stop.cancel();
		}
		let worker = self.spawn_worker(resource, sinks);
		inner.workers.insert(resource.room_id.clone(), worker);
		metrics::gauge!("chatmux_poll_active_rooms").set(inner.workers.len() as f64);
	}

	fn deregister(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.cfg.platform, resource, "deregister") {
			return;
		}

		let mut inner = self.inner.lock();
		if !inner.subscribers.remove(&resource.room_id, subscriber) {
			return;
		}

		if let Some(worker) = inner.workers.remove(&resource.room_id) {
			info!(room = %resource, "stopping listening worker");
			worker.stop.cancel();
		}
		metrics::gauge!("chatmux_poll_active_rooms").set(inner.workers.len() as f64);
	}

	fn take_streams(&self) -> Option<AdapterStreams> {
		self.streams.lock().take()
	}

	fn active_rooms(&self) -> Vec<RoomId> {
		self.inner.lock().subscribers.rooms()
	}

	async fn close(&self) -> Result<(), AdapterError> {
		let tasks: Vec<JoinHandle<()>> = {
			let mut inner = self.inner.lock();
			if inner.sinks.take().is_none() {
				return Ok(());
			}
			inner.subscribers.clear();
			inner
				.workers
				.drain()
				.map(|(_, w)| {
					w.stop.cancel();
					w.task
				})
				.collect()
		};

		info!(platform = %self.cfg.platform, workers = tasks.len(), "closing poll adapter");
		self.scheduler.stop();
		for task in tasks {
			if let Err(e) = task.await {
				warn!(error = %e, "listening worker task failed");
			}
		}
		self.scheduler.shutdown().await;
		metrics::gauge!("chatmux_poll_active_rooms").set(0.0);
		Ok(())
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chatmux_domain::{Platform, Resource, RoomId, SessionId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GatewayEvent, GatewaySource};
use crate::{
	AdapterError, AdapterSinks, AdapterStreams, DEFAULT_ERRORS_CAPACITY, DEFAULT_EVENTS_CAPACITY, SourceAdapter,
	SubscriberIndex, adapter_channels, platform_matches,
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub platform: Platform,
	pub feed_capacity: usize,
	pub events_capacity: usize,
	pub errors_capacity: usize,
}

impl GatewayConfig {
	pub fn new(platform: Platform) -> Self {
		Self {
			platform,
			feed_capacity: DEFAULT_EVENTS_CAPACITY,
			events_capacity: DEFAULT_EVENTS_CAPACITY,
			errors_capacity: DEFAULT_ERRORS_CAPACITY,
		}
	}
}

/// Push-based source adapter. Opening a room only adds it to the filter.
pub struct GatewayAdapter {
	platform: Platform,
	subscribers: Arc<RwLock<SubscriberIndex>>,
	stop: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	streams: Mutex<Option<AdapterStreams>>,
}

impl GatewayAdapter {
	/// Start the connection and the filtering pump. Must be called inside a tokio runtime.
	pub fn new(cfg: GatewayConfig, source: Box<dyn GatewaySource>) -> Self {
		let (sinks, streams) = adapter_channels(cfg.events_capacity, cfg.errors_capacity);
		let (feed_tx, feed_rx) = mpsc::channel(cfg.feed_capacity.max(1));
		let subscribers = Arc::new(RwLock::new(SubscriberIndex::new()));
		let stop = CancellationToken::new();

		let source_task = tokio::spawn(source.run(feed_tx, stop.clone()));
		let pump_task = tokio::spawn(pump(cfg.platform, feed_rx, sinks, Arc::clone(&subscribers), stop.clone()));

		Self {
			platform: cfg.platform,
			subscribers,
			stop,
			tasks: Mutex::new(vec![source_task, pump_task]),
			streams: Mutex::new(Some(streams)),
		}
	}

	pub fn is_open(&self, room: &RoomId) -> bool {
		self.subscribers.read().contains_room(room)
	}
}

async fn pump(
	platform: Platform,
	mut feed: mpsc::Receiver<GatewayEvent>,
	sinks: AdapterSinks,
	subscribers: Arc<RwLock<SubscriberIndex>>,
	stop: CancellationToken,
) {
	loop {
		let item = tokio::select! {
			biased;
			_ = stop.cancelled() => break,
			item = feed.recv() => match item {
				Some(item) => item,
				None => {
					debug!(%platform, "gateway feed ended");
					break;
				}
			},
		};

		match item {
			GatewayEvent::Message(env) => {
				if env.platform() != platform || !subscribers.read().contains_room(&env.routing_key.room_id) {
					metrics::counter!("chatmux_gateway_filtered_total", "platform" => platform.as_str()).increment(1);
					continue;
				}

				tokio::select! {
					biased;
					_ = stop.cancelled() => break,
					sent = sinks.events.send(env) => {
						if sent.is_err() {
							debug!(%platform, "events channel closed; stopping gateway pump");
							break;
						}
					}
				}
			}
			GatewayEvent::Error(err) => {
				warn!(%platform, error = %err, "gateway error");
				sinks.report(err);
			}
		}
	}
}

#[async_trait]
impl SourceAdapter for GatewayAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	fn register(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.platform, resource, "register") || self.stop.is_cancelled() {
			return;
		}
		if self.subscribers.write().add(&resource.room_id, subscriber) {
			info!(room = %resource, "gateway filter added");
		}
	}

	fn deregister(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.platform, resource, "deregister") {
			return;
		}
		if self.subscribers.write().remove(&resource.room_id, subscriber) {
			info!(room = %resource, "gateway filter removed");
		}
	}

	fn take_streams(&self) -> Option<AdapterStreams> {
		self.streams.lock().take()
	}

	fn active_rooms(&self) -> Vec<RoomId> {
		self.subscribers.read().rooms()
	}

	async fn close(&self) -> Result<(), AdapterError> {
		self.stop.cancel();
		let tasks = std::mem::take(&mut *self.tasks.lock());
		if tasks.is_empty() {
			return Ok(());
		}

		info!(platform = %self.platform, "closing gateway adapter");
		self.subscribers.write().clear();
		for task in tasks {
			if let Err(e) = task.await {
				warn!(platform = %self.platform, error = %e, "gateway task failed");
			}
		}
		Ok(())
	}
}

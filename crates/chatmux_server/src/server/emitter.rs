#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatmux_domain::Platform;
use chatmux_platform::{AdapterStreams, Envelope, SourceAdapter};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default capacity of the shared bus.
pub const DEFAULT_BUS_CAPACITY: usize = 8_192;

pub type BusRx = mpsc::Receiver<Envelope>;

#[derive(Debug, Clone)]
pub struct EmitterConfig {
	pub bus_capacity: usize,
}

impl Default for EmitterConfig {
	fn default() -> Self {
		Self {
			bus_capacity: DEFAULT_BUS_CAPACITY,
		}
	}
}

/// Fans every adapter's events into one bus.
///
/// Only the forwarders hold bus senders, so the bus closes once every adapter has been
/// closed and its forwarder has drained.
pub struct ComposedEmitter {
	adapters: HashMap<Platform, Arc<dyn SourceAdapter>>,
	bus: Mutex<Option<BusRx>>,
	forwarders: Mutex<Vec<JoinHandle<()>>>,
	last_errors: Arc<Mutex<HashMap<Platform, String>>>,
	stop: CancellationToken,
}

impl ComposedEmitter {
	/// Spawn one forwarder per adapter. Must be called inside a tokio runtime.
	pub fn start(adapters: Vec<Arc<dyn SourceAdapter>>, cfg: EmitterConfig) -> Self {
		let (bus_tx, bus_rx) = mpsc::channel(cfg.bus_capacity);
		let last_errors = Arc::new(Mutex::new(HashMap::new()));
		let stop = CancellationToken::new();

		let mut by_platform = HashMap::new();
		let mut forwarders = Vec::new();
		for adapter in adapters {
			let platform = adapter.platform();
			if by_platform.contains_key(&platform) {
				warn!(%platform, "duplicate adapter for platform; ignoring");
				continue;
			}

			match adapter.take_streams() {
				Some(streams) => {
					forwarders.push(tokio::spawn(forward(
						platform,
						streams,
						bus_tx.clone(),
						Arc::clone(&last_errors),
						stop.child_token(),
					)));
				}
				None => warn!(%platform, "adapter streams already taken; events will not reach the bus"),
			}
			by_platform.insert(platform, adapter);
		}

		info!(adapters = by_platform.len(), "composed emitter started");

		Self {
			adapters: by_platform,
			bus: Mutex::new(Some(bus_rx)),
			forwarders: Mutex::new(forwarders),
			last_errors,
			stop,
		}
	}

	/// Take the bus receiver. Returns `None` after the first call.
	pub fn take_bus(&self) -> Option<BusRx> {
		self.bus.lock().take()
	}

	pub fn adapter(&self, platform: Platform) -> Option<&Arc<dyn SourceAdapter>> {
		self.adapters.get(&platform)
	}

	pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
		self.adapters.values()
	}

	/// Most recent error reported by `platform`'s adapter.
	pub fn last_error(&self, platform: Platform) -> Option<String> {
		self.last_errors.lock().get(&platform).cloned()
	}

	/// Close every adapter, then wait for the forwarders so the bus closes. Idempotent.
	pub async fn close(&self) {
		for (platform, adapter) in &self.adapters {
			if let Err(e) = adapter.close().await {
				warn!(%platform, error = %e, "adapter close failed");
			}
		}

		// Forwarders blocked on a full bus nobody drains anymore.
		self.stop.cancel();

		let forwarders = std::mem::take(&mut *self.forwarders.lock());
		for task in forwarders {
			let _ = task.await;
		}
		info!("composed emitter closed");
	}
}

async fn forward(
	platform: Platform,
	streams: AdapterStreams,
	bus: mpsc::Sender<Envelope>,
	last_errors: Arc<Mutex<HashMap<Platform, String>>>,
	stop: CancellationToken,
) {
	let AdapterStreams {
		mut events,
		mut errors,
	} = streams;
	let mut errors_open = true;

	loop {
		tokio::select! {
			ev = events.recv() => {
				let Some(env) = ev else {
					debug!(%platform, "adapter events channel closed; forwarder exiting");
					break;
				};
				tokio::select! {
					sent = bus.send(env) => {
						if sent.is_err() {
							debug!(%platform, "bus closed; forwarder exiting");
							break;
						}
						metrics::counter!("chatmux_envelopes_forwarded_total", "platform" => platform.as_str()).increment(1);
					}
					_ = stop.cancelled() => break,
				}
			}

			err = errors.recv(), if errors_open => match err {
				Some(err) => {
					metrics::counter!("chatmux_adapter_errors_total", "platform" => platform.as_str()).increment(1);
					warn!(%platform, error = %err, "adapter error");
					last_errors.lock().insert(platform, err.to_string());
				}
				None => errors_open = false,
			},

			_ = stop.cancelled() => {
				info!(%platform, "adapter forwarder observed shutdown");
				break;
			}
		}
	}
}

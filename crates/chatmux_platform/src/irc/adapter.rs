#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatmux_domain::{Platform, Resource, RoomId, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IrcConnection, IrcConnector, IrcCredentials};
use crate::{
	AdapterError, AdapterSinks, AdapterStreams, DEFAULT_ERRORS_CAPACITY, DEFAULT_EVENTS_CAPACITY, Reconnect,
	SourceAdapter, SubscriberIndex, adapter_channels, platform_matches,
};

#[derive(Debug, Clone)]
pub struct IrcConfig {
	pub platform: Platform,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// A session that lasted this long counts as healthy; the next reconnect waits only
	/// `reconnect_min_delay`.
	pub stable_after: Duration,
	pub events_capacity: usize,
	pub errors_capacity: usize,
}

impl Default for IrcConfig {
	fn default() -> Self {
		Self {
			platform: Platform::Twitch,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			stable_after: Duration::from_secs(30),
			events_capacity: DEFAULT_EVENTS_CAPACITY,
			errors_capacity: DEFAULT_ERRORS_CAPACITY,
		}
	}
}

/// Adapter -> connection task.
#[derive(Debug)]
enum Control {
	Join(RoomId),
	Part(RoomId),
	UpdateAuth(IrcCredentials),
}

/// Join/part source adapter over a single replaceable connection.
pub struct IrcAdapter {
	platform: Platform,
	subscribers: Arc<Mutex<SubscriberIndex>>,
	control: mpsc::UnboundedSender<Control>,
	stop: CancellationToken,
	task: Mutex<Option<JoinHandle<()>>>,
	streams: Mutex<Option<AdapterStreams>>,
}

impl IrcAdapter {
	/// Spawn the connection task. Must be called inside a tokio runtime.
	pub fn new(cfg: IrcConfig, connector: Arc<dyn IrcConnector>, creds: IrcCredentials) -> Self {
		let (sinks, streams) = adapter_channels(cfg.events_capacity, cfg.errors_capacity);
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let subscribers = Arc::new(Mutex::new(SubscriberIndex::new()));
		let stop = CancellationToken::new();

		let task = ConnectionTask {
			cfg: cfg.clone(),
			connector,
			creds,
			subscribers: Arc::clone(&subscribers),
			control_rx,
			sinks,
			stop: stop.clone(),
		};

		Self {
			platform: cfg.platform,
			subscribers,
			control: control_tx,
			stop,
			task: Mutex::new(Some(tokio::spawn(task.run()))),
			streams: Mutex::new(Some(streams)),
		}
	}

	/// Replace the connection's credentials. The connection is re-established and every
	/// room that still has subscribers is joined again.
	pub fn update_auth(&self, creds: IrcCredentials) {
		if self.control.send(Control::UpdateAuth(creds)).is_err() {
			debug!(platform = %self.platform, "irc adapter closed; dropping auth update");
		}
	}
}

#[async_trait]
impl SourceAdapter for IrcAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	fn register(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.platform, resource, "register") || self.stop.is_cancelled() {
			return;
		}

		// Index update and control send happen under one lock so the task sees them in order.
		let mut subs = self.subscribers.lock();
		if subs.add(&resource.room_id, subscriber) {
			let _ = self.control.send(Control::Join(resource.room_id.clone()));
		}
	}

	fn deregister(&self, subscriber: &SessionId, resource: &Resource) {
		if !platform_matches(self.platform, resource, "deregister") {
			return;
		}

		let mut subs = self.subscribers.lock();
		if subs.remove(&resource.room_id, subscriber) {
			let _ = self.control.send(Control::Part(resource.room_id.clone()));
		}
	}

	fn take_streams(&self) -> Option<AdapterStreams> {
		self.streams.lock().take()
	}

	fn active_rooms(&self) -> Vec<RoomId> {
		self.subscribers.lock().rooms()
	}

	async fn close(&self) -> Result<(), AdapterError> {
		self.stop.cancel();
		let task = self.task.lock().take();
		let Some(task) = task else {
			return Ok(());
		};

		info!(platform = %self.platform, "closing irc adapter");
		self.subscribers.lock().clear();
		task.await.map_err(|e| AdapterError::transport(self.platform, e))
	}
}

enum Outcome {
	Stop,
	Reconnect,
	Replace(IrcCredentials),
}

struct ConnectionTask {
	cfg: IrcConfig,
	connector: Arc<dyn IrcConnector>,
	creds: IrcCredentials,
	subscribers: Arc<Mutex<SubscriberIndex>>,
	control_rx: mpsc::UnboundedReceiver<Control>,
	sinks: AdapterSinks,
	stop: CancellationToken,
}

impl ConnectionTask {
	async fn run(mut self) {
		let platform = self.cfg.platform;
		let mut reconnect = Reconnect::new(self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);

		loop {
			if let Some(delay) = reconnect.delay() {
				info!(%platform, delay = ?delay, failures = reconnect.failures(), "reconnecting irc");
				match self.wait(delay).await {
					Outcome::Stop => break,
					Outcome::Replace(creds) => {
						self.creds = creds;
						reconnect.reset();
					}
					Outcome::Reconnect => {}
				}
			}

			let connected = tokio::select! {
				biased;
				_ = self.stop.cancelled() => break,
				res = self.connector.connect(&self.creds) => res,
			};
			let mut conn = match connected {
				Ok(conn) => conn,
				Err(e) => {
					reconnect.failed();
					self.fail(format!("{e:#}"));
					continue;
				}
			};
			info!(%platform, nick = %self.creds.nick, anonymous = self.creds.is_anonymous(), "irc connected");

			let started = Instant::now();
			let outcome = self.session(conn.as_mut()).await;
			conn.close().await;
			metrics::gauge!("chatmux_irc_joined_rooms", "platform" => platform.as_str()).set(0.0);

			match outcome {
				Outcome::Stop => break,
				Outcome::Replace(creds) => {
					info!(%platform, "irc credentials replaced; reconnecting");
					self.creds = creds;
					reconnect.reset();
				}
				Outcome::Reconnect if started.elapsed() >= self.cfg.stable_after => reconnect.dropped_after_healthy(),
				Outcome::Reconnect => reconnect.failed(),
			}
		}

		info!(%platform, "irc connection task stopped");
	}

	/// Sleep before a reconnect while still honoring stop and credential updates.
	async fn wait(&mut self, delay: Duration) -> Outcome {
		let deadline = sleep(delay);
		tokio::pin!(deadline);
		loop {
			tokio::select! {
				biased;
				_ = self.stop.cancelled() => return Outcome::Stop,
				ctl = self.control_rx.recv() => match ctl {
					Some(Control::UpdateAuth(creds)) => return Outcome::Replace(creds),
					// Re-joins come from the subscriber snapshot on connect.
					Some(Control::Join(_) | Control::Part(_)) => {}
					None => return Outcome::Stop,
				},
				_ = &mut deadline => return Outcome::Reconnect,
			}
		}
	}

	async fn session(&mut self, conn: &mut dyn IrcConnection) -> Outcome {
		let platform = self.cfg.platform;
		let mut joined: HashSet<RoomId> = HashSet::new();

		let snapshot = self.subscribers.lock().rooms();
		for room in snapshot {
			if let Err(e) = conn.join(&room).await {
				self.fail(format!("{e:#}"));
				return Outcome::Reconnect;
			}
			joined.insert(room);
		}
		metrics::gauge!("chatmux_irc_joined_rooms", "platform" => platform.as_str()).set(joined.len() as f64);

		loop {
			tokio::select! {
				biased;
				_ = self.stop.cancelled() => return Outcome::Stop,
				ctl = self.control_rx.recv() => {
					let res = match ctl {
						None => return Outcome::Stop,
						Some(Control::UpdateAuth(creds)) => return Outcome::Replace(creds),
						Some(Control::Join(room)) => {
							if joined.contains(&room) {
								continue;
							}
							debug!(%platform, %room, "JOIN");
							let res = conn.join(&room).await;
							joined.insert(room);
							res
						}
						Some(Control::Part(room)) => {
							if !joined.remove(&room) {
								continue;
							}
							debug!(%platform, %room, "PART");
							conn.part(&room).await
						}
					};
					metrics::gauge!("chatmux_irc_joined_rooms", "platform" => platform.as_str()).set(joined.len() as f64);
					if let Err(e) = res {
						self.fail(format!("{e:#}"));
						return Outcome::Reconnect;
					}
				}
				ev = conn.next_event() => match ev {
					Ok(Some(env)) => {
						if env.platform() != platform || !joined.contains(&env.routing_key.room_id) {
							continue;
						}
						tokio::select! {
							biased;
							_ = self.stop.cancelled() => return Outcome::Stop,
							sent = self.sinks.events.send(env) => {
								if sent.is_err() {
									return Outcome::Stop;
								}
							}
						}
					}
					Ok(None) => {
						warn!(%platform, "irc connection closed by server");
						return Outcome::Reconnect;
					}
					Err(e) => {
						self.fail(format!("{e:#}"));
						return Outcome::Reconnect;
					}
				},
			}
		}
	}

	fn fail(&self, detail: String) {
		warn!(platform = %self.cfg.platform, error = %detail, "irc connection error");
		self.sinks.report(AdapterError::transport(self.cfg.platform, detail));
	}
}

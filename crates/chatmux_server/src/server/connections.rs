#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatmux_domain::SessionId;
use chatmux_platform::Envelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Live transport connections per session, each with a bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: ConnectionRegistryConfig,
}

#[derive(Debug, Clone)]
pub struct ConnectionRegistryConfig {
	/// Maximum number of queued items per connection.
	pub queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for ConnectionRegistryConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a connection's queue.
#[derive(Debug, Clone)]
pub enum ConnectionItem {
	Envelope(Arc<Envelope>),

	/// The connection fell behind and `dropped` envelopes were discarded.
	Lagged { dropped: u64 },
}

pub type ConnectionId = u64;

/// Handle returned by `connect`.
#[derive(Debug)]
pub struct Connection {
	pub id: ConnectionId,
	pub rx: mpsc::Receiver<ConnectionItem>,
}

impl ConnectionRegistry {
	pub fn new(cfg: ConnectionRegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Open a connection for `session`. `on_first` runs under the registry lock when
	/// this is the session's only live connection.
	pub async fn connect(&self, session: &SessionId, on_first: impl FnOnce()) -> Connection {
		let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.next_id += 1;
		let id = inner.next_id;

		let entry = inner.sessions.entry(session.clone()).or_default();
		entry.prune_closed();
		let first = entry.slots.is_empty();
		entry.slots.push(Slot { id, tx, pending_lag: 0 });

		if first {
			on_first();
		}
		if self.cfg.debug_logs {
			debug!(%session, conn = id, conns = entry.slots.len(), "connection registered");
		}
		metrics::gauge!("chatmux_connections").increment(1.0);

		Connection { id, rx }
	}

	/// Drop connection `id`. `on_last` runs under the registry lock when the session has no
	/// live connection left.
	pub async fn disconnect(&self, session: &SessionId, id: ConnectionId, on_last: impl FnOnce()) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.sessions.get_mut(session) else {
			return;
		};

		let before = entry.slots.len();
		entry.slots.retain(|s| s.id != id);
		if entry.slots.len() == before {
			return;
		}
		metrics::gauge!("chatmux_connections").decrement(1.0);

		entry.prune_closed();
		if entry.slots.is_empty() {
			inner.sessions.remove(session);
			on_last();
		}
	}

	/// Queue `env` on every live connection of `session` without blocking.
	///
	/// Returns how many connections accepted it. Full queues drop the envelope and owe the
	/// connection a lag marker.
	pub async fn deliver(&self, session: &SessionId, env: &Arc<Envelope>) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.sessions.get_mut(session) else {
			return 0;
		};

		let mut delivered = 0;
		let mut dropped = 0u64;
		for slot in entry.slots.iter_mut() {
			match slot.tx.try_send(ConnectionItem::Envelope(Arc::clone(env))) {
				Ok(()) => {
					delivered += 1;
					if slot.pending_lag > 0
						&& slot
							.tx
							.try_send(ConnectionItem::Lagged {
								dropped: slot.pending_lag,
							})
							.is_ok()
					{
						slot.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
					slot.pending_lag = slot.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		if dropped > 0 {
			metrics::counter!("chatmux_dispatch_dropped_total").increment(dropped);
			if self.cfg.debug_logs {
				debug!(%session, dropped, "dropped envelope on full connection queues");
			}
		}
		delivered
	}

	/// Run `f` under the registry lock if `session` has a live connection.
	pub async fn if_connected(&self, session: &SessionId, f: impl FnOnce()) -> bool {
		let inner = self.inner.lock().await;
		let connected = inner
			.sessions
			.get(session)
			.is_some_and(|e| e.slots.iter().any(|s| !s.tx.is_closed()));
		if connected {
			f();
		}
		connected
	}

	/// Live connections of `session`.
	pub async fn connection_count(&self, session: &SessionId) -> usize {
		let inner = self.inner.lock().await;
		inner
			.sessions
			.get(session)
			.map(|e| e.slots.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	next_id: ConnectionId,
	sessions: HashMap<SessionId, SessionEntry>,
}

#[derive(Debug, Default)]
struct SessionEntry {
	slots: Vec<Slot>,
}

#[derive(Debug)]
struct Slot {
	id: ConnectionId,
	tx: mpsc::Sender<ConnectionItem>,
	pending_lag: u64,
}

impl SessionEntry {
	fn prune_closed(&mut self) {
		let before = self.slots.len();
		self.slots.retain(|s| !s.tx.is_closed());
		let pruned = before - self.slots.len();
		if pruned > 0 {
			metrics::gauge!("chatmux_connections").decrement(pruned as f64);
		}
	}
}

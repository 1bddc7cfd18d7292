#![forbid(unsafe_code)]

use std::sync::Arc;

use chatmux_platform::Envelope;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::connections::ConnectionRegistry;
use crate::server::emitter::BusRx;
use crate::server::message_hub::MessageHub;

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
	pub debug_log_events: bool,
}

/// Single consumer of the bus: resolves interested sessions and queues the envelope on
/// each session's live connections.
pub struct Dispatcher {
	cfg: DispatcherConfig,
	hub: Arc<MessageHub>,
	connections: ConnectionRegistry,
	bus: BusRx,
}

impl Dispatcher {
	pub fn new(bus: BusRx, hub: Arc<MessageHub>, connections: ConnectionRegistry, cfg: DispatcherConfig) -> Self {
		Self {
			cfg,
			hub,
			connections,
			bus,
		}
	}

	/// Run until the bus closes.
	pub async fn run(mut self) {
		info!("dispatcher started");

		while let Some(env) = self.bus.recv().await {
			self.dispatch(env).await;
		}

		info!("dispatcher exiting (bus closed)");
	}

	/// Deliver one envelope; returns how many connections accepted it.
	pub async fn dispatch(&self, env: Envelope) -> usize {
		let sessions = self.hub.get_session_ids(&env.routing_key);
		if self.cfg.debug_log_events {
			debug!(room = %env.routing_key, sessions = sessions.len(), "dispatching envelope");
		}
		if sessions.is_empty() {
			metrics::counter!("chatmux_dispatch_unrouted_total").increment(1);
			return 0;
		}

		let env = Arc::new(env);
		let mut delivered = 0;
		for session in &sessions {
			delivered += self.connections.deliver(session, &env).await;
		}
		metrics::counter!("chatmux_dispatch_deliveries_total").increment(delivered as u64);
		delivered
	}
}

/// Spawn the dispatcher loop.
pub fn spawn_dispatcher(
	bus: BusRx,
	hub: Arc<MessageHub>,
	connections: ConnectionRegistry,
	cfg: DispatcherConfig,
) -> JoinHandle<()> {
	let dispatcher = Dispatcher::new(bus, hub, connections, cfg);
	tokio::spawn(dispatcher.run())
}

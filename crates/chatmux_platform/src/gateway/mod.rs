#![forbid(unsafe_code)]

//! Push-based source.
//!
//! The platform delivers every event the bot can see over one persistent connection; the
//! adapter only maintains which rooms are wanted and filters the feed accordingly.

mod adapter;
mod discord;


use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, Envelope};

pub use adapter::{GatewayAdapter, GatewayConfig};
pub use discord::{DEFAULT_DISCORD_GATEWAY_URL, DEFAULT_DISCORD_INTENTS, DiscordGateway, DiscordGatewayConfig};

/// One item observed on a push connection, for any room.
#[derive(Debug)]
pub enum GatewayEvent {
	Message(Envelope),
	Error(AdapterError),
}

pub type GatewayFeedTx = mpsc::Sender<GatewayEvent>;

/// A persistent push connection.
///
/// `run` owns the connection (including reconnects) until `stop` fires. It publishes
/// events for every room it sees; filtering is the adapter's job.
#[async_trait]
pub trait GatewaySource: Send + 'static {
	async fn run(self: Box<Self>, feed: GatewayFeedTx, stop: CancellationToken);
}

#![forbid(unsafe_code)]

//! IRC-style join/part source.
//!
//! One long-lived connection; rooms are opened with `JOIN` and closed with `PART`.
//! The connection can be replaced at runtime (credentials refresh) and every
//! (re)connect re-joins the rooms that still have subscribers.

mod adapter;
mod twitch;


use async_trait::async_trait;
use chatmux_domain::RoomId;

use crate::{Envelope, SecretString};

pub use adapter::{IrcAdapter, IrcConfig};
pub use twitch::{DEFAULT_TWITCH_IRC_URL, TwitchIrcConnector};

/// Login used for a connection.
#[derive(Debug, Clone)]
pub struct IrcCredentials {
	pub nick: String,
	/// `None` for anonymous read-only access.
	pub pass: Option<SecretString>,
}

impl IrcCredentials {
	/// Read-only anonymous login (`justinfanNNNNN`).
	pub fn anonymous() -> Self {
		let n = uuid::Uuid::new_v4().as_u128() % 100_000;
		Self {
			nick: format!("justinfan{n}"),
			pass: None,
		}
	}

	pub fn user(nick: impl Into<String>, token: SecretString) -> Self {
		Self {
			nick: nick.into().to_ascii_lowercase(),
			pass: Some(token),
		}
	}

	pub fn is_anonymous(&self) -> bool {
		self.pass.is_none()
	}
}

/// Opens connections.
#[async_trait]
pub trait IrcConnector: Send + Sync + 'static {
	async fn connect(&self, creds: &IrcCredentials) -> anyhow::Result<Box<dyn IrcConnection>>;
}

/// One open connection.
///
/// `next_event` must be cancel-safe: it is raced against control messages.
#[async_trait]
pub trait IrcConnection: Send {
	async fn join(&mut self, room: &RoomId) -> anyhow::Result<()>;

	async fn part(&mut self, room: &RoomId) -> anyhow::Result<()>;

	/// Next chat event. `Ok(None)` once the server closed the connection.
	async fn next_event(&mut self) -> anyhow::Result<Option<Envelope>>;

	async fn close(&mut self);
}

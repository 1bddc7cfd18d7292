#![forbid(unsafe_code)]

pub mod gateway;
pub mod irc;
pub mod poll;
mod subscribers;

use std::fmt;

use chatmux_domain::{Platform, Resource, RoomId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub use subscribers::SubscriberIndex;

/// Default capacity of an adapter's events channel.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1_024;

/// Default capacity of an adapter's errors channel.
pub const DEFAULT_ERRORS_CAPACITY: usize = 64;

/// Kind of change carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
	New,
	Delete,
	Edit,
}

/// Platform user reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
	pub id: String,
	pub login: String,
	pub display: Option<String>,
	#[serde(default)]
	pub is_admin: bool,
	#[serde(default)]
	pub is_bot: bool,
	pub color: Option<String>,
}

/// Normalized chat message body. Opaque to routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	/// Platform-native message id.
	pub id: String,

	/// Absent for deletions.
	pub author: Option<UserRef>,

	pub text: String,

	#[serde(default)]
	pub attachments: Vec<String>,
}

impl ChatMessage {
	pub fn new(id: impl Into<String>, author: UserRef, text: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			author: Some(author),
			text: text.into(),
			attachments: Vec::new(),
		}
	}

	/// Body for a deletion: only the id is known.
	pub fn deleted(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			..Self::default()
		}
	}
}

/// Normalized message event tagged with the room it belongs to.
///
/// The routing key never leaves the process; clients only see
/// `{updateTime, update, message}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	pub update_time: DateTime<Utc>,
	pub update: UpdateKind,
	pub message: ChatMessage,
	#[serde(skip)]
	pub routing_key: Resource,
}

impl Envelope {
	pub fn new(routing_key: Resource, update: UpdateKind, message: ChatMessage) -> Self {
		Self {
			update_time: Utc::now(),
			update,
			message,
			routing_key,
		}
	}

	pub fn with_time(mut self, update_time: DateTime<Utc>) -> Self {
		self.update_time = update_time;
		self
	}

	pub fn platform(&self) -> Platform {
		self.routing_key.platform
	}
}

/// Errors surfaced by source adapters on their error channel.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
	/// Missing or malformed credentials/settings.
	#[error("{platform} adapter misconfigured: {detail}")]
	Config { platform: Platform, detail: String },

	/// The platform connection failed or dropped.
	#[error("{platform} transport error: {detail}")]
	Transport { platform: Platform, detail: String },

	/// A single room failed (resolution, polling, join).
	#[error("{room}: {detail}")]
	Room { room: Resource, detail: String },

	#[error("{0} adapter closed")]
	Closed(Platform),
}

impl AdapterError {
	pub fn config(platform: Platform, detail: impl fmt::Display) -> Self {
		Self::Config {
			platform,
			detail: detail.to_string(),
		}
	}

	pub fn transport(platform: Platform, detail: impl fmt::Display) -> Self {
		Self::Transport {
			platform,
			detail: detail.to_string(),
		}
	}

	pub fn room(room: &Resource, detail: impl fmt::Display) -> Self {
		Self::Room {
			room: room.clone(),
			detail: detail.to_string(),
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

pub(crate) type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub type EnvelopeTx = mpsc::Sender<Envelope>;
pub type EnvelopeRx = mpsc::Receiver<Envelope>;
pub type ErrorTx = mpsc::Sender<AdapterError>;
pub type ErrorRx = mpsc::Receiver<AdapterError>;

/// Receiving half of an adapter, handed to the composed emitter once.
#[derive(Debug)]
pub struct AdapterStreams {
	pub events: EnvelopeRx,
	pub errors: ErrorRx,
}

/// Sending half of an adapter, cloned into every task that produces events.
#[derive(Debug, Clone)]
pub struct AdapterSinks {
	pub events: EnvelopeTx,
	pub errors: ErrorTx,
}

impl AdapterSinks {
	/// Report a non-fatal error. Never blocks; drops when nobody is draining errors.
	pub fn report(&self, err: AdapterError) {
		if let Err(e) = self.errors.try_send(err) {
			warn!(error = %e, "adapter error channel unavailable; dropping error");
		}
	}
}

/// Build the standard bounded channel pair for an adapter.
pub fn adapter_channels(events_capacity: usize, errors_capacity: usize) -> (AdapterSinks, AdapterStreams) {
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	let (errors_tx, errors_rx) = mpsc::channel(errors_capacity);
	(
		AdapterSinks {
			events: events_tx,
			errors: errors_tx,
		},
		AdapterStreams {
			events: events_rx,
			errors: errors_rx,
		},
	)
}

/// Platform-specific subscription manager and event source.
///
/// `register`/`deregister` are fire-and-forget: they only touch the adapter's own
/// reference count and hand work to background tasks, so callers may hold locks across
/// them. Failures surface later on the errors stream.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync + 'static {
	/// Which platform this adapter implements.
	fn platform(&self) -> Platform;

	/// Add `subscriber` to `resource`; opens the platform subscription on the first one.
	fn register(&self, subscriber: &SessionId, resource: &Resource);

	/// Remove `subscriber` from `resource`; tears the subscription down on the last one.
	fn deregister(&self, subscriber: &SessionId, resource: &Resource);

	/// Take the event/error receivers. Returns `None` after the first call.
	fn take_streams(&self) -> Option<AdapterStreams>;

	/// Rooms with at least one subscriber.
	fn active_rooms(&self) -> Vec<RoomId>;

	/// Stop every background task and drop all senders. Idempotent.
	async fn close(&self) -> Result<(), AdapterError>;
}

/// Returns `false` (and logs) when `resource` belongs to another platform.
pub(crate) fn platform_matches(platform: Platform, resource: &Resource, op: &'static str) -> bool {
	if resource.platform == platform {
		return true;
	}
	warn!(%platform, room = %resource, op, "ignoring resource for non-matching platform");
	false
}

/// Capped exponential backoff.
pub(crate) fn backoff_delay(attempt: u32, min: std::time::Duration, max: std::time::Duration) -> std::time::Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = std::time::Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

/// Reconnect pacing for a long-lived connection.
///
/// Consecutive failures grow the delay up to `max`; a healthy session that later drops
/// waits only `min` before the next attempt.
#[derive(Debug, Clone)]
pub(crate) struct Reconnect {
	min: std::time::Duration,
	max: std::time::Duration,
	failures: u32,
}

impl Reconnect {
	pub(crate) fn new(min: std::time::Duration, max: std::time::Duration) -> Self {
		Self { min, max, failures: 0 }
	}

	/// Delay before the next attempt; `None` to connect right away.
	pub(crate) fn delay(&self) -> Option<std::time::Duration> {
		let failures = self.failures.checked_sub(1)?;
		Some(backoff_delay(failures, self.min, self.max))
	}

	pub(crate) fn failures(&self) -> u32 {
		self.failures
	}

	pub(crate) fn failed(&mut self) {
		self.failures = self.failures.saturating_add(1);
	}

	/// A session that was healthy has ended: start over from `min`.
	pub(crate) fn dropped_after_healthy(&mut self) {
		self.failures = 1;
	}

	/// Connect immediately next time (e.g. new credentials).
	pub(crate) fn reset(&mut self) {
		self.failures = 0;
	}
}

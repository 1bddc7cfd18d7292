#![forbid(unsafe_code)]

//! Poll-based, rate-limited source.
//!
//! One [`RequestScheduler`] serializes every page request across all rooms and throttles
//! them by the polling interval the platform reports back. Each active room gets its own
//! [`ListeningWorker`](worker) that resolves the room to a live chat, polls it through the
//! scheduler, and backs off on errors.

mod adapter;
mod scheduler;
mod worker;
mod youtube;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatmux_domain::RoomId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use crate::{ChatMessage, UpdateKind};

pub use adapter::{PollAdapter, PollConfig};
pub use scheduler::{DEFAULT_SCHEDULER_QUEUE_CAPACITY, RequestScheduler, SchedulerHandle};
pub use worker::WorkerStatus;
pub use youtube::{DEFAULT_YOUTUBE_BASE_URL, YouTubeAuth, YouTubeClient};

/// Errors from the polled platform API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
	#[error("no active live chat for channel {0}")]
	NotLive(String),

	#[error("api credentials not ready")]
	NoCredentials,

	#[error("api request failed: {0}")]
	Api(String),

	#[error("request scheduler stopped")]
	SchedulerStopped,
}

/// One message returned by a page request.
#[derive(Debug, Clone)]
pub struct PolledMessage {
	pub update: UpdateKind,
	pub published_at: Option<DateTime<Utc>>,
	pub message: ChatMessage,
}

/// One page of live chat.
#[derive(Debug, Clone)]
pub struct LiveChatPage {
	pub items: Vec<PolledMessage>,

	/// Continuation token for the next request.
	pub next_page_token: Option<String>,

	/// Server-suggested delay before the next call.
	pub polling_interval: Duration,
}

/// The polled platform API.
#[async_trait]
pub trait LiveChatApi: Send + Sync + 'static {
	/// Translate a room into its currently active live chat id.
	async fn resolve_live_chat(&self, room: &RoomId) -> Result<String, PollError>;

	/// Fetch one page of messages.
	async fn list_messages(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, PollError>;
}

/// Replaceable API client shared by the scheduler and every worker.
///
/// Starts empty when credentials are not ready yet; calls fail with
/// [`PollError::NoCredentials`] until a client is installed.
#[derive(Clone, Default)]
pub struct SharedApi {
	inner: Arc<RwLock<Option<Arc<dyn LiveChatApi>>>>,
}

impl SharedApi {
	pub fn new(api: Option<Arc<dyn LiveChatApi>>) -> Self {
		Self {
			inner: Arc::new(RwLock::new(api)),
		}
	}

	pub fn get(&self) -> Option<Arc<dyn LiveChatApi>> {
		self.inner.read().clone()
	}

	pub fn set(&self, api: Arc<dyn LiveChatApi>) {
		*self.inner.write() = Some(api);
	}

	pub fn is_ready(&self) -> bool {
		self.inner.read().is_some()
	}
}

impl std::fmt::Debug for SharedApi {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SharedApi").field("ready", &self.is_ready()).finish()
	}
}

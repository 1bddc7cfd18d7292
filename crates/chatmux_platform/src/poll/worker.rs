#![forbid(unsafe_code)]

use std::time::Duration;

use chatmux_domain::Resource;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::SchedulerHandle;
use super::{LiveChatPage, PollError, SharedApi};
use crate::{AdapterError, AdapterSinks, Envelope};

/// Externally visible phase of a room's listening worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
	Resolving,
	Polling {
		live_chat_id: String,
		page_token: Option<String>,
	},
	Backoff,
	Stopped,
}

impl WorkerStatus {
	pub fn is_stopped(&self) -> bool {
		matches!(self, WorkerStatus::Stopped)
	}
}

/// Per-room state machine: resolve the live chat, poll it through the shared scheduler,
/// and fall back to a flat cooldown followed by a fresh resolution on any error.
pub(crate) struct ListeningWorker {
	pub resource: Resource,
	pub api: SharedApi,
	pub scheduler: SchedulerHandle,
	pub sinks: AdapterSinks,
	pub cooldown: Duration,
	pub stop: CancellationToken,
	pub status: watch::Sender<WorkerStatus>,
}

impl ListeningWorker {
	pub async fn run(self) {
		info!(room = %self.resource, "listening worker started");
		let mut step = WorkerStatus::Resolving;

		loop {
			self.status.send_replace(step.clone());
			step = match step {
				WorkerStatus::Resolving => self.resolve().await,
				WorkerStatus::Polling {
					live_chat_id,
					page_token,
				} => self.poll(live_chat_id, page_token).await,
				WorkerStatus::Backoff => self.backoff().await,
				WorkerStatus::Stopped => break,
			};
		}

		info!(room = %self.resource, "listening worker stopped");
	}

	async fn resolve(&self) -> WorkerStatus {
		let Some(api) = self.api.get() else {
			self.fail(&PollError::NoCredentials);
			return WorkerStatus::Backoff;
		};

		let resolved = tokio::select! {
			biased;
			_ = self.stop.cancelled() => return WorkerStatus::Stopped,
			res = api.resolve_live_chat(&self.resource.room_id) => res,
		};

		match resolved {
			Ok(live_chat_id) => {
				debug!(room = %self.resource, %live_chat_id, "resolved live chat");
				WorkerStatus::Polling {
					live_chat_id,
					page_token: None,
				}
			}
			Err(e) => {
				self.fail(&e);
				WorkerStatus::Backoff
			}
		}
	}

	async fn poll(&self, live_chat_id: String, page_token: Option<String>) -> WorkerStatus {
		let Some(result) = self
			.scheduler
			.fetch_page(&live_chat_id, page_token.as_deref(), &self.stop)
			.await
		else {
			return WorkerStatus::Stopped;
		};

		match result {
			Ok(page) => {
				let next_token = page.next_page_token.clone().or(page_token);
				if !self.forward(page).await {
					return WorkerStatus::Stopped;
				}
				WorkerStatus::Polling {
					live_chat_id,
					page_token: next_token,
				}
			}
			Err(PollError::SchedulerStopped) => WorkerStatus::Stopped,
			Err(e) => {
				self.fail(&e);
				WorkerStatus::Backoff
			}
		}
	}

	async fn backoff(&self) -> WorkerStatus {
		tokio::select! {
			biased;
			_ = self.stop.cancelled() => WorkerStatus::Stopped,
			_ = tokio::time::sleep(self.cooldown) => WorkerStatus::Resolving,
		}
	}

	/// Push a page's messages onto the adapter's events channel. Returns `false` when
	/// stopped or when the channel is gone.
	async fn forward(&self, page: LiveChatPage) -> bool {
		for item in page.items {
			let mut env = Envelope::new(self.resource.clone(), item.update, item.message);
			if let Some(ts) = item.published_at {
				env = env.with_time(ts);
			}

			tokio::select! {
				biased;
				_ = self.stop.cancelled() => return false,
				sent = self.sinks.events.send(env) => {
					if sent.is_err() {
						debug!(room = %self.resource, "events channel closed");
						return false;
					}
				}
			}
		}
		true
	}

	fn fail(&self, err: &PollError) {
		warn!(room = %self.resource, error = %err, cooldown = ?self.cooldown, "poll room failed; backing off");
		metrics::counter!("chatmux_poll_room_errors_total").increment(1);
		self.sinks.report(AdapterError::room(&self.resource, err));
	}
}

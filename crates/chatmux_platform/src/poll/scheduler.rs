#![forbid(unsafe_code)]

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{LiveChatPage, PollError, SharedApi};

/// Default number of queued page requests.
pub const DEFAULT_SCHEDULER_QUEUE_CAPACITY: usize = 256;

type PageReply = oneshot::Sender<Result<LiveChatPage, PollError>>;

#[derive(Debug)]
struct PageRequest {
	live_chat_id: String,
	page_token: Option<String>,
	reply: PageReply,
}

/// Cheap handle used by listening workers to submit page requests.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
	tx: mpsc::Sender<PageRequest>,
}

impl SchedulerHandle {
	/// Submit a page request and wait for its reply.
	///
	/// Returns `None` as soon as `stop` fires, without waiting for an in-flight call.
	pub async fn fetch_page(
		&self,
		live_chat_id: &str,
		page_token: Option<&str>,
		stop: &CancellationToken,
	) -> Option<Result<LiveChatPage, PollError>> {
		let (reply, reply_rx) = oneshot::channel();
		let req = PageRequest {
			live_chat_id: live_chat_id.to_string(),
			page_token: page_token.map(str::to_string),
			reply,
		};

		tokio::select! {
			biased;
			_ = stop.cancelled() => return None,
			sent = self.tx.send(req) => {
				if sent.is_err() {
					return Some(Err(PollError::SchedulerStopped));
				}
			}
		}

		tokio::select! {
			biased;
			_ = stop.cancelled() => None,
			res = reply_rx => Some(res.unwrap_or(Err(PollError::SchedulerStopped))),
		}
	}
}

/// Serialized, rate-limited executor for page requests.
///
/// A single task owns the next allowed call time. After every successful call it moves
/// that time forward by the polling interval the platform returned; failures leave it
/// untouched so the requester's own cooldown decides the retry.
#[derive(Debug)]
pub struct RequestScheduler {
	handle: SchedulerHandle,
	stop: CancellationToken,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestScheduler {
	/// Spawn the scheduler task.
	pub fn spawn(api: SharedApi, queue_capacity: usize) -> Self {
		let (tx, rx) = mpsc::channel(queue_capacity.max(1));
		let stop = CancellationToken::new();
		let task = tokio::spawn(run(api, rx, stop.clone()));
		Self {
			handle: SchedulerHandle { tx },
			stop,
			task: Mutex::new(Some(task)),
		}
	}

	pub fn handle(&self) -> SchedulerHandle {
		self.handle.clone()
	}

	/// Signal the scheduler to stop without waiting.
	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Stop the scheduler and wait for its task to exit.
	pub async fn shutdown(&self) {
		self.stop.cancel();
		let task = self.task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

async fn run(api: SharedApi, mut rx: mpsc::Receiver<PageRequest>, stop: CancellationToken) {
	let mut next_allowed = Instant::now();

	loop {
		tokio::select! {
			biased;
			_ = stop.cancelled() => break,
			_ = sleep_until(next_allowed) => {}
		}

		let req = tokio::select! {
			biased;
			_ = stop.cancelled() => break,
			req = rx.recv() => match req {
				Some(req) => req,
				None => break,
			},
		};

		if req.reply.is_closed() {
			debug!(live_chat_id = %req.live_chat_id, "requester gone; skipping page request");
			continue;
		}

		let Some(client) = api.get() else {
			let _ = req.reply.send(Err(PollError::NoCredentials));
			continue;
		};

		metrics::counter!("chatmux_poll_scheduler_calls_total").increment(1);
		let result = tokio::select! {
			biased;
			_ = stop.cancelled() => {
				let _ = req.reply.send(Err(PollError::SchedulerStopped));
				break;
			}
			res = client.list_messages(&req.live_chat_id, req.page_token.as_deref()) => res,
		};

		match &result {
			Ok(page) => {
				next_allowed = Instant::now() + page.polling_interval;
			}
			Err(e) => {
				metrics::counter!("chatmux_poll_scheduler_errors_total").increment(1);
				debug!(live_chat_id = %req.live_chat_id, error = %e, "page request failed");
			}
		}

		let _ = req.reply.send(result);
	}

	// Only this task receives, so closing here is race-free: late senders get an error.
	rx.close();
	while let Ok(req) = rx.try_recv() {
		let _ = req.reply.send(Err(PollError::SchedulerStopped));
	}
	info!("poll request scheduler stopped");
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use async_trait::async_trait;
	use chatmux_domain::RoomId;
	use parking_lot::Mutex as PlMutex;

	use super::*;
	use crate::poll::LiveChatApi;

	/// Records the (virtual) instant of every call.
	struct TimedApi {
		calls: PlMutex<Vec<Instant>>,
		interval: Duration,
		fail: bool,
	}

	#[async_trait]
	impl LiveChatApi for TimedApi {
		async fn resolve_live_chat(&self, room: &RoomId) -> Result<String, PollError> {
			Ok(format!("chat-{room}"))
		}

		async fn list_messages(&self, _live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, PollError> {
			self.calls.lock().push(Instant::now());
			if self.fail {
				return Err(PollError::Api("boom".into()));
			}
			let next = page_token.map(|t| format!("{t}+")).unwrap_or_else(|| "t".into());
			Ok(LiveChatPage {
				items: Vec::new(),
				next_page_token: Some(next),
				polling_interval: self.interval,
			})
		}
	}

	fn timed(interval: Duration, fail: bool) -> Arc<TimedApi> {
		Arc::new(TimedApi {
			calls: PlMutex::new(Vec::new()),
			interval,
			fail,
		})
	}

	#[tokio::test(start_paused = true)]
	async fn successive_calls_respect_reported_interval() {
		let api = timed(Duration::from_secs(5), false);
		let scheduler = RequestScheduler::spawn(SharedApi::new(Some(api.clone())), 8);
		let handle = scheduler.handle();
		let stop = CancellationToken::new();

		let first = handle.fetch_page("a", None, &stop).await.unwrap().unwrap();
		assert_eq!(first.next_page_token.as_deref(), Some("t"));
		let second = handle.fetch_page("b", Some("t"), &stop).await.unwrap().unwrap();
		assert_eq!(second.next_page_token.as_deref(), Some("t+"));

		let calls = api.calls.lock().clone();
		assert_eq!(calls.len(), 2);
		assert!(calls[1] - calls[0] >= Duration::from_secs(5));

		scheduler.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn failures_do_not_advance_the_throttle() {
		let api = timed(Duration::from_secs(60), true);
		let scheduler = RequestScheduler::spawn(SharedApi::new(Some(api.clone())), 8);
		let handle = scheduler.handle();
		let stop = CancellationToken::new();

		let r1 = handle.fetch_page("a", None, &stop).await.unwrap();
		let r2 = handle.fetch_page("a", None, &stop).await.unwrap();
		assert_eq!(r1.unwrap_err(), PollError::Api("boom".into()));
		assert!(r2.is_err());

		let calls = api.calls.lock().clone();
		assert!(calls[1] - calls[0] < Duration::from_secs(1));

		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn missing_credentials_are_reported() {
		let scheduler = RequestScheduler::spawn(SharedApi::default(), 8);
		let stop = CancellationToken::new();
		let res = scheduler.handle().fetch_page("a", None, &stop).await.unwrap();
		assert_eq!(res.unwrap_err(), PollError::NoCredentials);
		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn requests_after_shutdown_fail_without_panicking() {
		let scheduler = RequestScheduler::spawn(SharedApi::new(Some(timed(Duration::ZERO, false))), 8);
		let handle = scheduler.handle();
		scheduler.shutdown().await;

		let stop = CancellationToken::new();
		let res = handle.fetch_page("a", None, &stop).await.unwrap();
		assert_eq!(res.unwrap_err(), PollError::SchedulerStopped);
	}

	#[tokio::test(start_paused = true)]
	async fn requester_stop_does_not_wait_for_throttle() {
		let api = timed(Duration::from_secs(3600), false);
		let scheduler = RequestScheduler::spawn(SharedApi::new(Some(api.clone())), 8);
		let handle = scheduler.handle();
		let stop = CancellationToken::new();

		handle.fetch_page("a", None, &stop).await.unwrap().unwrap();

		let waiter = {
			let handle = handle.clone();
			let stop = stop.clone();
			tokio::spawn(async move { handle.fetch_page("a", Some("t"), &stop).await })
		};
		tokio::task::yield_now().await;
		stop.cancel();

		let res = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
		assert!(res.is_none());
		assert_eq!(api.calls.lock().len(), 1);

		scheduler.shutdown().await;
	}
}

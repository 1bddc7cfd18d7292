use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatmux_domain::{Resource, RoomId, SessionId};

use super::*;
use crate::{AdapterError, SourceAdapter};

/// Scriptable fake: resolution either always fails or always succeeds, and every page
/// carries one message.
struct FakeApi {
	resolves: AtomicUsize,
	pages: AtomicUsize,
	resolve_ok: bool,
	interval: Duration,
}

impl FakeApi {
	fn new(resolve_ok: bool) -> Arc<Self> {
		Arc::new(Self {
			resolves: AtomicUsize::new(0),
			pages: AtomicUsize::new(0),
			resolve_ok,
			interval: Duration::from_secs(1),
		})
	}
}

#[async_trait]
impl LiveChatApi for FakeApi {
	async fn resolve_live_chat(&self, room: &RoomId) -> Result<String, PollError> {
		self.resolves.fetch_add(1, Ordering::SeqCst);
		if self.resolve_ok {
			Ok(format!("chat-{room}"))
		} else {
			Err(PollError::NotLive(room.to_string()))
		}
	}

	async fn list_messages(&self, live_chat_id: &str, _page_token: Option<&str>) -> Result<LiveChatPage, PollError> {
		let n = self.pages.fetch_add(1, Ordering::SeqCst);
		let author = crate::UserRef {
			id: "u".into(),
			login: "u".into(),
			..Default::default()
		};
		Ok(LiveChatPage {
			items: vec![PolledMessage {
				update: crate::UpdateKind::New,
				published_at: None,
				message: crate::ChatMessage::new(format!("{live_chat_id}-{n}"), author, "hi"),
			}],
			next_page_token: Some(format!("page-{}", n + 1)),
			polling_interval: self.interval,
		})
	}
}

fn session(id: &str) -> SessionId {
	SessionId::new(id).unwrap()
}

fn adapter(api: Arc<FakeApi>) -> PollAdapter {
	let cfg = PollConfig {
		retry_cooldown: Duration::from_secs(30),
		..PollConfig::default()
	};
	PollAdapter::new(cfg, Some(api))
}

async fn wait_stopped(mut rx: tokio::sync::watch::Receiver<WorkerStatus>) {
	while !rx.borrow_and_update().is_stopped() {
		if rx.changed().await.is_err() {
			break;
		}
	}
}

#[tokio::test(start_paused = true)]
async fn repeated_resolution_failures_back_off_then_stop_cleanly() {
	let api = FakeApi::new(false);
	let adapter = adapter(api.clone());
	let mut streams = adapter.take_streams().unwrap();
	let room = Resource::youtube("UCfail").unwrap();

	adapter.register(&session("s1"), &room);
	let status = adapter.watch_worker(&room.room_id).unwrap();

	for _ in 0..3 {
		let err = streams.errors.recv().await.unwrap();
		assert!(matches!(err, AdapterError::Room { room: ref r, .. } if *r == room));
	}
	assert_eq!(adapter.worker_status(&room.room_id), Some(WorkerStatus::Backoff));
	assert_eq!(api.resolves.load(Ordering::SeqCst), 3);

	adapter.deregister(&session("s1"), &room);
	tokio::time::timeout(Duration::from_millis(10), wait_stopped(status))
		.await
		.expect("worker should stop without waiting out the cooldown");

	tokio::time::sleep(Duration::from_secs(120)).await;
	assert_eq!(api.resolves.load(Ordering::SeqCst), 3);
	assert_eq!(api.pages.load(Ordering::SeqCst), 0);
	assert!(adapter.active_rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_are_tagged_with_their_room() {
	let api = FakeApi::new(true);
	let adapter = adapter(api.clone());
	let mut streams = adapter.take_streams().unwrap();
	let room = Resource::youtube("UClive").unwrap();

	adapter.register(&session("s1"), &room);

	let first = streams.events.recv().await.unwrap();
	let second = streams.events.recv().await.unwrap();
	assert_eq!(first.routing_key, room);
	assert_eq!(second.routing_key, room);
	assert_eq!(first.message.id, "chat-UClive-0");
	assert_eq!(second.message.id, "chat-UClive-1");
	assert!(matches!(
		adapter.worker_status(&room.room_id),
		Some(WorkerStatus::Polling { .. })
	));

	adapter.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn one_worker_per_room_regardless_of_subscribers() {
	let api = FakeApi::new(true);
	let adapter = adapter(api.clone());
	let _streams = adapter.take_streams().unwrap();
	let room = Resource::youtube("UCshared").unwrap();

	adapter.register(&session("a"), &room);
	adapter.register(&session("b"), &room);
	adapter.register(&session("b"), &room);
	let status = adapter.watch_worker(&room.room_id).unwrap();

	tokio::time::sleep(Duration::from_millis(10)).await;
	assert_eq!(api.resolves.load(Ordering::SeqCst), 1);

	adapter.deregister(&session("a"), &room);
	assert!(adapter.worker_status(&room.room_id).is_some());
	assert_eq!(adapter.active_rooms(), vec![room.room_id.clone()]);

	adapter.deregister(&session("b"), &room);
	assert!(adapter.worker_status(&room.room_id).is_none());
	wait_stopped(status).await;

	// Unknown pairs are a no-op.
	adapter.deregister(&session("b"), &room);
	adapter.deregister(&session("zzz"), &room);
	assert!(adapter.active_rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reregister_starts_a_fresh_worker() {
	let api = FakeApi::new(true);
	let adapter = adapter(api.clone());
	let _streams = adapter.take_streams().unwrap();
	let room = Resource::youtube("UCagain").unwrap();

	adapter.register(&session("a"), &room);
	tokio::time::sleep(Duration::from_millis(10)).await;
	adapter.deregister(&session("a"), &room);
	adapter.register(&session("a"), &room);
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(api.resolves.load(Ordering::SeqCst), 2);
	assert!(adapter.worker_status(&room.room_id).is_some());
	adapter.close().await.unwrap();
}

#[tokio::test]
async fn other_platforms_are_ignored() {
	let adapter = adapter(FakeApi::new(true));
	adapter.register(&session("a"), &Resource::twitch("shroud").unwrap());
	assert!(adapter.active_rooms().is_empty());
	adapter.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_ends_streams() {
	let adapter = adapter(FakeApi::new(true));
	let mut streams = adapter.take_streams().unwrap();
	assert!(adapter.take_streams().is_none());

	adapter.register(&session("a"), &Resource::youtube("UCx").unwrap());
	adapter.close().await.unwrap();
	adapter.close().await.unwrap();

	while streams.events.recv().await.is_some() {}
	assert!(streams.errors.recv().await.is_none());

	// Registering after close does nothing.
	adapter.register(&session("a"), &Resource::youtube("UCy").unwrap());
	assert!(adapter.active_rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_back_off_until_installed() {
	let adapter = PollAdapter::new(PollConfig::default(), None);
	let mut streams = adapter.take_streams().unwrap();
	let room = Resource::youtube("UClater").unwrap();

	adapter.register(&session("a"), &room);
	let err = streams.errors.recv().await.unwrap();
	assert!(err.to_string().contains("credentials"));

	let api = FakeApi::new(true);
	adapter.set_api(api.clone());
	let ev = streams.events.recv().await.unwrap();
	assert_eq!(ev.routing_key, room);
	assert_eq!(api.resolves.load(Ordering::SeqCst), 1);

	adapter.close().await.unwrap();
}

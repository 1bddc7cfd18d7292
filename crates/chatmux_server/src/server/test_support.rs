use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chatmux_domain::{Platform, Resource, RoomId, SessionId};
use chatmux_platform::{
	AdapterError, AdapterSinks, AdapterStreams, ChatMessage, Envelope, SourceAdapter, SubscriberIndex, UpdateKind,
	adapter_channels,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	Register(SessionId, Resource),
	Deregister(SessionId, Resource),
}

/// In-memory adapter that records every call and lets tests push events.
pub struct RecordingAdapter {
	platform: Platform,
	calls: Mutex<Vec<Call>>,
	subscribers: Mutex<SubscriberIndex>,
	opens: AtomicUsize,
	closes: AtomicUsize,
	close_calls: AtomicUsize,
	sinks: Mutex<Option<AdapterSinks>>,
	streams: Mutex<Option<AdapterStreams>>,
}

impl RecordingAdapter {
	pub fn new(platform: Platform) -> Self {
		let (sinks, streams) = adapter_channels(64, 16);
		Self {
			platform,
			calls: Mutex::new(Vec::new()),
			subscribers: Mutex::new(SubscriberIndex::new()),
			opens: AtomicUsize::new(0),
			closes: AtomicUsize::new(0),
			close_calls: AtomicUsize::new(0),
			sinks: Mutex::new(Some(sinks)),
			streams: Mutex::new(Some(streams)),
		}
	}

	pub fn calls(&self) -> Vec<Call> {
		self.calls.lock().clone()
	}

	pub fn clear_calls(&self) {
		self.calls.lock().clear();
	}

	/// Platform subscriptions opened (first subscriber of a room).
	pub fn opens(&self) -> usize {
		self.opens.load(Ordering::SeqCst)
	}

	/// Platform subscriptions torn down (last subscriber left).
	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}

	pub fn close_calls(&self) -> usize {
		self.close_calls.load(Ordering::SeqCst)
	}

	pub fn is_open(&self, room: &Resource) -> bool {
		self.subscribers.lock().contains_room(&room.room_id)
	}

	/// Register calls minus deregister calls for `room`.
	pub fn net_registrations(&self, room: &Resource) -> i64 {
		self.calls.lock().iter().fold(0, |n, c| match c {
			Call::Register(_, r) if r == room => n + 1,
			Call::Deregister(_, r) if r == room => n - 1,
			_ => n,
		})
	}

	pub async fn emit(&self, env: Envelope) {
		let tx = self.sinks.lock().as_ref().map(|s| s.events.clone());
		if let Some(tx) = tx {
			tx.send(env).await.unwrap();
		}
	}

	pub fn fail(&self, err: AdapterError) {
		if let Some(sinks) = self.sinks.lock().as_ref() {
			sinks.report(err);
		}
	}
}

#[async_trait]
impl SourceAdapter for RecordingAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	fn register(&self, subscriber: &SessionId, resource: &Resource) {
		self.calls.lock().push(Call::Register(subscriber.clone(), resource.clone()));
		if self.subscribers.lock().add(&resource.room_id, subscriber) {
			self.opens.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn deregister(&self, subscriber: &SessionId, resource: &Resource) {
		self.calls.lock().push(Call::Deregister(subscriber.clone(), resource.clone()));
		if self.subscribers.lock().remove(&resource.room_id, subscriber) {
			self.closes.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn take_streams(&self) -> Option<AdapterStreams> {
		self.streams.lock().take()
	}

	fn active_rooms(&self) -> Vec<RoomId> {
		self.subscribers.lock().rooms()
	}

	async fn close(&self) -> Result<(), AdapterError> {
		self.close_calls.fetch_add(1, Ordering::SeqCst);
		self.sinks.lock().take();
		Ok(())
	}
}

pub fn session(id: &str) -> SessionId {
	SessionId::new(id).unwrap()
}

pub fn envelope(room: &Resource, id: &str) -> Envelope {
	Envelope::new(room.clone(), UpdateKind::New, ChatMessage::deleted(id))
}

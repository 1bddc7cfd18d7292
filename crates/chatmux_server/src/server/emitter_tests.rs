use std::sync::Arc;
use std::time::Duration;

use chatmux_domain::{Platform, Resource};
use chatmux_platform::{AdapterError, SourceAdapter};
use tokio::time::timeout;

use crate::server::emitter::{ComposedEmitter, EmitterConfig};
use crate::server::test_support::{RecordingAdapter, envelope};

fn start(adapters: &[Arc<RecordingAdapter>]) -> ComposedEmitter {
	let list = adapters
		.iter()
		.map(|a| Arc::clone(a) as Arc<dyn SourceAdapter>)
		.collect();
	ComposedEmitter::start(list, EmitterConfig { bus_capacity: 16 })
}

#[tokio::test]
async fn events_from_every_adapter_reach_the_bus() {
	let discord = Arc::new(RecordingAdapter::new(Platform::Discord));
	let twitch = Arc::new(RecordingAdapter::new(Platform::Twitch));
	let emitter = start(&[discord.clone(), twitch.clone()]);
	let mut bus = emitter.take_bus().unwrap();
	assert!(emitter.take_bus().is_none());

	discord.emit(envelope(&Resource::discord("g", "c").unwrap(), "d1")).await;
	twitch.emit(envelope(&Resource::twitch("x").unwrap(), "t1")).await;

	let mut ids = vec![bus.recv().await.unwrap().message.id, bus.recv().await.unwrap().message.id];
	ids.sort();
	assert_eq!(ids, vec!["d1", "t1"]);

	emitter.close().await;
}

#[tokio::test]
async fn adapter_errors_are_recorded_not_forwarded() {
	let youtube = Arc::new(RecordingAdapter::new(Platform::YouTube));
	let emitter = start(&[youtube.clone()]);
	let mut bus = emitter.take_bus().unwrap();

	youtube.fail(AdapterError::transport(Platform::YouTube, "quota exceeded"));

	for _ in 0..100 {
		if emitter.last_error(Platform::YouTube).is_some() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	let last = emitter.last_error(Platform::YouTube).unwrap();
	assert!(last.contains("quota exceeded"), "{last}");
	assert!(timeout(Duration::from_millis(30), bus.recv()).await.is_err());

	emitter.close().await;
}

#[tokio::test]
async fn close_closes_adapters_then_the_bus() {
	let discord = Arc::new(RecordingAdapter::new(Platform::Discord));
	let twitch = Arc::new(RecordingAdapter::new(Platform::Twitch));
	let emitter = start(&[discord.clone(), twitch.clone()]);
	let mut bus = emitter.take_bus().unwrap();

	emitter.close().await;
	assert_eq!(discord.close_calls(), 1);
	assert_eq!(twitch.close_calls(), 1);
	assert!(bus.recv().await.is_none());

	emitter.close().await;
	assert_eq!(discord.close_calls(), 2);
}

#[tokio::test]
async fn close_does_not_hang_on_an_undrained_bus() {
	let twitch = Arc::new(RecordingAdapter::new(Platform::Twitch));
	let emitter = ComposedEmitter::start(vec![twitch.clone() as Arc<dyn SourceAdapter>], EmitterConfig { bus_capacity: 1 });
	let room = Resource::twitch("x").unwrap();

	twitch.emit(envelope(&room, "1")).await;
	twitch.emit(envelope(&room, "2")).await;
	twitch.emit(envelope(&room, "3")).await;

	timeout(Duration::from_secs(1), emitter.close()).await.unwrap();
}

#[tokio::test]
async fn duplicate_platforms_keep_the_first_adapter() {
	let first = Arc::new(RecordingAdapter::new(Platform::Twitch));
	let second = Arc::new(RecordingAdapter::new(Platform::Twitch));
	let emitter = start(&[first.clone(), second.clone()]);

	assert_eq!(emitter.adapters().count(), 1);
	emitter.close().await;
	assert_eq!(first.close_calls(), 1);
	assert_eq!(second.close_calls(), 0);
}

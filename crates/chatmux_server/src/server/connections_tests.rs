use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatmux_domain::Resource;
use tokio::time::timeout;

use crate::server::connections::{ConnectionItem, ConnectionRegistry, ConnectionRegistryConfig};
use crate::server::test_support::{envelope, session};

fn registry(capacity: usize) -> ConnectionRegistry {
	ConnectionRegistry::new(ConnectionRegistryConfig {
		queue_capacity: capacity,
		debug_logs: false,
	})
}

fn text_of(item: ConnectionItem) -> String {
	match item {
		ConnectionItem::Envelope(env) => env.message.id.clone(),
		other => panic!("expected envelope, got: {other:?}"),
	}
}

#[tokio::test]
async fn first_and_last_hooks_follow_connection_count() {
	let reg = registry(8);
	let s = session("s");
	let firsts = AtomicUsize::new(0);
	let lasts = AtomicUsize::new(0);

	let a = reg.connect(&s, || {
		firsts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	let b = reg.connect(&s, || {
		firsts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	assert_eq!(firsts.load(Ordering::SeqCst), 1);
	assert_eq!(reg.connection_count(&s).await, 2);

	reg.disconnect(&s, a.id, || {
		lasts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	assert_eq!(lasts.load(Ordering::SeqCst), 0);

	reg.disconnect(&s, b.id, || {
		lasts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	assert_eq!(lasts.load(Ordering::SeqCst), 1);
	assert_eq!(reg.connection_count(&s).await, 0);

	// Disconnecting twice is harmless.
	reg.disconnect(&s, b.id, || {
		lasts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	assert_eq!(lasts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deliver_reaches_every_connection_of_the_session_only() {
	let reg = registry(8);
	let room = Resource::twitch("a").unwrap();
	let (s1, s2) = (session("s1"), session("s2"));

	let mut c1 = reg.connect(&s1, || {}).await;
	let mut c2 = reg.connect(&s1, || {}).await;
	let mut other = reg.connect(&s2, || {}).await;

	let env = Arc::new(envelope(&room, "m1"));
	assert_eq!(reg.deliver(&s1, &env).await, 2);

	assert_eq!(text_of(c1.rx.recv().await.unwrap()), "m1");
	assert_eq!(text_of(c2.rx.recv().await.unwrap()), "m1");
	let nothing = timeout(Duration::from_millis(50), other.rx.recv()).await;
	assert!(nothing.is_err(), "session s2 unexpectedly received an envelope");

	assert_eq!(reg.deliver(&session("nobody"), &env).await, 0);
}

#[tokio::test]
async fn full_queue_drops_the_envelope() {
	let reg = registry(1);
	let room = Resource::twitch("a").unwrap();
	let s = session("s");
	let mut conn = reg.connect(&s, || {}).await;

	assert_eq!(reg.deliver(&s, &Arc::new(envelope(&room, "a-1"))).await, 1);
	assert_eq!(reg.deliver(&s, &Arc::new(envelope(&room, "a-2"))).await, 0);

	assert_eq!(text_of(conn.rx.recv().await.unwrap()), "a-1");

	// A single-slot queue never has room for the marker behind a fresh envelope.
	assert_eq!(reg.deliver(&s, &Arc::new(envelope(&room, "a-3"))).await, 1);
	assert_eq!(text_of(conn.rx.recv().await.unwrap()), "a-3");
	assert!(conn.rx.try_recv().is_err());
}

#[tokio::test]
async fn lag_marker_follows_when_there_is_room() {
	let reg = registry(2);
	let room = Resource::twitch("a").unwrap();
	let s = session("s");
	let mut conn = reg.connect(&s, || {}).await;

	reg.deliver(&s, &Arc::new(envelope(&room, "a-1"))).await;
	reg.deliver(&s, &Arc::new(envelope(&room, "a-2"))).await;
	assert_eq!(reg.deliver(&s, &Arc::new(envelope(&room, "a-3"))).await, 0);

	assert_eq!(text_of(conn.rx.recv().await.unwrap()), "a-1");
	assert_eq!(text_of(conn.rx.recv().await.unwrap()), "a-2");

	assert_eq!(reg.deliver(&s, &Arc::new(envelope(&room, "a-4"))).await, 1);
	assert_eq!(text_of(conn.rx.recv().await.unwrap()), "a-4");
	match conn.rx.recv().await.unwrap() {
		ConnectionItem::Lagged { dropped } => assert_eq!(dropped, 1),
		other => panic!("expected lag marker, got: {other:?}"),
	}
}

#[tokio::test]
async fn dropped_receivers_are_pruned_on_connect() {
	let reg = registry(4);
	let s = session("s");
	let firsts = AtomicUsize::new(0);

	{
		let _gone = reg.connect(&s, || {
			firsts.fetch_add(1, Ordering::SeqCst);
		})
		.await;
	}
	assert_eq!(reg.connection_count(&s).await, 0);

	let _live = reg.connect(&s, || {
		firsts.fetch_add(1, Ordering::SeqCst);
	})
	.await;
	assert_eq!(firsts.load(Ordering::SeqCst), 2);
	assert_eq!(reg.connection_count(&s).await, 1);
}

use std::collections::HashSet;
use std::sync::Arc;

use chatmux_domain::{Resource, SessionId};
use chatmux_platform::SourceAdapter;
use proptest::prelude::*;

use crate::server::subscription_hub::{ResourceDiff, SubscriptionHub};
use crate::server::test_support::{Call, RecordingAdapter};

fn session(id: &str) -> SessionId {
	SessionId::new(id).unwrap()
}

fn discord(g: &str, c: &str) -> Resource {
	Resource::discord(g, c).unwrap()
}

fn set(items: &[Resource]) -> HashSet<Resource> {
	items.iter().cloned().collect()
}

fn discord_hub() -> (Arc<RecordingAdapter>, SubscriptionHub) {
	let adapter = Arc::new(RecordingAdapter::new(chatmux_domain::Platform::Discord));
	let hub = SubscriptionHub::new(Arc::clone(&adapter) as Arc<dyn SourceAdapter>);
	(adapter, hub)
}

#[test]
fn shared_room_opens_once_and_closes_with_last_session() {
	let (adapter, hub) = discord_hub();
	let room = discord("g1", "c1");
	let (s1, s2) = (session("s1"), session("s2"));

	hub.register_session_resources(&s1, &set(&[room.clone()]));
	hub.register_session_resources(&s2, &set(&[room.clone()]));
	assert_eq!(adapter.opens(), 1);
	assert_eq!(hub.get_session_ids(&room), HashSet::from([s1.clone(), s2.clone()]));

	hub.register_session_resources(&s1, &HashSet::new());
	assert_eq!(adapter.closes(), 0);
	assert_eq!(hub.get_session_ids(&room), HashSet::from([s2.clone()]));

	hub.register_session_resources(&s2, &HashSet::new());
	assert_eq!(adapter.closes(), 1);
	assert!(hub.get_session_ids(&room).is_empty());
	assert!(adapter.active_rooms().is_empty());
	assert_eq!(hub.room_count(), 0);
}

#[test]
fn diff_only_touches_changed_rooms() {
	let (adapter, hub) = discord_hub();
	let s = session("s");
	let (a, b, c) = (discord("g", "a"), discord("g", "b"), discord("g", "c"));

	hub.register_session_resources(&s, &set(&[a.clone(), b.clone()]));
	adapter.clear_calls();

	let diff = hub.register_session_resources(&s, &set(&[b.clone(), c.clone()]));
	assert_eq!(
		diff,
		ResourceDiff {
			kept: [b.clone()].into(),
			removed: [a.clone()].into(),
			added: [c.clone()].into(),
		}
	);

	let calls = adapter.calls();
	assert_eq!(calls.len(), 2);
	assert!(calls.contains(&Call::Deregister(s.clone(), a)));
	assert!(calls.contains(&Call::Register(s.clone(), c)));
}

#[test]
fn repeating_the_same_set_is_a_noop() {
	let (adapter, hub) = discord_hub();
	let s = session("s");
	let rooms = set(&[discord("g", "a"), discord("g", "b")]);

	hub.register_session_resources(&s, &rooms);
	adapter.clear_calls();

	let diff = hub.register_session_resources(&s, &rooms);
	assert!(diff.is_noop());
	assert_eq!(diff.kept.len(), 2);
	assert!(adapter.calls().is_empty());
}

#[test]
fn remove_session_deregisters_and_forgets() {
	let (adapter, hub) = discord_hub();
	let s = session("s");
	let room = discord("g", "a");

	hub.add_session(&s);
	hub.add_session(&s);
	assert!(hub.has_session(&s));
	assert!(adapter.calls().is_empty());

	hub.register_session_resources(&s, &set(&[room.clone()]));
	let diff = hub.remove_session(&s);
	assert_eq!(diff.removed, [room.clone()].into());
	assert!(!hub.has_session(&s));
	assert!(hub.get_session_ids(&room).is_empty());
	assert_eq!(adapter.closes(), 1);

	// Unknown sessions are fine.
	hub.remove_session(&session("ghost"));
	assert_eq!(adapter.calls().len(), 2);
}

#[test]
fn foreign_platform_resources_are_ignored() {
	let (adapter, hub) = discord_hub();
	let s = session("s");

	let diff = hub.register_session_resources(&s, &set(&[Resource::twitch("shroud").unwrap()]));
	assert!(diff.is_noop());
	assert!(adapter.calls().is_empty());
	assert!(hub.session_resources(&s).is_empty());
}

#[derive(Debug, Clone)]
enum Op {
	Register(usize, Vec<usize>),
	Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0..4usize, proptest::collection::vec(0..5usize, 0..4)).prop_map(|(s, rooms)| Op::Register(s, rooms)),
		(0..4usize).prop_map(Op::Remove),
	]
}

proptest! {
	#[test]
	fn index_stays_symmetric_and_adapter_counts_match(ops in proptest::collection::vec(op_strategy(), 1..40)) {
		let (adapter, hub) = discord_hub();
		let sessions: Vec<SessionId> = (0..4).map(|i| session(&format!("s{i}"))).collect();
		let rooms: Vec<Resource> = (0..5).map(|i| discord("g", &format!("c{i}"))).collect();

		for op in ops {
			match op {
				Op::Register(s, picks) => {
					let wanted: HashSet<Resource> = picks.iter().map(|i| rooms[*i].clone()).collect();
					hub.register_session_resources(&sessions[s], &wanted);
				}
				Op::Remove(s) => {
					hub.remove_session(&sessions[s]);
				}
			}
		}

		for room in &rooms {
			let interested = hub.get_session_ids(room);
			for s in &sessions {
				prop_assert_eq!(hub.session_resources(s).contains(room), interested.contains(s));
			}
			prop_assert_eq!(adapter.net_registrations(room), interested.len() as i64);
			prop_assert_eq!(adapter.is_open(room), !interested.is_empty());
		}
	}
}

#[test]
fn concurrent_sessions_on_one_room_keep_the_index_consistent() {
	use std::sync::atomic::{AtomicBool, Ordering};

	let (adapter, hub) = discord_hub();
	let shared = discord("g", "shared");
	let sessions: Vec<SessionId> = (0..8).map(|i| session(&format!("s{i}"))).collect();
	let writing = AtomicBool::new(true);

	std::thread::scope(|scope| {
		let writers: Vec<_> = sessions
			.iter()
			.enumerate()
			.map(|(i, s)| {
				let (hub, shared) = (&hub, &shared);
				scope.spawn(move || {
					let own = discord("g", &format!("own{i}"));
					for round in 0..200 {
						let mut wanted = set(&[own.clone()]);
						if round % 2 == i % 2 {
							wanted.insert(shared.clone());
						}
						hub.register_session_resources(s, &wanted);
					}
				})
			})
			.collect();

		scope.spawn(|| {
			while writing.load(Ordering::SeqCst) {
				let ids = hub.get_session_ids(&shared);
				assert!(ids.len() <= sessions.len());
				assert!(ids.iter().all(|id| sessions.contains(id)));
			}
		});

		for w in writers {
			w.join().unwrap();
		}
		writing.store(false, Ordering::SeqCst);
	});

	// Round 199 is odd, so only odd-numbered sessions end up on the shared room.
	let expected: HashSet<SessionId> = sessions.iter().skip(1).step_by(2).cloned().collect();
	let interested = hub.get_session_ids(&shared);
	assert_eq!(interested, expected);
	for s in &sessions {
		assert_eq!(hub.session_resources(s).contains(&shared), interested.contains(s));
	}
	assert_eq!(adapter.net_registrations(&shared), interested.len() as i64);
	assert_eq!(adapter.is_open(&shared), !interested.is_empty());
	for i in 0..sessions.len() {
		let own = discord("g", &format!("own{i}"));
		assert_eq!(adapter.net_registrations(&own), 1);
		assert!(adapter.is_open(&own));
	}
}

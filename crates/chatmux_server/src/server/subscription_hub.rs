#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chatmux_domain::{Platform, Resource, SessionId};
use chatmux_platform::SourceAdapter;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Result of replacing a session's interest set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDiff {
	pub kept: BTreeSet<Resource>,
	pub removed: BTreeSet<Resource>,
	pub added: BTreeSet<Resource>,
}

impl ResourceDiff {
	/// Partition `old ∪ new` into kept / removed / added.
	pub fn between(old: &HashSet<Resource>, new: &HashSet<Resource>) -> Self {
		Self {
			kept: old.intersection(new).cloned().collect(),
			removed: old.difference(new).cloned().collect(),
			added: new.difference(old).cloned().collect(),
		}
	}

	pub fn is_noop(&self) -> bool {
		self.removed.is_empty() && self.added.is_empty()
	}
}

#[derive(Debug, Default)]
struct Index {
	session_rooms: HashMap<SessionId, HashSet<Resource>>,
	room_sessions: HashMap<Resource, HashSet<SessionId>>,
}

impl Index {
	fn link(&mut self, session: &SessionId, room: &Resource) {
		self.session_rooms
			.entry(session.clone())
			.or_default()
			.insert(room.clone());
		self.room_sessions
			.entry(room.clone())
			.or_default()
			.insert(session.clone());
	}

	fn unlink(&mut self, session: &SessionId, room: &Resource) {
		if let Some(rooms) = self.session_rooms.get_mut(session) {
			rooms.remove(room);
		}
		if let Some(sessions) = self.room_sessions.get_mut(room) {
			sessions.remove(session);
			if sessions.is_empty() {
				self.room_sessions.remove(room);
			}
		}
	}
}

/// Per-platform session <-> room interest index.
///
/// Every index change is mirrored into the platform adapter as a per-session
/// `register`/`deregister`; the adapter's own reference count decides whether the
/// platform subscription opens or closes. The write lock is held across the diff and
/// the adapter calls, which are non-blocking.
pub struct SubscriptionHub {
	platform: Platform,
	adapter: Arc<dyn SourceAdapter>,
	index: RwLock<Index>,
}

impl SubscriptionHub {
	pub fn new(adapter: Arc<dyn SourceAdapter>) -> Self {
		Self {
			platform: adapter.platform(),
			adapter,
			index: RwLock::new(Index::default()),
		}
	}

	pub fn platform(&self) -> Platform {
		self.platform
	}

	/// Ensure `session` is known, with no subscriptions if it is new.
	pub fn add_session(&self, session: &SessionId) {
		self.index.write().session_rooms.entry(session.clone()).or_default();
	}

	/// Replace the rooms `session` is interested in on this platform.
	///
	/// Resources of other platforms are ignored.
	pub fn register_session_resources(&self, session: &SessionId, resources: &HashSet<Resource>) -> ResourceDiff {
		let platform = self.platform;
		let new: HashSet<Resource> = resources
			.iter()
			.filter(|r| {
				if r.platform == platform {
					return true;
				}
				warn!(%platform, room = %r, %session, "resource for another platform passed to hub; ignoring");
				false
			})
			.cloned()
			.collect();

		let mut index = self.index.write();
		let diff = self.apply(&mut index, session, &new);
		index.session_rooms.entry(session.clone()).or_default();
		diff
	}

	/// Drop every subscription of `session`, then forget it.
	pub fn remove_session(&self, session: &SessionId) -> ResourceDiff {
		let mut index = self.index.write();
		let diff = self.apply(&mut index, session, &HashSet::new());
		index.session_rooms.remove(session);
		diff
	}

	fn apply(&self, index: &mut Index, session: &SessionId, new: &HashSet<Resource>) -> ResourceDiff {
		let platform = self.platform;
		let old = index.session_rooms.get(session).cloned().unwrap_or_default();
		let diff = ResourceDiff::between(&old, new);

		for room in &diff.kept {
			debug!(%platform, %session, %room, "subscription kept");
		}
		for room in &diff.removed {
			info!(%platform, %session, %room, "-- subscription");
			self.adapter.deregister(session, room);
			index.unlink(session, room);
		}
		for room in &diff.added {
			info!(%platform, %session, %room, "++ subscription");
			self.adapter.register(session, room);
			index.link(session, room);
		}

		metrics::gauge!("chatmux_hub_rooms", "platform" => platform.as_str()).set(index.room_sessions.len() as f64);
		diff
	}

	/// Sessions currently interested in `room`.
	pub fn get_session_ids(&self, room: &Resource) -> HashSet<SessionId> {
		self.index.read().room_sessions.get(room).cloned().unwrap_or_default()
	}

	/// Rooms `session` is currently interested in.
	pub fn session_resources(&self, session: &SessionId) -> HashSet<Resource> {
		self.index.read().session_rooms.get(session).cloned().unwrap_or_default()
	}

	pub fn has_session(&self, session: &SessionId) -> bool {
		self.index.read().session_rooms.contains_key(session)
	}

	/// Number of rooms with at least one interested session.
	pub fn room_count(&self) -> usize {
		self.index.read().room_sessions.len()
	}
}

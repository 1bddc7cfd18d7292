#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use chatmux_domain::{RoomId, SessionId};

/// Adapter-side `room -> subscribers` reference count.
///
/// Independent of the hub's session index: this one only answers "is anyone at all
/// listening to this room", which decides whether the platform subscription is open.
#[derive(Debug, Default)]
pub struct SubscriberIndex {
	rooms: HashMap<RoomId, HashSet<SessionId>>,
}

impl SubscriberIndex {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a subscriber. Returns `true` when this is the room's first subscriber.
	pub fn add(&mut self, room: &RoomId, subscriber: &SessionId) -> bool {
		match self.rooms.get_mut(room) {
			Some(subs) => {
				subs.insert(subscriber.clone());
				false
			}
			None => {
				self.rooms
					.insert(room.clone(), HashSet::from([subscriber.clone()]));
				true
			}
		}
	}

	/// Remove a subscriber. Returns `true` when the room just lost its last subscriber.
	///
	/// Unknown room/subscriber pairs are a no-op.
	pub fn remove(&mut self, room: &RoomId, subscriber: &SessionId) -> bool {
		let Some(subs) = self.rooms.get_mut(room) else {
			return false;
		};
		if !subs.remove(subscriber) {
			return false;
		}
		if subs.is_empty() {
			self.rooms.remove(room);
			return true;
		}
		false
	}

	pub fn subscriber_count(&self, room: &RoomId) -> usize {
		self.rooms.get(room).map(HashSet::len).unwrap_or(0)
	}

	pub fn contains_room(&self, room: &RoomId) -> bool {
		self.rooms.contains_key(room)
	}

	/// Rooms with at least one subscriber.
	pub fn rooms(&self) -> Vec<RoomId> {
		self.rooms.keys().cloned().collect()
	}

	/// Forget everything, returning the rooms that were active.
	pub fn clear(&mut self) -> Vec<RoomId> {
		self.rooms.drain().map(|(room, _)| room).collect()
	}
}

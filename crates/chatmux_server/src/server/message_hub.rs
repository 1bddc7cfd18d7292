#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chatmux_domain::{Platform, Resource, SessionId};
use chatmux_platform::SourceAdapter;
use parking_lot::RwLock;
use tracing::debug;

use crate::server::subscription_hub::{ResourceDiff, SubscriptionHub};

/// Every platform's hub behind one session-level API.
///
/// A platform without a configured adapter has no hub; its resources are dropped.
pub struct MessageHub {
	discord: Option<SubscriptionHub>,
	youtube: Option<SubscriptionHub>,
	twitch: Option<SubscriptionHub>,
	sessions: RwLock<HashSet<SessionId>>,
}

impl MessageHub {
	pub fn new<'a>(adapters: impl IntoIterator<Item = &'a Arc<dyn SourceAdapter>>) -> Self {
		let mut hub = Self {
			discord: None,
			youtube: None,
			twitch: None,
			sessions: RwLock::new(HashSet::new()),
		};
		for adapter in adapters {
			let slot = match adapter.platform() {
				Platform::Discord => &mut hub.discord,
				Platform::YouTube => &mut hub.youtube,
				Platform::Twitch => &mut hub.twitch,
			};
			*slot = Some(SubscriptionHub::new(Arc::clone(adapter)));
		}
		hub
	}

	pub fn hub(&self, platform: Platform) -> Option<&SubscriptionHub> {
		match platform {
			Platform::Discord => self.discord.as_ref(),
			Platform::YouTube => self.youtube.as_ref(),
			Platform::Twitch => self.twitch.as_ref(),
		}
	}

	fn hubs(&self) -> impl Iterator<Item = &SubscriptionHub> {
		[&self.discord, &self.youtube, &self.twitch].into_iter().flatten()
	}

	pub fn add_session(&self, session: &SessionId) {
		self.sessions.write().insert(session.clone());
		for hub in self.hubs() {
			hub.add_session(session);
		}
	}

	/// Replace `session`'s interest across every platform.
	pub fn register_session_resources(
		&self,
		session: &SessionId,
		resources: &HashSet<Resource>,
	) -> HashMap<Platform, ResourceDiff> {
		let mut by_platform: HashMap<Platform, HashSet<Resource>> = HashMap::new();
		for resource in resources {
			by_platform
				.entry(resource.platform)
				.or_default()
				.insert(resource.clone());
		}

		self.sessions.write().insert(session.clone());

		let mut diffs = HashMap::new();
		for platform in Platform::ALL {
			let wanted = by_platform.remove(&platform).unwrap_or_default();
			match self.hub(platform) {
				Some(hub) => {
					diffs.insert(platform, hub.register_session_resources(session, &wanted));
				}
				None if !wanted.is_empty() => {
					debug!(%platform, %session, rooms = wanted.len(), "no adapter for platform; ignoring resources");
				}
				None => {}
			}
		}
		diffs
	}

	pub fn remove_session(&self, session: &SessionId) {
		self.sessions.write().remove(session);
		for hub in self.hubs() {
			hub.remove_session(session);
		}
	}

	/// Sessions interested in `room`; empty when its platform is not configured.
	pub fn get_session_ids(&self, room: &Resource) -> HashSet<SessionId> {
		self.hub(room.platform)
			.map(|hub| hub.get_session_ids(room))
			.unwrap_or_default()
	}

	pub fn has_session(&self, session: &SessionId) -> bool {
		self.sessions.read().contains(session)
	}

	pub fn sessions(&self) -> Vec<SessionId> {
		self.sessions.read().iter().cloned().collect()
	}
}

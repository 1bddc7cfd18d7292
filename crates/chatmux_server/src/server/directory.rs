#![forbid(unsafe_code)]

//! Desired resources per session, and the poller that pushes changes into the hub.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use chatmux_domain::{Resource, SessionId};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::connections::ConnectionRegistry;
use crate::server::message_hub::MessageHub;

pub type Snapshot = HashMap<SessionId, HashSet<Resource>>;

/// Source of truth for which sessions exist and what they want.
#[async_trait]
pub trait SessionDirectory: Send + Sync + 'static {
	/// Desired resources of `session`; `None` for an unknown session.
	fn desired_resources(&self, session: &SessionId) -> Option<HashSet<Resource>>;

	/// Reload and return the sessions whose desired set changed (including removals).
	async fn refresh(&self) -> anyhow::Result<Vec<SessionId>>;
}

/// Directory backed by a TOML file:
///
/// ```toml
/// [[sessions]]
/// id = "overlay-1"
/// resources = ["twitch:shroud", "discord:1234/5678"]
/// ```
pub struct FileDirectory {
	path: PathBuf,
	snapshot: RwLock<Snapshot>,
}

impl FileDirectory {
	/// Load `path` once. A missing file is an empty directory.
	pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let path = path.into();
		let snapshot = read_directory(&path).await?;
		info!(path = %path.display(), sessions = snapshot.len(), "session directory loaded");
		Ok(Self {
			path,
			snapshot: RwLock::new(snapshot),
		})
	}

	pub fn session_count(&self) -> usize {
		self.snapshot.read().len()
	}
}

#[async_trait]
impl SessionDirectory for FileDirectory {
	fn desired_resources(&self, session: &SessionId) -> Option<HashSet<Resource>> {
		self.snapshot.read().get(session).cloned()
	}

	async fn refresh(&self) -> anyhow::Result<Vec<SessionId>> {
		let fresh = read_directory(&self.path).await?;
		let mut snapshot = self.snapshot.write();
		let changed = changed_sessions(&snapshot, &fresh);
		*snapshot = fresh;
		Ok(changed)
	}
}

#[derive(Debug, Default, Deserialize)]
struct FileSessions {
	#[serde(default)]
	sessions: Vec<FileSession>,
}

#[derive(Debug, Deserialize)]
struct FileSession {
	id: String,
	#[serde(default)]
	resources: Vec<String>,
}

async fn read_directory(path: &Path) -> anyhow::Result<Snapshot> {
	match tokio::fs::read_to_string(path).await {
		Ok(s) => parse_directory(&s).with_context(|| format!("parse session directory {}", path.display())),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			warn!(path = %path.display(), "session directory file not found; no sessions");
			Ok(Snapshot::new())
		}
		Err(e) => Err(anyhow!(e).context(format!("read session directory {}", path.display()))),
	}
}

/// Parse the directory file. Malformed ids and resources are skipped with a warning.
pub fn parse_directory(s: &str) -> anyhow::Result<Snapshot> {
	let file: FileSessions = toml::from_str(s).context("parse TOML")?;

	let mut out = Snapshot::new();
	for entry in file.sessions {
		let session = match SessionId::new(entry.id.trim()) {
			Ok(s) => s,
			Err(e) => {
				warn!(id = %entry.id, error = %e, "skipping session with invalid id");
				continue;
			}
		};

		let resources = out.entry(session.clone()).or_default();
		for raw in entry.resources {
			match Resource::parse(&raw) {
				Ok(r) => {
					resources.insert(r);
				}
				Err(e) => warn!(%session, resource = %raw, error = %e, "skipping invalid resource"),
			}
		}
	}
	Ok(out)
}

fn changed_sessions(old: &Snapshot, new: &Snapshot) -> Vec<SessionId> {
	let mut changed: Vec<SessionId> = new
		.iter()
		.filter(|(id, rs)| old.get(*id) != Some(*rs))
		.map(|(id, _)| id.clone())
		.collect();
	changed.extend(old.keys().filter(|id| !new.contains_key(*id)).cloned());
	changed.sort();
	changed
}

/// Re-read the directory every `every` and re-register connected sessions whose desired
/// set changed.
pub fn spawn_directory_poller(
	directory: Arc<dyn SessionDirectory>,
	hub: Arc<MessageHub>,
	connections: ConnectionRegistry,
	every: Duration,
	stop: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(every);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = stop.cancelled() => break,
				_ = ticker.tick() => {}
			}

			let changed = match directory.refresh().await {
				Ok(changed) => changed,
				Err(e) => {
					warn!(error = %format!("{e:#}"), "session directory refresh failed");
					continue;
				}
			};
			if !changed.is_empty() {
				info!(sessions = changed.len(), "session directory changes detected");
			}

			for session in changed {
				let wanted = directory.desired_resources(&session).unwrap_or_default();
				let applied = connections
					.if_connected(&session, || {
						hub.register_session_resources(&session, &wanted);
					})
					.await;
				if !applied {
					debug!(%session, "session not connected; change applies on next connect");
				}
			}
		}
		debug!("directory poller stopped");
	})
}

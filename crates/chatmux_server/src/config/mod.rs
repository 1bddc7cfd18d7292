#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatmux_domain::Platform;
use chatmux_platform::SecretString;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::emitter::DEFAULT_BUS_CAPACITY;

const DEFAULT_WS_BIND: &str = "127.0.0.1:8000";
const DEFAULT_CONNECTION_QUEUE_CAPACITY: usize = 256;
const DEFAULT_YOUTUBE_RETRY_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_DIRECTORY_REFRESH: Duration = Duration::from_secs(10);

/// `~/.chatmux`.
fn config_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatmux"))
}

/// Default config path: `~/.chatmux/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(config_dir()?.join("config.toml"))
}

/// Default session directory: `~/.chatmux/sessions.toml`.
pub fn default_directory_path() -> anyhow::Result<PathBuf> {
	Ok(config_dir()?.join("sessions.toml"))
}

/// Load the server config from TOML at `path`, then apply `CHATMUX_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	normalize(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub sources: SourcesSettings,
	pub discord: DiscordSettings,
	pub youtube: YouTubeSettings,
	pub twitch: TwitchSettings,
	pub directory: DirectorySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket transport bind address (host:port).
	pub ws_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Outbound queue length per client connection.
	pub connection_queue_capacity: usize,
	/// Capacity of the shared envelope bus.
	pub bus_capacity: usize,
	/// Per-envelope routing and per-connection queue debug logs.
	pub debug_log_events: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			ws_bind: DEFAULT_WS_BIND.to_string(),
			metrics_bind: None,
			health_bind: None,
			connection_queue_capacity: DEFAULT_CONNECTION_QUEUE_CAPACITY,
			bus_capacity: DEFAULT_BUS_CAPACITY,
			debug_log_events: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SourcesSettings {
	pub enabled: Vec<Platform>,
}

impl Default for SourcesSettings {
	fn default() -> Self {
		Self {
			enabled: Platform::ALL.to_vec(),
		}
	}
}

impl SourcesSettings {
	pub fn is_enabled(&self, platform: Platform) -> bool {
		self.enabled.contains(&platform)
	}
}

#[derive(Debug, Clone, Default)]
pub struct DiscordSettings {
	/// Bot token. Without it the Discord source stays off.
	pub token: Option<SecretString>,
	pub gateway_url: Option<String>,
	pub intents: Option<u64>,
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	/// Data API key (`?key=`).
	pub api_key: Option<SecretString>,
	/// OAuth bearer token; used when no API key is set.
	pub access_token: Option<SecretString>,
	pub base_url: Option<String>,
	/// Flat wait between failed resolutions of a room.
	pub retry_cooldown: Duration,
}

impl Default for YouTubeSettings {
	fn default() -> Self {
		Self {
			api_key: None,
			access_token: None,
			base_url: None,
			retry_cooldown: DEFAULT_YOUTUBE_RETRY_COOLDOWN,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	/// Login for authenticated chat; anonymous when absent.
	pub username: Option<String>,
	pub access_token: Option<SecretString>,
	pub irc_url: Option<String>,
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
	/// Session directory file; `~/.chatmux/sessions.toml` when unset.
	pub path: Option<PathBuf>,
	pub refresh: Duration,
}

impl Default for DirectorySettings {
	fn default() -> Self {
		Self {
			path: None,
			refresh: DEFAULT_DIRECTORY_REFRESH,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	sources: FileSourcesSettings,

	#[serde(default)]
	discord: FileDiscordSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	directory: FileDirectorySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	ws_bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	connection_queue_capacity: Option<usize>,
	bus_capacity: Option<usize>,
	debug_log_events: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSourcesSettings {
	enabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDiscordSettings {
	token: Option<String>,
	gateway_url: Option<String>,
	intents: Option<u64>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_key: Option<String>,
	access_token: Option<String>,
	base_url: Option<String>,
	retry_cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	username: Option<String>,
	access_token: Option<String>,
	irc_url: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	path: Option<String>,
	refresh_secs: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_blank(v).map(SecretString::new)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server = ServerSettings {
			ws_bind: non_blank(file.server.ws_bind).unwrap_or_else(|| DEFAULT_WS_BIND.to_string()),
			metrics_bind: non_blank(file.server.metrics_bind),
			health_bind: non_blank(file.server.health_bind),
			connection_queue_capacity: file
				.server
				.connection_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(DEFAULT_CONNECTION_QUEUE_CAPACITY),
			bus_capacity: file
				.server
				.bus_capacity
				.filter(|v| *v > 0)
				.unwrap_or(DEFAULT_BUS_CAPACITY),
			debug_log_events: file.server.debug_log_events.unwrap_or(false),
		};

		let sources = match file.sources.enabled {
			Some(names) => SourcesSettings {
				enabled: parse_sources(names.iter().map(String::as_str)),
			},
			None => SourcesSettings::default(),
		};

		Self {
			server,
			sources,
			discord: DiscordSettings {
				token: secret(file.discord.token),
				gateway_url: non_blank(file.discord.gateway_url),
				intents: file.discord.intents,
				reconnect_min_delay: file.discord.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.discord.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			youtube: YouTubeSettings {
				api_key: secret(file.youtube.api_key),
				access_token: secret(file.youtube.access_token),
				base_url: non_blank(file.youtube.base_url),
				retry_cooldown: file
					.youtube
					.retry_cooldown_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_YOUTUBE_RETRY_COOLDOWN),
			},
			twitch: TwitchSettings {
				username: non_blank(file.twitch.username),
				access_token: secret(file.twitch.access_token),
				irc_url: non_blank(file.twitch.irc_url),
				reconnect_min_delay: file.twitch.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.twitch.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			directory: DirectorySettings {
				path: non_blank(file.directory.path).map(PathBuf::from),
				refresh: file
					.directory
					.refresh_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_DIRECTORY_REFRESH),
			},
		}
	}
}

/// Platform names in order, deduplicated. Unknown names are logged and skipped.
fn parse_sources<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Platform> {
	let mut out = Vec::new();
	for name in names {
		let name = name.trim();
		if name.is_empty() {
			continue;
		}
		match name.parse::<Platform>() {
			Ok(p) if !out.contains(&p) => out.push(p),
			Ok(_) => {}
			Err(_) => warn!(source = %name, "unknown source in [sources].enabled; ignoring"),
		}
	}
	out
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
	let number = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());

	if let Some(v) = text("CHATMUX_WS_BIND") {
		cfg.server.ws_bind = v;
		info!("server config: ws_bind overridden by env");
	}

	if let Some(v) = text("CHATMUX_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("CHATMUX_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(capacity) = number("CHATMUX_CONNECTION_QUEUE_CAPACITY").filter(|v| *v > 0) {
		cfg.server.connection_queue_capacity = capacity as usize;
		info!(capacity, "server config: connection_queue_capacity overridden by env");
	}

	if let Some(v) = text("CHATMUX_DEBUG_LOG_EVENTS") {
		cfg.server.debug_log_events = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
		info!(enabled = cfg.server.debug_log_events, "server config: debug_log_events overridden by env");
	}

	if let Some(v) = text("CHATMUX_SOURCES") {
		cfg.sources.enabled = parse_sources(v.split(','));
		info!(sources = ?cfg.sources.enabled, "sources: enabled overridden by env");
	}

	if let Some(v) = text("CHATMUX_DISCORD_TOKEN") {
		cfg.discord.token = Some(SecretString::new(v));
		info!("discord config: token overridden by env");
	}

	if let Some(v) = text("CHATMUX_DISCORD_GATEWAY_URL") {
		cfg.discord.gateway_url = Some(v);
		info!("discord config: gateway_url overridden by env");
	}

	if let Some(v) = text("CHATMUX_YOUTUBE_API_KEY") {
		cfg.youtube.api_key = Some(SecretString::new(v));
		info!("youtube config: api_key overridden by env");
	}

	if let Some(v) = text("CHATMUX_YOUTUBE_ACCESS_TOKEN") {
		cfg.youtube.access_token = Some(SecretString::new(v));
		info!("youtube config: access_token overridden by env");
	}

	if let Some(v) = text("CHATMUX_YOUTUBE_BASE_URL") {
		cfg.youtube.base_url = Some(v);
		info!("youtube config: base_url overridden by env");
	}

	if let Some(secs) = number("CHATMUX_YOUTUBE_RETRY_COOLDOWN_SECS").filter(|v| *v > 0) {
		cfg.youtube.retry_cooldown = Duration::from_secs(secs);
		info!(secs, "youtube config: retry_cooldown overridden by env");
	}

	if let Some(v) = text("CHATMUX_TWITCH_USERNAME") {
		cfg.twitch.username = Some(v);
		info!("twitch config: username overridden by env");
	}

	if let Some(v) = text("CHATMUX_TWITCH_ACCESS_TOKEN") {
		cfg.twitch.access_token = Some(SecretString::new(v));
		info!("twitch config: access_token overridden by env");
	}

	if let Some(v) = text("CHATMUX_TWITCH_IRC_URL") {
		cfg.twitch.irc_url = Some(v);
		info!("twitch config: irc_url overridden by env");
	}

	if let Some(ms) = number("CHATMUX_TWITCH_RECONNECT_MIN_DELAY_MS") {
		cfg.twitch.reconnect_min_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_min_delay overridden by env");
	}

	if let Some(ms) = number("CHATMUX_TWITCH_RECONNECT_MAX_DELAY_MS") {
		cfg.twitch.reconnect_max_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_max_delay overridden by env");
	}

	if let Some(v) = text("CHATMUX_DIRECTORY_PATH") {
		cfg.directory.path = Some(PathBuf::from(v));
		info!("directory config: path overridden by env");
	}

	if let Some(secs) = number("CHATMUX_DIRECTORY_REFRESH_SECS").filter(|v| *v > 0) {
		cfg.directory.refresh = Duration::from_secs(secs);
		info!(secs, "directory config: refresh overridden by env");
	}
}

/// Fix up inconsistent settings after all sources are merged.
fn normalize(cfg: &mut ServerConfig) {
	swap_if_inverted(
		"discord",
		&mut cfg.discord.reconnect_min_delay,
		&mut cfg.discord.reconnect_max_delay,
	);
	swap_if_inverted(
		"twitch",
		&mut cfg.twitch.reconnect_min_delay,
		&mut cfg.twitch.reconnect_max_delay,
	);

	if cfg.twitch.access_token.is_some() && cfg.twitch.username.is_none() {
		warn!("twitch config: access_token without username; connecting anonymously");
		cfg.twitch.access_token = None;
	}
}

fn swap_if_inverted(section: &'static str, min: &mut Option<Duration>, max: &mut Option<Duration>) {
	if let (Some(lo), Some(hi)) = (*min, *max)
		&& lo > hi
	{
		warn!(
			section,
			min_ms = lo.as_millis(),
			max_ms = hi.as_millis(),
			"reconnect_min_delay > reconnect_max_delay; swapping"
		);
		*min = Some(hi);
		*max = Some(lo);
	}
}

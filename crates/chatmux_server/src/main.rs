#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chatmux_domain::Platform;
use chatmux_platform::SourceAdapter;
use chatmux_platform::gateway::{DiscordGateway, DiscordGatewayConfig, GatewayAdapter, GatewayConfig};
use chatmux_platform::irc::{IrcAdapter, IrcConfig, IrcCredentials, TwitchIrcConnector};
use chatmux_platform::poll::{DEFAULT_YOUTUBE_BASE_URL, PollAdapter, PollConfig, YouTubeAuth, YouTubeClient};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::connections::{ConnectionRegistry, ConnectionRegistryConfig};
use crate::server::directory::{FileDirectory, SessionDirectory, spawn_directory_poller};
use crate::server::dispatcher::{DispatcherConfig, spawn_dispatcher};
use crate::server::emitter::{ComposedEmitter, EmitterConfig};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::message_hub::MessageHub;
use crate::server::websocket::{WsServerState, spawn_ws_server};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatmux_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chatmux/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatmux_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatmux_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_discord(cfg: &ServerConfig) -> Option<Arc<dyn SourceAdapter>> {
	let Some(token) = cfg.discord.token.clone() else {
		warn!("discord enabled but no token configured; skipping");
		return None;
	};

	let mut gateway_cfg = DiscordGatewayConfig::new(token);
	if let Some(url) = cfg.discord.gateway_url.clone() {
		gateway_cfg.gateway_url = url;
	}
	if let Some(intents) = cfg.discord.intents {
		gateway_cfg.intents = intents;
	}
	if let Some(min) = cfg.discord.reconnect_min_delay {
		gateway_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.discord.reconnect_max_delay {
		gateway_cfg.reconnect_max_delay = max;
	}

	Some(Arc::new(GatewayAdapter::new(
		GatewayConfig::new(Platform::Discord),
		Box::new(DiscordGateway::new(gateway_cfg)),
	)))
}

fn build_youtube(cfg: &ServerConfig) -> Option<Arc<dyn SourceAdapter>> {
	let auth = match (cfg.youtube.access_token.clone(), cfg.youtube.api_key.clone()) {
		(Some(token), _) => YouTubeAuth::Bearer(token),
		(None, Some(key)) => YouTubeAuth::ApiKey(key),
		(None, None) => {
			warn!("youtube enabled but neither api_key nor access_token configured; skipping");
			return None;
		}
	};

	let base_url = cfg.youtube.base_url.as_deref().unwrap_or(DEFAULT_YOUTUBE_BASE_URL);
	let client = match YouTubeClient::new(base_url, auth) {
		Ok(client) => client,
		Err(e) => {
			warn!(error = %format!("{e:#}"), "failed to build youtube client; skipping");
			return None;
		}
	};

	let poll_cfg = PollConfig {
		retry_cooldown: cfg.youtube.retry_cooldown,
		..PollConfig::default()
	};
	Some(Arc::new(PollAdapter::new(poll_cfg, Some(Arc::new(client)))))
}

fn build_twitch(cfg: &ServerConfig) -> Option<Arc<dyn SourceAdapter>> {
	let creds = match (cfg.twitch.username.clone(), cfg.twitch.access_token.clone()) {
		(Some(nick), Some(token)) => IrcCredentials::user(nick, token),
		_ => {
			info!("twitch credentials not configured; joining anonymously");
			IrcCredentials::anonymous()
		}
	};

	let connector = match cfg.twitch.irc_url.clone() {
		Some(url) => TwitchIrcConnector::new(url),
		None => TwitchIrcConnector::default(),
	};

	let mut irc_cfg = IrcConfig::default();
	if let Some(min) = cfg.twitch.reconnect_min_delay {
		irc_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.twitch.reconnect_max_delay {
		irc_cfg.reconnect_max_delay = max;
	}

	Some(Arc::new(IrcAdapter::new(irc_cfg, Arc::new(connector), creds)))
}

fn build_adapters(cfg: &ServerConfig) -> Vec<Arc<dyn SourceAdapter>> {
	Platform::ALL
		.into_iter()
		.filter(|p| cfg.sources.is_enabled(*p))
		.filter_map(|p| match p {
			Platform::Discord => build_discord(cfg),
			Platform::YouTube => build_youtube(cfg),
			Platform::Twitch => build_twitch(cfg),
		})
		.collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();

	let adapters = build_adapters(&server_cfg);
	if adapters.is_empty() {
		warn!("no chat sources configured; clients will receive nothing");
	}
	let hub = Arc::new(MessageHub::new(&adapters));
	let emitter = Arc::new(ComposedEmitter::start(
		adapters,
		EmitterConfig {
			bus_capacity: server_cfg.server.bus_capacity,
		},
	));
	let platforms: Vec<&str> = emitter.adapters().map(|a| a.platform().as_str()).collect();
	info!(?platforms, "chat sources started");

	let connections = ConnectionRegistry::new(ConnectionRegistryConfig {
		queue_capacity: server_cfg.server.connection_queue_capacity,
		debug_logs: server_cfg.server.debug_log_events,
	});

	let bus = emitter
		.take_bus()
		.ok_or_else(|| anyhow::anyhow!("emitter bus already taken"))?;
	let dispatcher = spawn_dispatcher(
		bus,
		Arc::clone(&hub),
		connections.clone(),
		DispatcherConfig {
			debug_log_events: server_cfg.server.debug_log_events,
		},
	);

	let stop = CancellationToken::new();

	let directory_path = match server_cfg.directory.path.clone() {
		Some(path) => path,
		None => crate::config::default_directory_path()?,
	};
	let directory: Arc<dyn SessionDirectory> = Arc::new(FileDirectory::load(&directory_path).await?);
	let poller = spawn_directory_poller(
		Arc::clone(&directory),
		Arc::clone(&hub),
		connections.clone(),
		server_cfg.directory.refresh,
		stop.clone(),
	);

	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(
					addr,
					health_state.clone().with_status(Arc::clone(&emitter), Arc::clone(&hub)),
				);
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let listener = TcpListener::bind(server_cfg.server.ws_bind.as_str()).await?;
	let ws_server = spawn_ws_server(
		listener,
		WsServerState {
			hub: Arc::clone(&hub),
			connections: connections.clone(),
			directory,
		},
		stop.clone(),
	);

	health_state.mark_ready();

	tokio::signal::ctrl_c().await?;
	info!("shutting down");

	stop.cancel();
	let _ = ws_server.await;
	let _ = poller.await;
	emitter.close().await;
	let _ = dispatcher.await;

	Ok(())
}

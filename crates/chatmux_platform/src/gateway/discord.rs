#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chatmux_domain::{Platform, Resource};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GatewayEvent, GatewayFeedTx, GatewaySource};
use crate::{AdapterError, ChatMessage, Envelope, Reconnect, SecretString, UpdateKind, UserRef, WsStream};

pub const DEFAULT_DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILD_MESSAGES | MESSAGE_CONTENT.
pub const DEFAULT_DISCORD_INTENTS: u64 = (1 << 9) | (1 << 15);

const HELLO_TIMEOUT: Duration = Duration::from_secs(15);

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

#[derive(Clone, Debug)]
pub struct DiscordGatewayConfig {
	pub token: SecretString,
	pub gateway_url: String,
	pub intents: u64,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl DiscordGatewayConfig {
	pub fn new(token: SecretString) -> Self {
		Self {
			token,
			gateway_url: DEFAULT_DISCORD_GATEWAY_URL.to_string(),
			intents: DEFAULT_DISCORD_INTENTS,
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
		}
	}
}

/// Discord bot gateway connection.
pub struct DiscordGateway {
	cfg: DiscordGatewayConfig,
}

impl DiscordGateway {
	pub fn new(cfg: DiscordGatewayConfig) -> Self {
		Self { cfg }
	}

	async fn connect(&self) -> anyhow::Result<WsStream> {
		let (ws, _resp) = tokio_tungstenite::connect_async(self.cfg.gateway_url.as_str())
			.await
			.context("connect_async to discord gateway")?;
		Ok(ws)
	}

	async fn read_hello(ws: &mut WsStream) -> anyhow::Result<Duration> {
		tokio::time::timeout(HELLO_TIMEOUT, Self::next_hello(ws))
			.await
			.context("timed out waiting for discord hello")?
	}

	async fn next_hello(ws: &mut WsStream) -> anyhow::Result<Duration> {
		while let Some(msg) = ws.next().await {
			if let Message::Text(t) = msg.context("read discord hello")? {
				let frame: GatewayFrame = serde_json::from_str(&t).context("parse discord frame")?;
				if frame.op == OP_HELLO {
					let hello: HelloData = serde_json::from_value(frame.d).context("parse discord hello")?;
					return Ok(Duration::from_millis(hello.heartbeat_interval));
				}
			}
		}
		Err(anyhow!("discord gateway closed before hello"))
	}

	async fn identify(&self, ws: &mut WsStream) -> anyhow::Result<()> {
		let payload = OutFrame {
			op: OP_IDENTIFY,
			d: Identify {
				token: self.cfg.token.expose().trim(),
				intents: self.cfg.intents,
				properties: IdentifyProperties {
					os: std::env::consts::OS,
					browser: "chatmux",
					device: "chatmux",
				},
			},
		};
		send_json(ws, &payload).await.context("send discord identify")
	}

	/// One connected session. Returns `Ok(())` when asked to stop.
	///
	/// `established` is set once Discord accepts the identify (READY or a heartbeat ack).
	async fn session(
		&self,
		ws: &mut WsStream,
		feed: &GatewayFeedTx,
		stop: &CancellationToken,
		established: &mut bool,
	) -> anyhow::Result<()> {
		let heartbeat = Self::read_hello(ws).await?;
		self.identify(ws).await?;
		info!(heartbeat = ?heartbeat, "discord gateway identified");

		let mut last_seq: Option<u64> = None;
		let mut awaiting_ack = false;
		let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

		loop {
			tokio::select! {
				biased;
				_ = stop.cancelled() => {
					let _ = ws.close(None).await;
					return Ok(());
				}
				_ = ticker.tick() => {
					if awaiting_ack {
						return Err(anyhow!("discord heartbeat not acknowledged"));
					}
					send_json(ws, &OutFrame { op: OP_HEARTBEAT, d: last_seq }).await.context("send discord heartbeat")?;
					awaiting_ack = true;
				}
				msg = ws.next() => {
					let Some(msg) = msg else {
						return Err(anyhow!("discord gateway stream ended"));
					};
					match msg.context("discord gateway read error")? {
						Message::Text(t) => {
							let frame: GatewayFrame = match serde_json::from_str(&t) {
								Ok(f) => f,
								Err(e) => {
									debug!(error = %e, "unparseable discord frame");
									continue;
								}
							};
							if frame.s.is_some() {
								last_seq = frame.s;
							}
							match frame.op {
								OP_DISPATCH => {
									let kind = frame.t.as_deref().unwrap_or_default();
									if kind == "READY" {
										*established = true;
									}
									if let Some(env) = envelope_from_dispatch(kind, frame.d)
										&& feed.send(GatewayEvent::Message(env)).await.is_err()
									{
										return Ok(());
									}
								}
								OP_HEARTBEAT => {
									send_json(ws, &OutFrame { op: OP_HEARTBEAT, d: last_seq }).await.context("send discord heartbeat")?;
								}
								OP_HEARTBEAT_ACK => {
									awaiting_ack = false;
									*established = true;
								}
								OP_RECONNECT => return Err(anyhow!("discord requested reconnect")),
								OP_INVALID_SESSION => return Err(anyhow!("discord session invalidated")),
								_ => {}
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							return Err(anyhow!("discord gateway closed: {frame:?}"));
						}
						_ => {}
					}
				}
			}
		}
	}
}

#[async_trait]
impl GatewaySource for DiscordGateway {
	async fn run(self: Box<Self>, feed: GatewayFeedTx, stop: CancellationToken) {
		let mut reconnect = Reconnect::new(self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);

		loop {
			if let Some(delay) = reconnect.delay() {
				info!(delay = ?delay, failures = reconnect.failures(), "reconnecting to discord gateway");
				tokio::select! {
					_ = stop.cancelled() => break,
					_ = sleep(delay) => {}
				}
			}

			let mut ws = tokio::select! {
				_ = stop.cancelled() => break,
				res = self.connect() => match res {
					Ok(ws) => ws,
					Err(e) => {
						reconnect.failed();
						report(&feed, &e).await;
						continue;
					}
				},
			};

			let mut established = false;
			match self.session(&mut ws, &feed, &stop, &mut established).await {
				Ok(()) => break,
				Err(e) => {
					if established {
						reconnect.dropped_after_healthy();
					} else {
						reconnect.failed();
					}
					report(&feed, &e).await;
				}
			}
		}

		info!("discord gateway stopped");
	}
}

async fn report(feed: &GatewayFeedTx, err: &anyhow::Error) {
	warn!(error = %err, "discord gateway error");
	metrics::counter!("chatmux_gateway_reconnects_total", "platform" => "discord").increment(1);
	let _ = feed
		.send(GatewayEvent::Error(AdapterError::transport(Platform::Discord, format!("{err:#}"))))
		.await;
}

async fn send_json<T: Serialize>(ws: &mut WsStream, payload: &T) -> anyhow::Result<()> {
	let text = serde_json::to_string(payload)?;
	ws.send(Message::Text(text.into())).await?;
	Ok(())
}

/// Turn a dispatch into an envelope keyed by `guild/channel`. DMs and unrelated
/// dispatches yield `None`.
pub(crate) fn envelope_from_dispatch(kind: &str, d: serde_json::Value) -> Option<Envelope> {
	let update = match kind {
		"MESSAGE_CREATE" => UpdateKind::New,
		"MESSAGE_UPDATE" => UpdateKind::Edit,
		"MESSAGE_DELETE" => UpdateKind::Delete,
		_ => return None,
	};

	let msg: DiscordMessage = match serde_json::from_value(d) {
		Ok(m) => m,
		Err(e) => {
			debug!(kind, error = %e, "unparseable discord message dispatch");
			return None;
		}
	};
	let guild_id = msg.guild_id.as_deref()?;
	let resource = Resource::discord(guild_id, &msg.channel_id).ok()?;

	let update_time = msg
		.edited_timestamp
		.as_deref()
		.filter(|_| update == UpdateKind::Edit)
		.or(msg.timestamp.as_deref())
		.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
		.map(|t| t.with_timezone(&Utc))
		.unwrap_or_else(Utc::now);

	let message = match (update, msg.author) {
		(UpdateKind::Delete, _) | (_, None) => ChatMessage::deleted(msg.id),
		(_, Some(author)) => ChatMessage {
			id: msg.id,
			author: Some(UserRef {
				login: author.username,
				display: author.global_name,
				is_bot: author.bot,
				id: author.id,
				..UserRef::default()
			}),
			text: msg.content.unwrap_or_default(),
			attachments: msg.attachments.into_iter().map(|a| a.url).collect(),
		},
	};

	Some(Envelope::new(resource, update, message).with_time(update_time))
}

#[derive(Debug, Deserialize)]
struct GatewayFrame {
	op: u8,
	#[serde(default)]
	d: serde_json::Value,
	#[serde(default)]
	s: Option<u64>,
	#[serde(default)]
	t: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutFrame<T> {
	op: u8,
	d: T,
}

#[derive(Debug, Deserialize)]
struct HelloData {
	heartbeat_interval: u64,
}

#[derive(Debug, Serialize)]
struct Identify<'a> {
	token: &'a str,
	intents: u64,
	properties: IdentifyProperties<'a>,
}

#[derive(Debug, Serialize)]
struct IdentifyProperties<'a> {
	os: &'a str,
	browser: &'a str,
	device: &'a str,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
	id: String,
	channel_id: String,
	#[serde(default)]
	guild_id: Option<String>,
	#[serde(default)]
	author: Option<DiscordUser>,
	#[serde(default)]
	content: Option<String>,
	#[serde(default)]
	timestamp: Option<String>,
	#[serde(default)]
	edited_timestamp: Option<String>,
	#[serde(default)]
	attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
	id: String,
	username: String,
	#[serde(default)]
	global_name: Option<String>,
	#[serde(default)]
	bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
	url: String,
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chatmux_domain::{Resource, RoomId};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use super::{IrcConnection, IrcConnector, IrcCredentials};
use crate::{ChatMessage, Envelope, UpdateKind, UserRef, WsStream};

pub const DEFAULT_TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// Twitch chat over IRC-on-websocket.
#[derive(Debug, Clone)]
pub struct TwitchIrcConnector {
	url: String,
}

impl TwitchIrcConnector {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}
}

impl Default for TwitchIrcConnector {
	fn default() -> Self {
		Self::new(DEFAULT_TWITCH_IRC_URL)
	}
}

#[async_trait]
impl IrcConnector for TwitchIrcConnector {
	async fn connect(&self, creds: &IrcCredentials) -> anyhow::Result<Box<dyn IrcConnection>> {
		let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
			.await
			.context("connect_async to twitch irc")?;

		let mut conn = TwitchIrcConnection {
			ws,
			lines: LineBuffer::default(),
		};
		conn.send_line("CAP REQ :twitch.tv/tags twitch.tv/commands").await?;
		if let Some(pass) = &creds.pass {
			let token = pass.expose().trim();
			let token = token.strip_prefix("oauth:").unwrap_or(token);
			conn.send_line(&format!("PASS oauth:{token}")).await?;
		}
		conn.send_line(&format!("NICK {}", creds.nick)).await?;
		Ok(Box::new(conn))
	}
}

/// Received lines not yet handled, and replies owed to the server.
///
/// Handling is synchronous, so a reply is queued before anything awaits and survives a
/// cancelled `next_event`.
#[derive(Debug, Default)]
struct LineBuffer {
	pending: VecDeque<String>,
	outbox: VecDeque<String>,
}

impl LineBuffer {
	fn push_frame(&mut self, text: &str) {
		self.pending
			.extend(text.split("\r\n").filter(|l| !l.is_empty()).map(str::to_string));
	}

	/// Consume pending lines up to the next chat event.
	fn next_envelope(&mut self) -> anyhow::Result<Option<Envelope>> {
		while let Some(raw) = self.pending.pop_front() {
			let Some(line) = IrcLine::parse(&raw) else {
				continue;
			};
			match line.command {
				"PING" => {
					let arg = line.trailing.unwrap_or("tmi.twitch.tv");
					self.outbox.push_back(format!("PONG :{arg}"));
				}
				"RECONNECT" => return Err(anyhow!("twitch requested reconnect")),
				"NOTICE" if line.trailing.is_some_and(|t| t.contains("authentication failed")) => {
					return Err(anyhow!("twitch irc login failed"));
				}
				_ => {
					if let Some(env) = envelope_from_line(&line) {
						return Ok(Some(env));
					}
				}
			}
		}
		Ok(None)
	}
}

struct TwitchIrcConnection {
	ws: WsStream,
	lines: LineBuffer,
}

impl TwitchIrcConnection {
	async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
		self.ws
			.send(Message::Text(line.to_string().into()))
			.await
			.with_context(|| format!("send irc line {}", line.split(' ').next().unwrap_or_default()))
	}

	/// Send queued replies. A reply leaves the queue only once sent.
	async fn flush_outbox(&mut self) -> anyhow::Result<()> {
		while let Some(line) = self.lines.outbox.front().cloned() {
			self.send_line(&line).await?;
			self.lines.outbox.pop_front();
		}
		Ok(())
	}
}

#[async_trait]
impl IrcConnection for TwitchIrcConnection {
	async fn join(&mut self, room: &RoomId) -> anyhow::Result<()> {
		self.send_line(&format!("JOIN #{room}")).await
	}

	async fn part(&mut self, room: &RoomId) -> anyhow::Result<()> {
		self.send_line(&format!("PART #{room}")).await
	}

	async fn next_event(&mut self) -> anyhow::Result<Option<Envelope>> {
		loop {
			self.flush_outbox().await?;
			if let Some(env) = self.lines.next_envelope()? {
				return Ok(Some(env));
			}
			if !self.lines.outbox.is_empty() {
				continue;
			}

			let Some(msg) = self.ws.next().await else {
				return Ok(None);
			};
			match msg.context("twitch irc read error")? {
				Message::Text(t) => self.lines.push_frame(&t),
				Message::Ping(p) => {
					let _ = self.ws.send(Message::Pong(p)).await;
				}
				Message::Close(frame) => {
					debug!(?frame, "twitch irc closed");
					return Ok(None);
				}
				_ => {}
			}
		}
	}

	async fn close(&mut self) {
		let _ = self.ws.close(None).await;
	}
}

/// One parsed IRC line: `[@tags] [:prefix] COMMAND [params...] [:trailing]`.
#[derive(Debug)]
pub(crate) struct IrcLine<'a> {
	pub tags: HashMap<&'a str, String>,
	pub prefix: Option<&'a str>,
	pub command: &'a str,
	pub params: Vec<&'a str>,
	pub trailing: Option<&'a str>,
}

impl<'a> IrcLine<'a> {
	pub fn parse(line: &'a str) -> Option<Self> {
		let mut rest = line.trim_end_matches(['\r', '\n']);

		let mut tags = HashMap::new();
		if let Some(stripped) = rest.strip_prefix('@') {
			let (raw_tags, after) = stripped.split_once(' ')?;
			for tag in raw_tags.split(';') {
				let (k, v) = tag.split_once('=').unwrap_or((tag, ""));
				tags.insert(k, unescape_tag(v));
			}
			rest = after.trim_start();
		}

		let mut prefix = None;
		if let Some(stripped) = rest.strip_prefix(':') {
			let (p, after) = stripped.split_once(' ')?;
			prefix = Some(p);
			rest = after.trim_start();
		}

		let (head, trailing) = match rest.split_once(" :") {
			Some((head, trailing)) => (head, Some(trailing)),
			None => (rest, None),
		};
		let mut parts = head.split(' ').filter(|p| !p.is_empty());
		let command = parts.next()?;

		Some(Self {
			tags,
			prefix,
			command,
			params: parts.collect(),
			trailing,
		})
	}

	fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	fn sent_at(&self) -> Option<DateTime<Utc>> {
		let ms: i64 = self.tag("tmi-sent-ts")?.parse().ok()?;
		Utc.timestamp_millis_opt(ms).single()
	}

	fn channel(&self) -> Option<Resource> {
		Resource::twitch(self.params.first()?).ok()
	}
}

fn unescape_tag(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('s') => out.push(' '),
			Some(':') => out.push(';'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Map `PRIVMSG` to a new message and `CLEARMSG` to a deletion.
pub(crate) fn envelope_from_line(line: &IrcLine<'_>) -> Option<Envelope> {
	let (update, message) = match line.command {
		"PRIVMSG" => {
			let login = line
				.prefix
				.and_then(|p| p.split('!').next())
				.filter(|l| !l.is_empty())?
				.to_string();
			let badges = line.tag("badges").unwrap_or_default();
			let author = UserRef {
				id: line.tag("user-id").map(str::to_string).unwrap_or_else(|| login.clone()),
				display: line.tag("display-name").map(str::to_string),
				is_admin: line.tag("mod") == Some("1") || badges.contains("broadcaster/"),
				is_bot: false,
				color: line.tag("color").map(str::to_string),
				login,
			};
			let id = line.tag("id").map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
			(UpdateKind::New, ChatMessage::new(id, author, line.trailing.unwrap_or_default()))
		}
		"CLEARMSG" => (UpdateKind::Delete, ChatMessage::deleted(line.tag("target-msg-id")?)),
		_ => return None,
	};

	let mut env = Envelope::new(line.channel()?, update, message);
	if let Some(ts) = line.sent_at() {
		env = env.with_time(ts);
	}
	Some(env)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_tagged_privmsg() {
		let raw = "@badges=broadcaster/1;color=#FF0000;display-name=Foo\\sBar;id=abc-123;mod=0;tmi-sent-ts=1700000000000;user-id=42 :foo!foo@foo.tmi.twitch.tv PRIVMSG #shroud :hello there :)";
		let line = IrcLine::parse(raw).unwrap();
		assert_eq!(line.command, "PRIVMSG");
		assert_eq!(line.params, vec!["#shroud"]);
		assert_eq!(line.trailing, Some("hello there :)"));

		let env = envelope_from_line(&line).unwrap();
		assert_eq!(env.routing_key, Resource::twitch("shroud").unwrap());
		assert_eq!(env.update, UpdateKind::New);
		assert_eq!(env.message.id, "abc-123");
		assert_eq!(env.message.text, "hello there :)");
		let author = env.message.author.unwrap();
		assert_eq!(author.login, "foo");
		assert_eq!(author.id, "42");
		assert_eq!(author.display.as_deref(), Some("Foo Bar"));
		assert_eq!(author.color.as_deref(), Some("#FF0000"));
		assert!(author.is_admin);
		assert_eq!(env.update_time.timestamp_millis(), 1_700_000_000_000);
	}

	#[test]
	fn clearmsg_is_a_deletion() {
		let raw = "@login=foo;room-id=;target-msg-id=abc-123;tmi-sent-ts=1700000000000 :tmi.twitch.tv CLEARMSG #Shroud :bad words";
		let env = envelope_from_line(&IrcLine::parse(raw).unwrap()).unwrap();
		assert_eq!(env.update, UpdateKind::Delete);
		assert_eq!(env.message.id, "abc-123");
		assert_eq!(env.routing_key.room_id.as_str(), "shroud");
	}

	#[test]
	fn untagged_and_control_lines() {
		let ping = IrcLine::parse("PING :tmi.twitch.tv").unwrap();
		assert_eq!(ping.command, "PING");
		assert_eq!(ping.trailing, Some("tmi.twitch.tv"));
		assert!(envelope_from_line(&ping).is_none());

		let join = IrcLine::parse(":bot!bot@bot.tmi.twitch.tv JOIN #shroud").unwrap();
		assert_eq!(join.prefix, Some("bot!bot@bot.tmi.twitch.tv"));
		assert!(envelope_from_line(&join).is_none());

		let plain = IrcLine::parse(":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #chan :hi").unwrap();
		let env = envelope_from_line(&plain).unwrap();
		assert_eq!(env.message.author.unwrap().id, "viewer");
	}

	#[test]
	fn ping_reply_is_queued_before_the_next_event() {
		let mut lines = LineBuffer::default();
		lines.push_frame("PING :tmi.twitch.tv\r\n:viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #chan :hi\r\nPING :again\r\n");

		let env = lines.next_envelope().unwrap().unwrap();
		assert_eq!(env.message.text, "hi");
		assert_eq!(lines.outbox, ["PONG :tmi.twitch.tv"]);

		// Dropping the caller here loses nothing: the reply stays queued.
		assert!(lines.next_envelope().unwrap().is_none());
		assert_eq!(lines.outbox, ["PONG :tmi.twitch.tv", "PONG :again"]);
		assert!(lines.pending.is_empty());
	}

	#[test]
	fn reconnect_request_is_an_error() {
		let mut lines = LineBuffer::default();
		lines.push_frame(":tmi.twitch.tv RECONNECT\r\n");
		assert!(lines.next_envelope().is_err());
	}

	#[test]
	fn rejects_garbage() {
		assert!(IrcLine::parse("").is_none());
		assert!(IrcLine::parse("@only-tags").is_none());
	}

	#[test]
	fn tag_unescaping() {
		assert_eq!(unescape_tag("a\\sb\\:c\\\\d"), "a b;c\\d");
	}
}

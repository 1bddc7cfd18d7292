#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chatmux_domain::RoomId;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{LiveChatApi, LiveChatPage, PollError, PolledMessage};
use crate::{ChatMessage, SecretString, UpdateKind, UserRef};

pub const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Used when the API omits `pollingIntervalMillis`.
const FALLBACK_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// How requests authenticate.
#[derive(Debug, Clone)]
pub enum YouTubeAuth {
	/// `?key=` query parameter.
	ApiKey(SecretString),
	/// OAuth bearer token.
	Bearer(SecretString),
}

/// Minimal YouTube Data API v3 client for live chat.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
	base_url: Url,
	auth: YouTubeAuth,
	client: reqwest::Client,
}

impl YouTubeClient {
	pub fn new(base_url: &str, auth: YouTubeAuth) -> anyhow::Result<Self> {
		let base_url = Url::parse(base_url.trim_end_matches('/')).context("parse youtube base url")?;
		Ok(Self {
			base_url,
			auth,
			client: reqwest::Client::new(),
		})
	}

	fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Url {
		let mut url = self.base_url.clone();
		url.set_path(&format!("{}/{}", self.base_url.path().trim_end_matches('/'), path));
		{
			let mut q = url.query_pairs_mut();
			for (k, v) in params {
				q.append_pair(k, v);
			}
			if let YouTubeAuth::ApiKey(key) = &self.auth {
				q.append_pair("key", key.expose().trim());
			}
		}
		url
	}

	async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url, what: &str) -> anyhow::Result<T> {
		let mut req = self.client.get(url).header("Accept", "application/json");
		if let YouTubeAuth::Bearer(token) = &self.auth {
			req = req.header("Authorization", format!("Bearer {}", token.expose().trim()));
		}

		let resp = req.send().await.with_context(|| format!("youtube {what}"))?;
		match resp.status() {
			StatusCode::OK => resp.json().await.with_context(|| format!("parse youtube {what} response")),
			status => Err(anyhow!("youtube {what} failed: status={status}")),
		}
	}

	/// Find the currently live video of a channel, if any.
	pub async fn find_live_video(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.endpoint(
			"search",
			&[
				("part", "id"),
				("channelId", channel_id),
				("eventType", "live"),
				("type", "video"),
			],
		);
		let body: SearchListResponse = self.get_json(url, "search").await?;
		Ok(body.items.into_iter().find_map(|item| item.id.video_id))
	}

	pub async fn active_live_chat_id(&self, video_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.endpoint("videos", &[("part", "liveStreamingDetails"), ("id", video_id)]);
		let body: VideoListResponse = self.get_json(url, "videos").await?;
		Ok(body
			.items
			.into_iter()
			.filter_map(|v| v.live_streaming_details)
			.find_map(|d| d.active_live_chat_id))
	}

	pub async fn live_chat_messages(
		&self,
		live_chat_id: &str,
		page_token: Option<&str>,
	) -> anyhow::Result<LiveChatMessageListResponse> {
		let mut params = vec![("liveChatId", live_chat_id), ("part", "snippet,authorDetails")];
		if let Some(token) = page_token.filter(|t| !t.is_empty()) {
			params.push(("pageToken", token));
		}
		let url = self.endpoint("liveChat/messages", &params);
		self.get_json(url, "liveChat/messages").await
	}
}

#[async_trait]
impl LiveChatApi for YouTubeClient {
	async fn resolve_live_chat(&self, room: &RoomId) -> Result<String, PollError> {
		let channel = room.as_str();
		let video_id = self
			.find_live_video(channel)
			.await
			.map_err(|e| PollError::Api(format!("{e:#}")))?
			.ok_or_else(|| PollError::NotLive(channel.to_string()))?;

		self.active_live_chat_id(&video_id)
			.await
			.map_err(|e| PollError::Api(format!("{e:#}")))?
			.ok_or_else(|| PollError::NotLive(channel.to_string()))
	}

	async fn list_messages(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, PollError> {
		let resp = self
			.live_chat_messages(live_chat_id, page_token)
			.await
			.map_err(|e| PollError::Api(format!("{e:#}")))?;
		page_from_response(live_chat_id, resp)
	}
}

/// Convert a raw message list into a page. A chat that went offline is an error so the
/// worker re-resolves the channel.
pub(crate) fn page_from_response(live_chat_id: &str, resp: LiveChatMessageListResponse) -> Result<LiveChatPage, PollError> {
	if resp.offline_at.is_some() && resp.items.is_empty() {
		return Err(PollError::NotLive(live_chat_id.to_string()));
	}

	let items = resp.items.into_iter().filter_map(polled_from_item).collect();
	let polling_interval = resp
		.polling_interval_millis
		.map(Duration::from_millis)
		.unwrap_or(FALLBACK_POLLING_INTERVAL);

	Ok(LiveChatPage {
		items,
		next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
		polling_interval,
	})
}

fn polled_from_item(item: LiveChatMessageItem) -> Option<PolledMessage> {
	let snippet = item.snippet?;
	let published_at = snippet
		.published_at
		.as_deref()
		.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
		.map(|t| t.with_timezone(&Utc));

	if snippet.kind.as_deref() == Some("messageDeletedEvent") {
		let deleted_id = snippet.message_deleted_details?.deleted_message_id;
		return Some(PolledMessage {
			update: UpdateKind::Delete,
			published_at,
			message: ChatMessage::deleted(deleted_id),
		});
	}

	let text = snippet.display_message.unwrap_or_default();
	let author = item
		.author_details
		.map(|a| UserRef {
			id: a.channel_id.clone(),
			login: a.channel_id,
			display: Some(a.display_name),
			is_admin: a.is_chat_moderator || a.is_chat_owner,
			is_bot: false,
			color: None,
		})
		.unwrap_or_default();

	Some(PolledMessage {
		update: UpdateKind::New,
		published_at,
		message: ChatMessage::new(item.id, author, text),
	})
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
	#[serde(default)]
	items: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
	id: SearchResultId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
	#[serde(default)]
	items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Video {
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatMessageListResponse {
	#[serde(default)]
	pub next_page_token: Option<String>,
	#[serde(default)]
	pub polling_interval_millis: Option<u64>,
	#[serde(default)]
	pub offline_at: Option<String>,
	#[serde(default)]
	items: Vec<LiveChatMessageItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatMessageItem {
	id: String,
	#[serde(default)]
	snippet: Option<LiveChatSnippet>,
	#[serde(default)]
	author_details: Option<LiveChatAuthor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatSnippet {
	#[serde(rename = "type", default)]
	kind: Option<String>,
	#[serde(default)]
	published_at: Option<String>,
	#[serde(default)]
	display_message: Option<String>,
	#[serde(default)]
	message_deleted_details: Option<MessageDeletedDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeletedDetails {
	deleted_message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatAuthor {
	channel_id: String,
	display_name: String,
	#[serde(default)]
	is_chat_moderator: bool,
	#[serde(default)]
	is_chat_owner: bool,
}

#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
///
/// Each variant maps to exactly one source adapter: Discord is push-based (gateway),
/// YouTube is poll-based and rate limited, Twitch is IRC-style join/part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Discord,
	YouTube,
	Twitch,
}

impl Platform {
	/// Every platform, in a stable order.
	pub const ALL: [Platform; 3] = [Platform::Discord, Platform::YouTube, Platform::Twitch];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Discord => "discord",
			Platform::YouTube => "youtube",
			Platform::Twitch => "twitch",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"discord" => Ok(Platform::Discord),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			"twitch" => Ok(Platform::Twitch),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Opaque platform-specific room key (`guild/channel`, a channel id, an IRC channel name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// A room on a platform: `(platform, room_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
	pub platform: Platform,
	pub room_id: RoomId,
}

impl Resource {
	pub fn new(platform: Platform, room_id: RoomId) -> Self {
		Self { platform, room_id }
	}

	/// Discord text channel inside a guild (`guild/channel`).
	pub fn discord(guild_id: &str, channel_id: &str) -> Result<Self, ParseIdError> {
		let guild_id = guild_id.trim();
		let channel_id = channel_id.trim();
		if guild_id.is_empty() || channel_id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self::new(Platform::Discord, RoomId::new(format!("{guild_id}/{channel_id}"))?))
	}

	/// YouTube channel id.
	pub fn youtube(channel_id: &str) -> Result<Self, ParseIdError> {
		Ok(Self::new(Platform::YouTube, RoomId::new(channel_id.trim().to_string())?))
	}

	/// Twitch IRC channel; stored lowercase without the leading `#`.
	pub fn twitch(channel: &str) -> Result<Self, ParseIdError> {
		let channel = channel.trim().trim_start_matches('#').to_ascii_lowercase();
		Ok(Self::new(Platform::Twitch, RoomId::new(channel)?))
	}

	/// Parse a `platform:room_id` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (platform_s, room_s) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected platform:room_id".into()))?;

		let platform = Platform::from_str(platform_s)?;
		match platform {
			Platform::Discord => {
				let (guild, channel) = room_s
					.split_once('/')
					.ok_or_else(|| ParseIdError::InvalidFormat("expected discord:guild/channel".into()))?;
				Self::discord(guild, channel)
			}
			Platform::YouTube => Self::youtube(room_s),
			Platform::Twitch => Self::twitch(room_s),
		}
	}
}

impl fmt::Display for Resource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.platform, self.room_id)
	}
}

impl FromStr for Resource {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Resource::parse(s)
	}
}

/// Stable identifier of one logical client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	/// Create a non-empty `SessionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::new(s.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn platform_parse_and_display() {
		assert_eq!("discord".parse::<Platform>().unwrap(), Platform::Discord);
		assert_eq!("YT".parse::<Platform>().unwrap(), Platform::YouTube);
		assert_eq!(Platform::Twitch.to_string(), "twitch");
		assert!(matches!(
			"kick".parse::<Platform>(),
			Err(ParseIdError::UnknownPlatform(p)) if p == "kick"
		));
	}

	#[test]
	fn resource_parse_roundtrip() {
		let r = Resource::parse("discord:g1/c1").unwrap();
		assert_eq!(r.platform, Platform::Discord);
		assert_eq!(r.room_id.as_str(), "g1/c1");
		assert_eq!(r.to_string(), "discord:g1/c1");

		let r = Resource::parse("youtube:UC123").unwrap();
		assert_eq!(r, Resource::youtube("UC123").unwrap());
	}

	#[test]
	fn twitch_channels_are_normalized() {
		let a = Resource::parse("twitch:#Shroud").unwrap();
		let b = Resource::twitch("shroud").unwrap();
		assert_eq!(a, b);
		assert_eq!(a.room_id.as_str(), "shroud");
	}

	#[test]
	fn discord_requires_guild_and_channel() {
		assert!(Resource::parse("discord:only-channel").is_err());
		assert!(Resource::discord("g1", " ").is_err());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(RoomId::new("").is_err());
		assert!(SessionId::new("   ").is_err());
		assert!("".parse::<Resource>().is_err());
		assert!("twitch:".parse::<Resource>().is_err());
	}
}

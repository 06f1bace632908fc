use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CommandError;

/// Content type used when neither the caller nor the URL tells us better.
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiverId(pub String);

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A receiver found by [`crate::TransportAdapter::discover`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverDescriptor {
    pub id: ReceiverId,
    pub friendly_name: String,
    pub model_name: Option<String>,
    /// Adapter-specific address (host:port, URL, ...).
    pub location: String,
}

/// Adapter-side reference to an open session, returned by `connect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub receiver: ReceiverId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
    Ending,
    Ended,
}

impl SessionState {
    /// True while a receiver session exists (possibly interrupted).
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Suspended => "suspended",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical connection lifecycle between controller and receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub receiver: ReceiverId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Buffered,
    Live,
}

/// Content to load on the receiver.
///
/// Built once and then passed by value into a `Load` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    url: String,
    title: Option<String>,
    subtitle: Option<String>,
    image_url: Option<String>,
    content_type: String,
    is_live: bool,
    autoplay: bool,
}

impl MediaItem {
    /// Creates an item for `url`, guessing the content type from its extension.
    pub fn new(url: &str) -> Result<Self, CommandError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(CommandError::invalid_argument("URL is required"));
        }

        Ok(Self {
            url: url.to_string(),
            title: None,
            subtitle: None,
            image_url: None,
            content_type: guess_content_type(url).to_string(),
            is_live: false,
            autoplay: true,
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    /// Empty image URLs are ignored.
    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        let image_url = image_url.into();
        self.image_url = (!image_url.trim().is_empty()).then_some(image_url);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn subtitle(&self) -> Option<&str> {
        self.subtitle.as_deref()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    pub fn stream_type(&self) -> StreamType {
        if self.is_live {
            StreamType::Live
        } else {
            StreamType::Buffered
        }
    }
}

/// Detect content type from the URL path extension.
pub fn guess_content_type(url: &str) -> &'static str {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();

    if path.ends_with(".m3u8") {
        "application/x-mpegURL"
    } else if path.ends_with(".mpd") {
        "application/dash+xml"
    } else if path.ends_with(".webm") {
        "video/webm"
    } else if path.ends_with(".mp3") {
        "audio/mpeg"
    } else if path.ends_with(".m4a") || path.ends_with(".aac") {
        "audio/mp4"
    } else {
        DEFAULT_CONTENT_TYPE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single playback instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandKind {
    Load(MediaItem),
    Play,
    Pause,
    Stop,
    Seek { position_ms: i64 },
    /// Receiver volume, 0.0 to 1.0.
    SetVolume { level: f64 },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Load(_) => "load",
            CommandKind::Play => "play",
            CommandKind::Pause => "pause",
            CommandKind::Stop => "stop",
            CommandKind::Seek { .. } => "seek",
            CommandKind::SetVolume { .. } => "set_volume",
        }
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            CommandKind::Seek { position_ms } if *position_ms < 0 => Err(
                CommandError::InvalidArgument(format!("seek position {position_ms} is negative")),
            ),
            CommandKind::SetVolume { level } if !(0.0..=1.0).contains(level) => Err(
                CommandError::InvalidArgument(format!("volume level {level} is outside [0, 1]")),
            ),
            _ => Ok(()),
        }
    }

    /// Load is never retried: a second load could restart playback.
    pub fn retry_on_timeout(&self) -> bool {
        matches!(
            self,
            CommandKind::Play | CommandKind::Pause | CommandKind::Stop | CommandKind::SetVolume { .. }
        )
    }

    /// Seek and volume changes wait for loaded media.
    pub fn requires_loaded_media(&self) -> bool {
        matches!(self, CommandKind::Seek { .. } | CommandKind::SetVolume { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed(CommandError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(id: CommandId, kind: CommandKind) -> Self {
        Self {
            id,
            kind,
            issued_at: Utc::now(),
            status: CommandStatus::Pending,
        }
    }
}

/// Receiver confirmation that a command was accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ack;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// Projected playback state, read through snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub player_state: PlayerState,
    pub position_ms: u64,
    /// None for live streams or while unknown.
    pub duration_ms: Option<u64>,
    pub is_live: bool,
    pub last_error: Option<String>,
    pub volume_level: Option<f64>,
    pub content_url: Option<String>,
}

/// Authoritative state pushed by the receiver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceiverStatus {
    /// Receiver clock, used to order pushes.
    pub timestamp_ms: u64,
    pub player_state: Option<PlayerState>,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub is_live: Option<bool>,
}

/// Everything a receiver subscription can deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum ReceiverEvent {
    /// Transient loss (network blip); the session may resume.
    Suspended { reason: String },
    Resumed,
    /// The receiver closed the session on its own.
    Terminated { reason: String },
    Status(ReceiverStatus),
    Volume { timestamp_ms: u64, level: f64 },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_item_requires_url() {
        assert!(matches!(
            MediaItem::new("   "),
            Err(CommandError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_media_item_defaults() {
        let item = MediaItem::new("https://cdn.example.com/clip").unwrap();
        assert_eq!(item.content_type(), DEFAULT_CONTENT_TYPE);
        assert!(!item.is_live());
        assert!(item.autoplay());
        assert_eq!(item.stream_type(), StreamType::Buffered);
        assert_eq!(item.title(), None);
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(
            guess_content_type("https://x/live/index.M3U8?token=1"),
            "application/x-mpegURL"
        );
        assert_eq!(guess_content_type("https://x/a.mpd"), "application/dash+xml");
        assert_eq!(guess_content_type("https://x/a.webm#t=3"), "video/webm");
        assert_eq!(guess_content_type("https://x/a.mp4"), "video/mp4");
        assert_eq!(guess_content_type("https://x/watch?v=1.mp3"), "video/mp4");
    }

    #[test]
    fn test_live_item_and_empty_image() {
        let item = MediaItem::new("https://x/live.m3u8")
            .unwrap()
            .live(true)
            .with_image_url("")
            .with_content_type("application/vnd.apple.mpegurl");
        assert_eq!(item.stream_type(), StreamType::Live);
        assert_eq!(item.image_url(), None);
        assert_eq!(item.content_type(), "application/vnd.apple.mpegurl");
    }

    #[test]
    fn test_command_validation() {
        assert!(CommandKind::Seek { position_ms: -1 }.validate().is_err());
        assert!(CommandKind::Seek { position_ms: 0 }.validate().is_ok());
        assert!(CommandKind::SetVolume { level: 1.5 }.validate().is_err());
        assert!(CommandKind::SetVolume { level: f64::NAN }.validate().is_err());
        assert!(CommandKind::SetVolume { level: 1.0 }.validate().is_ok());
        assert!(CommandKind::Play.validate().is_ok());
    }

    #[test]
    fn test_retry_policy() {
        let load = CommandKind::Load(MediaItem::new("https://x/a.mp4").unwrap());
        assert!(!load.retry_on_timeout());
        assert!(!CommandKind::Seek { position_ms: 10 }.retry_on_timeout());
        assert!(CommandKind::Play.retry_on_timeout());
        assert!(CommandKind::SetVolume { level: 0.2 }.retry_on_timeout());
    }

    #[test]
    fn test_playback_state_serializes_camel_case() {
        let state = PlaybackState {
            player_state: PlayerState::Playing,
            position_ms: 1500,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["playerState"], "Playing");
        assert_eq!(json["positionMs"], 1500);
        assert!(json["durationMs"].is_null());
    }
}

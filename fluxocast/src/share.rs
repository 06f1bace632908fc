//! Host-side glue: links shared into the application and "load media"
//! payloads coming from the host runtime.

use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::errors::CommandError;
use crate::model::MediaItem;

/// Metadata shown on the receiver when a load payload carries none.
pub const DEFAULT_TITLE: &str = "Fluxo Video";
pub const DEFAULT_SUBTITLE: &str = "Enviado desde Fluxo";

/// Holds the most recent shared link until the host asks for it, and
/// forwards every new link to attached consumers.
pub struct ShareInbox {
    accepted_mime: String,
    state: Mutex<ShareState>,
}

#[derive(Default)]
struct ShareState {
    pending: Option<String>,
    consumers: Vec<Sender<String>>,
}

impl ShareInbox {
    pub fn new(accepted_mime: &str) -> Self {
        Self {
            accepted_mime: accepted_mime.to_ascii_lowercase(),
            state: Mutex::new(ShareState::default()),
        }
    }

    /// Builds the inbox from the `cast.share` settings.
    pub fn from_settings(settings: &fluxoconfig::ShareSettings) -> Self {
        Self::new(&settings.accepted_mime)
    }

    fn lock(&self) -> MutexGuard<'_, ShareState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handles an incoming share. Returns the extracted link, or None when
    /// the MIME type is not accepted or the text carries no http(s) URL.
    pub fn receive(&self, mime: &str, text: &str) -> Option<String> {
        let mime = mime.split(';').next().unwrap_or_default().trim();
        if !mime.eq_ignore_ascii_case(&self.accepted_mime) {
            trace!(mime, "Ignoring share with unsupported type");
            return None;
        }
        let link = extract_link(text)?.to_string();

        let mut state = self.lock();
        state.pending = Some(link.clone());
        state.consumers.retain(|tx| tx.send(link.clone()).is_ok());
        debug!(
            link = link.as_str(),
            consumers = state.consumers.len(),
            "Shared link received"
        );
        Some(link)
    }

    /// The last unclaimed link. Returns it once, then None.
    pub fn take_initial_link(&self) -> Option<String> {
        self.lock().pending.take()
    }

    /// Live feed of links received from now on.
    pub fn attach(&self) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.lock().consumers.push(tx);
        rx
    }
}

/// First `http://` or `https://` URL in `text`, up to the next whitespace.
pub fn extract_link(text: &str) -> Option<&str> {
    text.split_whitespace()
        .filter_map(|word| {
            let lower = word.to_ascii_lowercase();
            let start = lower.find("https://").or_else(|| lower.find("http://"))?;
            Some(&word[start..])
        })
        .map(|link| link.trim_end_matches(['.', ',', ';', ')', ']', '>', '"', '\'']))
        .find(|link| !link.ends_with("//"))
}

/// "Load media" payload sent by the host runtime.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadRequest {
    pub url: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub image_url: Option<String>,
    pub content_type: Option<String>,
    pub is_live: bool,
    pub autoplay: Option<bool>,
}

impl LoadRequest {
    pub fn from_json(payload: &str) -> Result<Self, CommandError> {
        serde_json::from_str(payload)
            .map_err(|err| CommandError::InvalidArgument(format!("malformed load request: {err}")))
    }

    pub fn into_media_item(self) -> Result<MediaItem, CommandError> {
        let url = self
            .url
            .ok_or_else(|| CommandError::invalid_argument("URL is required"))?;

        let mut item = MediaItem::new(&url)?
            .live(self.is_live)
            .with_title(self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()))
            .with_subtitle(self.subtitle.unwrap_or_else(|| DEFAULT_SUBTITLE.to_string()));
        if let Some(image_url) = self.image_url {
            item = item.with_image_url(image_url);
        }
        if let Some(content_type) = self.content_type.filter(|c| !c.trim().is_empty()) {
            item = item.with_content_type(content_type);
        }
        if let Some(autoplay) = self.autoplay {
            item = item.with_autoplay(autoplay);
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_link() {
        assert_eq!(
            extract_link("Watch this https://video.example.com/a.mp4, great"),
            Some("https://video.example.com/a.mp4")
        );
        assert_eq!(
            extract_link("(see HTTP://x.org/live.m3u8)"),
            Some("HTTP://x.org/live.m3u8")
        );
        assert_eq!(extract_link("ftp://nope and plain text"), None);
        assert_eq!(extract_link("https:// alone"), None);
    }

    #[test]
    fn test_initial_link_is_taken_once() {
        let inbox = ShareInbox::new("text/plain");
        assert_eq!(inbox.take_initial_link(), None);

        inbox.receive("text/plain", "https://a.example/1");
        inbox.receive("text/plain; charset=utf-8", "https://a.example/2");
        assert_eq!(inbox.take_initial_link().as_deref(), Some("https://a.example/2"));
        assert_eq!(inbox.take_initial_link(), None);
    }

    #[test]
    fn test_unsupported_share_is_ignored() {
        let inbox = ShareInbox::new("text/plain");
        assert_eq!(inbox.receive("image/png", "https://a.example/1"), None);
        assert_eq!(inbox.receive("text/plain", "no link here"), None);
        assert_eq!(inbox.take_initial_link(), None);
    }

    #[test]
    fn test_attached_consumer_gets_live_links() {
        let inbox = ShareInbox::new("text/plain");
        let feed = inbox.attach();
        inbox.receive("text/plain", "https://a.example/1");
        assert_eq!(feed.try_recv().unwrap(), "https://a.example/1");

        drop(feed);
        inbox.receive("text/plain", "https://a.example/2");
        assert_eq!(inbox.lock().consumers.len(), 0);
    }

    #[test]
    fn test_load_request_into_media_item() {
        let request = LoadRequest::from_json(
            r#"{"url":"https://cdn.example.com/live/index.m3u8","title":"News","isLive":true}"#,
        )
        .unwrap();
        let item = request.into_media_item().unwrap();
        assert_eq!(item.title(), Some("News"));
        assert_eq!(item.subtitle(), Some(DEFAULT_SUBTITLE));
        assert!(item.is_live());
        assert_eq!(item.content_type(), "application/x-mpegURL");
    }

    #[test]
    fn test_load_request_without_metadata_gets_defaults() {
        let item = LoadRequest::from_json(r#"{"url":"https://cdn.example.com/a.mp4"}"#)
            .unwrap()
            .into_media_item()
            .unwrap();
        assert_eq!(item.title(), Some(DEFAULT_TITLE));
        assert_eq!(item.subtitle(), Some(DEFAULT_SUBTITLE));
        assert!(!item.is_live());
    }

    #[test]
    fn test_load_request_requires_url() {
        let request = LoadRequest::from_json(r#"{"title":"No url"}"#).unwrap();
        assert_eq!(
            request.into_media_item(),
            Err(CommandError::invalid_argument("URL is required"))
        );
        assert!(matches!(
            LoadRequest::from_json("not json"),
            Err(CommandError::InvalidArgument(_))
        ));
    }
}

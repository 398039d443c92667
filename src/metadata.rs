use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc::UnboundedSender;

use crate::shared_state::TrackMetadata;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Default pause before reopening a dropped event feed
pub const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("radioscope/", env!("CARGO_PKG_VERSION"));

/// `{title?, artist?}` as pushed by the host or the event feed.
/// Fields that are missing, null or not strings read as `None`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SongInfoPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub artist: Option<String>,
}

impl SongInfoPayload {
    /// Read whatever arrived as a payload; anything but an object is empty
    pub fn from_value(value: serde_json::Value) -> Self {
        Self::deserialize(value).unwrap_or_default()
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Some(text),
        _ => None,
    })
}

impl From<SongInfoPayload> for TrackMetadata {
    fn from(payload: SongInfoPayload) -> Self {
        TrackMetadata::new(
            payload.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            payload.artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
        )
    }
}

/// Both fields missing
pub fn unknown_track() -> TrackMetadata {
    SongInfoPayload::default().into()
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("status request failed: {0}")]
    Request(String),
    #[error("status body unreadable: {0}")]
    Body(#[from] std::io::Error),
}

// === Icecast status endpoint ===

#[derive(Deserialize)]
struct IcecastStatus {
    icestats: IceStats,
}

#[derive(Deserialize)]
struct IceStats {
    #[serde(default)]
    source: Option<OneOrMany<SongInfoPayload>>,
}

// Icecast reports a lone mount as an object and several as an array
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_first(self) -> Option<T> {
        match self {
            OneOrMany::Many(items) => items.into_iter().next(),
            OneOrMany::One(item) => Some(item),
        }
    }
}

/// Extract the now-playing track from a `status-json.xsl` body.
/// The first source is authoritative; anything unreadable becomes the
/// unknown pair.
pub fn parse_status(body: &str) -> TrackMetadata {
    match serde_json::from_str::<IcecastStatus>(body) {
        Ok(status) => status
            .icestats
            .source
            .and_then(OneOrMany::into_first)
            .unwrap_or_default()
            .into(),
        Err(e) => {
            tracing::warn!("[Metadata] Malformed status document: {}", e);
            unknown_track()
        }
    }
}

/// Blocking fetch of the status endpoint
pub fn fetch_status(agent: &ureq::Agent, url: &str) -> Result<TrackMetadata, MetadataError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| MetadataError::Request(e.to_string()))?;
    let body = response.into_string()?;
    Ok(parse_status(&body))
}

/// Agent for short status requests
pub fn status_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()
}

// === Server-sent event feed ===

/// Parse one `data: {...}` line. Comments, other fields and bad JSON yield
/// `None`.
pub fn parse_sse_line(line: &str) -> Option<SongInfoPayload> {
    let data = line.strip_prefix("data:")?.trim();
    serde_json::from_str(data).ok()
}

/// Follow an event feed on its own thread, reconnecting after
/// `retry` whenever it ends. Stops once `tracks` is closed.
pub fn spawn_event_feed(
    url: String,
    retry: Duration,
    tracks: UnboundedSender<TrackMetadata>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("metadata-feed".into())
        .spawn(move || {
            // Event streams idle for minutes, so no read timeout here
            let agent = ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .user_agent(USER_AGENT)
                .build();

            while !tracks.is_closed() {
                match follow_feed(&agent, &url, &tracks) {
                    Ok(()) => tracing::info!("[Metadata] Event feed ended, reconnecting in {:?}", retry),
                    Err(e) => tracing::warn!("[Metadata] Event feed error: {}, reconnecting in {:?}", e, retry),
                }
                if tracks.is_closed() {
                    break;
                }
                thread::sleep(retry);
            }
            tracing::debug!("[Metadata] Event feed stopped");
        })
}

fn follow_feed(
    agent: &ureq::Agent,
    url: &str,
    tracks: &UnboundedSender<TrackMetadata>,
) -> Result<(), MetadataError> {
    let response = agent
        .get(url)
        .set("Accept", "text/event-stream")
        .call()
        .map_err(|e| MetadataError::Request(e.to_string()))?;

    tracing::info!("[Metadata] Event feed connected: {}", url);

    for line in BufReader::new(response.into_reader()).lines() {
        let line = line?;
        if let Some(payload) = parse_sse_line(&line) {
            if tracks.send(payload.into()).is_err() {
                break;
            }
        }
    }
    Ok(())
}

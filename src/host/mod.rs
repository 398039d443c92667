use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::metadata::SongInfoPayload;
use crate::shared_state::{ThemeColor, TrackMetadata};

// Module datastructure is self-contained for talking to the window host

/// Events pushed by the host process, `{"event": ..., "payload": ...}`
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawHostEvent")]
pub enum HostEvent {
    /// Now-playing update (`song-info-update`). A missing or malformed
    /// payload still counts, with unknown fields.
    SongInfoUpdate(SongInfoPayload),
    /// Host asks for the locally held track (`get-current-song`)
    GetCurrentSong,
}

#[derive(Deserialize)]
struct RawHostEvent {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<RawHostEvent> for HostEvent {
    type Error = String;

    fn try_from(raw: RawHostEvent) -> Result<Self, Self::Error> {
        match raw.event.as_str() {
            "song-info-update" => Ok(HostEvent::SongInfoUpdate(SongInfoPayload::from_value(raw.payload))),
            "get-current-song" => Ok(HostEvent::GetCurrentSong),
            other => Err(format!("unknown host event '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("no host process attached")]
    Unavailable,
    #[error("host outbound queue is full")]
    Busy,
    #[error("host connection closed")]
    Disconnected,
}

/// Window-level commands the overlay sends to its host.
///
/// Every call is a suspension point on the event loop. Failures are reported
/// to the caller, who decides whether they matter (they never roll back local
/// state).
#[allow(async_fn_in_trait)]
pub trait HostProcess {
    async fn set_always_on_top(&self, flag: bool) -> Result<(), HostError>;

    async fn set_ignore_cursor_events(&self, flag: bool) -> Result<(), HostError>;

    async fn set_theme_color(&self, color: ThemeColor) -> Result<(), HostError>;

    /// Reply to a `get-current-song` request
    async fn send_current_song(&self, track: &TrackMetadata) -> Result<(), HostError>;

    /// Hand out the inbound event channel (once). `None` when the host cannot
    /// push events, in which case metadata falls back to polling.
    fn take_events(&mut self) -> Option<UnboundedReceiver<HostEvent>>;
}

// ==============================================================
// IMPLEMENTATIONS
// ==============================================================

mod detached;
mod stdio;

pub use detached::DetachedHost;
pub use stdio::{FrameSink, HostMessage, StdioHost};

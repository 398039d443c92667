use tokio::sync::mpsc::UnboundedReceiver;

use super::{HostError, HostEvent, HostProcess};
use crate::shared_state::{ThemeColor, TrackMetadata};

/// Stand-in when the overlay runs without a host window manager.
/// Window commands go nowhere and metadata has to be polled.
#[derive(Debug, Default)]
pub struct DetachedHost;

impl DetachedHost {
    pub fn new() -> Self {
        Self
    }
}

impl HostProcess for DetachedHost {
    async fn set_always_on_top(&self, _flag: bool) -> Result<(), HostError> {
        Err(HostError::Unavailable)
    }

    async fn set_ignore_cursor_events(&self, _flag: bool) -> Result<(), HostError> {
        Err(HostError::Unavailable)
    }

    async fn set_theme_color(&self, _color: ThemeColor) -> Result<(), HostError> {
        Err(HostError::Unavailable)
    }

    async fn send_current_song(&self, _track: &TrackMetadata) -> Result<(), HostError> {
        Err(HostError::Unavailable)
    }

    fn take_events(&mut self) -> Option<UnboundedReceiver<HostEvent>> {
        None
    }
}

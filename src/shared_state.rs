use std::cell::{Cell, RefCell};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Title shown until the first metadata update arrives
pub const LOADING_TITLE: &str = "Loading...";

/// Main shared state container for the overlay, wrapped in `Rc` and handed
/// to every component at construction.
///
///  Single-writer rules:
///  - Host bridge writes the window intent and the current track
///  - Stream monitor writes the playback state and last reported error
///  - Render layer only reads
///
/// Everything runs on the one event-loop thread, so `Cell`/`RefCell` is all
/// the synchronization needed.
pub struct OverlayState {
    /// Window behaviour requested by the local user
    intent: Cell<WindowIntent>,

    /// Now-playing info from the host / metadata endpoint
    track: RefCell<TrackMetadata>,

    /// Coarse playback status for the "not currently playing" display
    playback: Cell<PlaybackState>,

    /// Most recent failure reported by the monitor
    last_error: RefCell<Option<String>>,
}

impl OverlayState {
    /// Create new shared state with the initial window intent
    pub fn new(intent: WindowIntent) -> Self {
        Self {
            intent: Cell::new(intent),
            track: RefCell::new(TrackMetadata::default()),
            playback: Cell::new(PlaybackState::Idle),
            last_error: RefCell::new(None),
        }
    }

    pub fn intent(&self) -> WindowIntent {
        self.intent.get()
    }

    pub fn track(&self) -> TrackMetadata {
        self.track.borrow().clone()
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback.get()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    // === Writers (crate-private, one owner each) ===

    pub(crate) fn set_intent(&self, intent: WindowIntent) {
        self.intent.set(intent);
    }

    pub(crate) fn set_track(&self, track: TrackMetadata) {
        *self.track.borrow_mut() = track;
    }

    pub(crate) fn set_playback(&self, playback: PlaybackState) {
        self.playback.set(playback);
    }

    pub(crate) fn report_error(&self, error: Option<String>) {
        *self.last_error.borrow_mut() = error;
    }
}

impl Default for OverlayState {
    fn default() -> Self {
        Self::new(WindowIntent::default())
    }
}

/// Coarse playback status as seen by the user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Connecting,
    Playing,
    Stalled,
    Failed,
}

/// Window-level behaviour the local user asked for.
///
/// Flows one way: local UI -> overlay surface -> host. Inbound host events
/// never touch it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowIntent {
    /// Keep the overlay above all other windows
    pub pinned: bool,

    /// Let clicks pass through to the windows below
    pub click_through: bool,

    /// Bar color handed to the renderer
    pub theme_color: ThemeColor,
}

impl Default for WindowIntent {
    fn default() -> Self {
        Self {
            pinned: true,
            click_through: false,
            theme_color: ThemeColor::DEFAULT_BARS,
        }
    }
}

/// Now-playing information
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
        }
    }
}

impl Default for TrackMetadata {
    fn default() -> Self {
        Self::new(LOADING_TITLE, "")
    }
}

impl fmt::Display for TrackMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.artist.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{} - {}", self.artist, self.title)
        }
    }
}

/// Simple RGBA color for the bar theme.
///
/// Serialized as `#rrggbb` (or `#rrggbbaa` when not opaque) so config files
/// and host messages stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThemeColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl ThemeColor {
    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const WHITE: Self = Self::from_rgb(255, 255, 255);
    pub const BLACK: Self = Self::from_rgb(0, 0, 0);

    /// Spring green, the stock bar color
    pub const DEFAULT_BARS: Self = Self::from_rgb(0, 255, 136);

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa` (leading `#` optional)
    pub fn from_hex(input: &str) -> Result<Self, ColorParseError> {
        let trimmed = input.trim();
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ColorParseError(input.to_string()));
        }

        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ColorParseError(input.to_string()))
        };

        match hex.len() {
            3 => {
                // Short form: each nibble doubles (#0f8 -> #00ff88)
                let mut rgb = [0u8; 3];
                for (slot, c) in rgb.iter_mut().zip(hex.chars()) {
                    let nibble = c.to_digit(16).unwrap_or(0) as u8;
                    *slot = nibble * 17;
                }
                Ok(Self::from_rgb(rgb[0], rgb[1], rgb[2]))
            }
            6 => Ok(Self::from_rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Ok(Self::from_rgba(channel(0)?, channel(2)?, channel(4)?, channel(6)?)),
            _ => Err(ColorParseError(input.to_string())),
        }
    }

    pub fn to_hex(self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl Default for ThemeColor {
    fn default() -> Self {
        Self::DEFAULT_BARS
    }
}

impl fmt::Display for ThemeColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for ThemeColor {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ThemeColor> for String {
    fn from(color: ThemeColor) -> Self {
        color.to_hex()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid theme color '{0}' (expected #rrggbb or #rrggbbaa)")]
pub struct ColorParseError(pub String);

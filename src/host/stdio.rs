use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{HostError, HostEvent, HostProcess};
use crate::analyzer::FrequencyVector;
use crate::scheduler::{Frame, Renderer};
use crate::shared_state::{ThemeColor, TrackMetadata};

/// Messages queued for the host before they are dropped as `Busy`
const OUTBOUND_CAPACITY: usize = 256;

/// One line of newline-delimited JSON sent to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    SetAlwaysOnTop { flag: bool },
    SetIgnoreCursorEvents { flag: bool },
    SetThemeColor { color: ThemeColor },
    CurrentSong { title: String, artist: String },
    Frame {
        generation: u64,
        tick: u64,
        bars: FrequencyVector,
        max: f32,
        color: ThemeColor,
    },
}

/// Host process attached over stdin/stdout.
///
/// The parent window manager spawns the overlay and talks to it in JSON lines:
/// commands and frames go out on stdout, events come in on stdin. Both ends
/// run on their own threads so a slow host never stalls the event loop.
pub struct StdioHost {
    outbound: Sender<HostMessage>,
    events: Option<UnboundedReceiver<HostEvent>>,
}

impl StdioHost {
    /// Attach to the process's own stdin/stdout
    pub fn spawn() -> io::Result<Self> {
        Self::with_io(io::stdin(), io::stdout())
    }

    pub fn with_io<I, O>(input: I, output: O) -> io::Result<Self>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("host-writer".into())
            .spawn(move || write_loop(output, outbound_rx))?;
        thread::Builder::new()
            .name("host-reader".into())
            .spawn(move || read_loop(BufReader::new(input), event_tx))?;

        tracing::info!("[Host] Attached over stdio");

        Ok(Self {
            outbound: outbound_tx,
            events: Some(event_rx),
        })
    }

    /// Renderer that streams frames to the host on the same channel
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            outbound: self.outbound.clone(),
            dropped: Cell::new(0),
        }
    }

    fn send(&self, message: HostMessage) -> Result<(), HostError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => HostError::Busy,
            TrySendError::Disconnected(_) => HostError::Disconnected,
        })
    }
}

impl HostProcess for StdioHost {
    async fn set_always_on_top(&self, flag: bool) -> Result<(), HostError> {
        self.send(HostMessage::SetAlwaysOnTop { flag })
    }

    async fn set_ignore_cursor_events(&self, flag: bool) -> Result<(), HostError> {
        self.send(HostMessage::SetIgnoreCursorEvents { flag })
    }

    async fn set_theme_color(&self, color: ThemeColor) -> Result<(), HostError> {
        self.send(HostMessage::SetThemeColor { color })
    }

    async fn send_current_song(&self, track: &TrackMetadata) -> Result<(), HostError> {
        self.send(HostMessage::CurrentSong {
            title: track.title.clone(),
            artist: track.artist.clone(),
        })
    }

    fn take_events(&mut self) -> Option<UnboundedReceiver<HostEvent>> {
        self.events.take()
    }
}

/// Frame renderer backed by the host channel. Frames are dropped, not
/// queued, when the host falls behind.
pub struct FrameSink {
    outbound: Sender<HostMessage>,
    dropped: Cell<u64>,
}

impl Renderer for FrameSink {
    fn render(&self, frame: &Frame<'_>) {
        let message = HostMessage::Frame {
            generation: frame.generation,
            tick: frame.tick,
            bars: frame.bars.clone(),
            max: frame.full_scale,
            color: frame.color,
        };

        if self.outbound.try_send(message).is_err() {
            let dropped = self.dropped.get() + 1;
            self.dropped.set(dropped);
            if dropped.is_power_of_two() {
                tracing::debug!("[Host] {} frames dropped so far (host not keeping up)", dropped);
            }
        }
    }
}

// === Worker threads ===

fn write_loop<O: Write>(mut output: O, messages: Receiver<HostMessage>) {
    for message in messages.iter() {
        let written = serde_json::to_writer(&mut output, &message)
            .map_err(io::Error::from)
            .and_then(|_| output.write_all(b"\n"))
            .and_then(|_| output.flush());

        if let Err(e) = written {
            tracing::warn!("[Host] Output closed: {}", e);
            return;
        }
    }
    tracing::debug!("[Host] Writer finished");
}

fn read_loop<I: BufRead>(input: I, events: UnboundedSender<HostEvent>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("[Host] Input failed: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<HostEvent>(line) {
            Ok(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("[Host] Ignoring malformed message: {}", e),
        }
    }
    // Dropping the sender tells the bridge the push channel is gone
    tracing::info!("[Host] Input closed");
}

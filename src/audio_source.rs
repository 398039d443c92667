//! Signal source abstraction for the live stream
//! The monitor builds one source per pipeline; the analyzer taps its decoded
//! samples and the monitor watches its events and readiness.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tokio::sync::mpsc::UnboundedReceiver;

/// Audio packet containing decoded samples and format info
#[derive(Clone, Debug)]
pub struct AudioPacket {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioPacket {
    /// Convert multi-channel audio to mono by averaging channels
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples.clone();
        }

        // Chunk the interleaved stream by channel count and average each frame
        self.samples
            .chunks(self.channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect()
    }
}

/// How much data the source has ever received.
///
/// `HaveNothing` after `play()` means the stream never delivered a byte of
/// audio, which is what the liveness probe looks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveEnoughData = 2,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::HaveNothing,
            1 => ReadyState::HaveMetadata,
            _ => ReadyState::HaveEnoughData,
        }
    }
}

/// Readiness shared between a source and its decoder thread
#[derive(Clone, Debug, Default)]
pub struct ReadyFlag(Arc<AtomicU8>);

impl ReadyFlag {
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Readiness only moves forward; a late `HaveMetadata` never hides data
    pub fn advance(&self, state: ReadyState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Observable playback events
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    /// First audio is flowing
    Playing,
    /// Playback stopped on request
    Pause,
    /// Connect, decode or end-of-stream failure
    Error(String),
}

pub type SourceEvents = UnboundedReceiver<SourceEvent>;

/// Receiving end of a source's decoded audio
pub struct SampleTap {
    packets: Receiver<AudioPacket>,
    flowing: Arc<AtomicBool>,
}

impl SampleTap {
    pub fn new(packets: Receiver<AudioPacket>, flowing: Arc<AtomicBool>) -> Self {
        Self { packets, flowing }
    }

    /// Whether the source is currently delivering audio (played and not paused)
    pub fn is_flowing(&self) -> bool {
        self.flowing.load(Ordering::Acquire)
    }

    /// Drain everything buffered so far without blocking
    pub fn drain(&self) -> impl Iterator<Item = AudioPacket> + '_ {
        self.packets.try_iter()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("stream ended")]
    EndOfStream,
    #[error("decoder thread could not start: {0}")]
    Spawn(String),
}

impl SourceError {
    /// Conditions a retry cannot fix on its own
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::InvalidUrl(_))
    }
}

/// Behaviour the monitor needs from a live stream
pub trait SignalSource {
    /// Start (or restart) playback; never blocks on the network
    fn play(&mut self) -> Result<(), SourceError>;

    /// Stop playback and emit `SourceEvent::Pause`
    fn pause(&mut self);

    /// Playback has been requested and not paused since
    fn is_playing(&self) -> bool;

    fn ready_state(&self) -> ReadyState;

    /// Whether decoded samples may be handed to an analyzer at all
    /// (the stream's cross-origin permission)
    fn samples_exposed(&self) -> bool {
        true
    }

    /// Hand out the decoded-sample tap (once)
    fn take_tap(&mut self) -> Option<SampleTap>;

    /// Hand out the event receiver (once)
    fn take_events(&mut self) -> Option<SourceEvents>;
}

/// Creates a fresh source bound to the stream endpoint
pub trait SourceFactory {
    type Source: SignalSource;

    fn open(&mut self, url: &str) -> Result<Self::Source, SourceError>;
}

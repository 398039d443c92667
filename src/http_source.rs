//! Live stream source: HTTP fetch with `ureq`, decode with `symphonia`.
//!
//! Each `play()` starts a decoder thread that owns the connection. Decoded
//! audio reaches the analyzer through a bounded channel; lifecycle events go
//! to the monitor through the source's event channel.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::audio_source::{
    AudioPacket, ReadyFlag, ReadyState, SampleTap, SignalSource, SourceError, SourceEvent,
    SourceEvents, SourceFactory,
};

/// Packets buffered for the analyzer before new ones are dropped
const TAP_CAPACITY: usize = 32;

const USER_AGENT: &str = concat!("radioscope/", env!("CARGO_PKG_VERSION"));

/// Opens `HttpStreamSource`s sharing one connection agent
pub struct HttpSourceFactory {
    agent: ureq::Agent,
}

impl HttpSourceFactory {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            // A live stream that goes quiet this long is dead
            .timeout_read(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl Default for HttpSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceFactory for HttpSourceFactory {
    type Source = HttpStreamSource;

    fn open(&mut self, url: &str) -> Result<HttpStreamSource, SourceError> {
        HttpStreamSource::new(self.agent.clone(), url)
    }
}

/// Reject anything that is not an absolute http(s) URL
pub fn validate_stream_url(url: &str) -> Result<(), SourceError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| SourceError::InvalidUrl(url.to_string()))?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(SourceError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

pub struct HttpStreamSource {
    url: String,
    agent: ureq::Agent,

    // Shared with the decoder thread
    flowing: Arc<AtomicBool>,
    ready: ReadyFlag,
    packets: Sender<AudioPacket>,
    events_tx: UnboundedSender<SourceEvent>,

    tap: Option<SampleTap>,
    events_rx: Option<SourceEvents>,

    /// Stop flag of the running decoder thread
    worker: Option<Arc<AtomicBool>>,
    playing: bool,
}

impl HttpStreamSource {
    pub fn new(agent: ureq::Agent, url: &str) -> Result<Self, SourceError> {
        validate_stream_url(url)?;

        let (packets, packets_rx) = crossbeam_channel::bounded(TAP_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let flowing = Arc::new(AtomicBool::new(false));

        Ok(Self {
            url: url.to_string(),
            agent,
            tap: Some(SampleTap::new(packets_rx, Arc::clone(&flowing))),
            flowing,
            ready: ReadyFlag::default(),
            packets,
            events_tx,
            events_rx: Some(events_rx),
            worker: None,
            playing: false,
        })
    }

    fn stop_worker(&mut self) {
        if let Some(stop) = self.worker.take() {
            stop.store(true, Ordering::Release);
        }
        self.flowing.store(false, Ordering::Release);
    }
}

impl SignalSource for HttpStreamSource {
    fn play(&mut self) -> Result<(), SourceError> {
        if self.playing {
            return Ok(());
        }
        self.stop_worker();

        let stop = Arc::new(AtomicBool::new(false));
        let worker = StreamDecoder {
            url: self.url.clone(),
            agent: self.agent.clone(),
            packets: self.packets.clone(),
            events: self.events_tx.clone(),
            ready: self.ready.clone(),
            flowing: Arc::clone(&self.flowing),
            stop: Arc::clone(&stop),
        };

        // Detached: a blocked read may outlive the source until its timeout,
        // but the stop flag keeps it from reporting anything
        thread::Builder::new()
            .name("stream-decoder".into())
            .spawn(move || worker.run())
            .map_err(|e| SourceError::Spawn(e.to_string()))?;

        self.worker = Some(stop);
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        self.stop_worker();
        let _ = self.events_tx.send(SourceEvent::Pause);
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn ready_state(&self) -> ReadyState {
        self.ready.get()
    }

    fn take_tap(&mut self) -> Option<SampleTap> {
        self.tap.take()
    }

    fn take_events(&mut self) -> Option<SourceEvents> {
        self.events_rx.take()
    }
}

impl Drop for HttpStreamSource {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// === Decoder thread ===

struct StreamDecoder {
    url: String,
    agent: ureq::Agent,
    packets: Sender<AudioPacket>,
    events: UnboundedSender<SourceEvent>,
    ready: ReadyFlag,
    flowing: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl StreamDecoder {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(self) {
        let result = self.decode();

        if self.stopped() {
            tracing::debug!("[Stream] Decoder stopped");
            return;
        }
        self.flowing.store(false, Ordering::Release);

        let reason = match result {
            Ok(()) => SourceError::EndOfStream,
            Err(e) => e,
        };
        tracing::warn!("[Stream] {}", reason);
        let _ = self.events.send(SourceEvent::Error(reason.to_string()));
    }

    fn decode(&self) -> Result<(), SourceError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        let mut hint = Hint::new();
        if let Some(extension) = extension_for(response.content_type()) {
            hint.with_extension(extension);
        }
        tracing::info!("[Stream] Connected to {} ({})", self.url, response.content_type());
        self.ready.advance(ReadyState::HaveMetadata);

        let source = ReadOnlySource::new(response.into_reader());
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| SourceError::Decode(format!("unsupported stream: {}", e)))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| SourceError::Decode("no audio track".into()))?;
        let track_id = track.id;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut announced = false;
        let mut dropped = 0u64;

        loop {
            if self.stopped() {
                return Ok(());
            }

            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let audio_buf = match decoder.decode(&packet) {
                Ok(audio_buf) => audio_buf,
                // Corrupt frame: skip it, the next one usually decodes
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("[Stream] Skipping bad frame: {}", e);
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            let spec = SignalSpec::new(audio_buf.spec().rate, audio_buf.spec().channels);
            let needs_realloc = sample_buf
                .as_ref()
                .map_or(true, |buf| buf.capacity() < audio_buf.capacity());
            if needs_realloc {
                sample_buf = Some(SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(audio_buf);

            let packet = AudioPacket {
                samples: buf.samples().to_vec(),
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
            };

            if !announced {
                announced = true;
                self.ready.advance(ReadyState::HaveEnoughData);
                self.flowing.store(true, Ordering::Release);
                tracing::info!(
                    "[Stream] Decoding {} Hz, {} channel(s)",
                    packet.sample_rate,
                    packet.channels
                );
                let _ = self.events.send(SourceEvent::Playing);
            }

            // The analyzer only needs the freshest window, so a backlog is dropped
            match self.packets.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        tracing::trace!("[Stream] Analyzer behind, {} packets dropped", dropped);
                    }
                }
                // Analyzer gone: nobody left to decode for
                Err(TrySendError::Disconnected(_)) => return Ok(()),
            }
        }
    }
}

/// Map the stream's MIME type to a format hint
fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type.trim().to_ascii_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" => Some("mp3"),
        "audio/aac" | "audio/aacp" | "audio/x-aac" => Some("aac"),
        "audio/mp4" | "audio/x-m4a" => Some("m4a"),
        _ => None,
    }
}

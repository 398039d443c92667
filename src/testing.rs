//! Scripted stand-ins for the stream, the renderer and the host process

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::audio_source::{
    AudioPacket, ReadyFlag, ReadyState, SampleTap, SignalSource, SourceError, SourceEvent,
    SourceEvents, SourceFactory,
};
use crate::host::{HostError, HostEvent, HostProcess};
use crate::scheduler::{Frame, Renderer};
use crate::shared_state::{ThemeColor, TrackMetadata};

// === Sources ===

/// What a scripted source does when asked to play
#[derive(Clone, Debug, PartialEq)]
pub enum OnPlay {
    /// Audio flows, readiness jumps to `HaveEnoughData`, `Playing` fires
    Deliver,
    /// Claims to play but no data ever arrives
    Silent,
    /// Fires an `Error` event straight away
    Fail(String),
}

pub struct ScriptedSource {
    on_play: OnPlay,
    exposed: bool,
    playing: bool,
    flowing: Arc<AtomicBool>,
    ready: ReadyFlag,
    packets: Sender<AudioPacket>,
    tap: Option<SampleTap>,
    events_tx: UnboundedSender<SourceEvent>,
    events_rx: Option<SourceEvents>,
    stats: Option<Rc<FactoryStats>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        let (packets, packets_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let flowing = Arc::new(AtomicBool::new(false));

        Self {
            on_play: OnPlay::Deliver,
            exposed: true,
            playing: false,
            tap: Some(SampleTap::new(packets_rx, Arc::clone(&flowing))),
            flowing,
            ready: ReadyFlag::default(),
            packets,
            events_tx,
            events_rx: Some(events_rx),
            stats: None,
        }
    }

    pub fn behaving(mut self, on_play: OnPlay) -> Self {
        self.on_play = on_play;
        self
    }

    /// Pretend the stream denies sample access
    pub fn hide_samples(&mut self) {
        self.exposed = false;
    }

    pub fn set_flowing(&self, flowing: bool) {
        self.flowing.store(flowing, Ordering::Release);
    }

    /// Queue decoded audio for the analyzer
    pub fn push(&self, packet: AudioPacket) {
        let _ = self.packets.send(packet);
    }
}

impl SignalSource for ScriptedSource {
    fn play(&mut self) -> Result<(), SourceError> {
        self.playing = true;
        match &self.on_play {
            OnPlay::Deliver => {
                self.set_flowing(true);
                self.ready.advance(ReadyState::HaveEnoughData);
                let _ = self.events_tx.send(SourceEvent::Playing);
            }
            OnPlay::Silent => {}
            OnPlay::Fail(reason) => {
                let _ = self.events_tx.send(SourceEvent::Error(reason.clone()));
            }
        }
        if let Some(stats) = &self.stats {
            stats.plays.set(stats.plays.get() + 1);
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
        self.set_flowing(false);
        let _ = self.events_tx.send(SourceEvent::Pause);
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn ready_state(&self) -> ReadyState {
        self.ready.get()
    }

    fn samples_exposed(&self) -> bool {
        self.exposed
    }

    fn take_tap(&mut self) -> Option<SampleTap> {
        self.tap.take()
    }

    fn take_events(&mut self) -> Option<SourceEvents> {
        self.events_rx.take()
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.live.set(stats.live.get() - 1);
        }
    }
}

/// Counters shared between a `ScriptedFactory` and the test
#[derive(Default)]
pub struct FactoryStats {
    opens: Cell<usize>,
    plays: Cell<usize>,
    live: Cell<usize>,
    max_live: Cell<usize>,
    current_events: RefCell<Option<UnboundedSender<SourceEvent>>>,
}

impl FactoryStats {
    pub fn opens(&self) -> usize {
        self.opens.get()
    }

    pub fn plays(&self) -> usize {
        self.plays.get()
    }

    /// Sources not yet dropped
    pub fn live(&self) -> usize {
        self.live.get()
    }

    pub fn max_live(&self) -> usize {
        self.max_live.get()
    }

    /// Raise an event on the most recently opened source
    pub fn inject(&self, event: SourceEvent) -> bool {
        self.current_events
            .borrow()
            .as_ref()
            .map_or(false, |tx| tx.send(event).is_ok())
    }
}

pub struct ScriptedFactory {
    script: VecDeque<OnPlay>,
    fallback: OnPlay,
    refuse_open: bool,
    stats: Rc<FactoryStats>,
}

impl ScriptedFactory {
    /// Every source behaves like `fallback` unless scripted otherwise
    pub fn new(fallback: OnPlay) -> Self {
        Self {
            script: VecDeque::new(),
            fallback,
            refuse_open: false,
            stats: Rc::new(FactoryStats::default()),
        }
    }

    /// Behaviour for the next opened source (in order)
    pub fn then(mut self, on_play: OnPlay) -> Self {
        self.script.push_back(on_play);
        self
    }

    /// `open()` fails before any source exists
    pub fn refusing(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    pub fn stats(&self) -> Rc<FactoryStats> {
        Rc::clone(&self.stats)
    }
}

impl SourceFactory for ScriptedFactory {
    type Source = ScriptedSource;

    fn open(&mut self, _url: &str) -> Result<ScriptedSource, SourceError> {
        let stats = &self.stats;
        stats.opens.set(stats.opens.get() + 1);
        if self.refuse_open {
            return Err(SourceError::Connect("connection refused".into()));
        }

        let on_play = self.script.pop_front().unwrap_or_else(|| self.fallback.clone());
        let mut source = ScriptedSource::new().behaving(on_play);
        source.stats = Some(Rc::clone(stats));

        stats.live.set(stats.live.get() + 1);
        stats.max_live.set(stats.max_live.get().max(stats.live.get()));
        *stats.current_events.borrow_mut() = Some(source.events_tx.clone());

        Ok(source)
    }
}

// === Renderer ===

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedFrame {
    pub generation: u64,
    pub tick: u64,
    pub bar_count: usize,
    pub peak: f32,
    pub color: ThemeColor,
}

#[derive(Default)]
pub struct SpyRenderer {
    frames: RefCell<Vec<RecordedFrame>>,
}

impl SpyRenderer {
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.borrow().clone()
    }

    /// Generation of every frame, in publish order
    pub fn generations(&self) -> Vec<u64> {
        self.frames.borrow().iter().map(|f| f.generation).collect()
    }
}

impl Renderer for SpyRenderer {
    fn render(&self, frame: &Frame<'_>) {
        self.frames.borrow_mut().push(RecordedFrame {
            generation: frame.generation,
            tick: frame.tick,
            bar_count: frame.bars.as_slice().len(),
            peak: frame.bars.peak(),
            color: frame.color,
        });
    }
}

// === Host ===

#[derive(Clone, Debug, PartialEq)]
pub enum HostCall {
    AlwaysOnTop(bool),
    IgnoreCursorEvents(bool),
    ThemeColor(ThemeColor),
    CurrentSong(TrackMetadata),
}

/// What the scripted host saw, plus knobs for making it fail
#[derive(Default)]
pub struct HostLog {
    calls: RefCell<Vec<HostCall>>,
    fail_next: Cell<usize>,
}

impl HostLog {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.borrow().clone()
    }

    /// Fail the next `count` calls (they are still recorded)
    pub fn fail_next(&self, count: usize) {
        self.fail_next.set(count);
    }

    fn record(&self, call: HostCall) -> Result<(), HostError> {
        self.calls.borrow_mut().push(call);
        let failing = self.fail_next.get();
        if failing > 0 {
            self.fail_next.set(failing - 1);
            return Err(HostError::Disconnected);
        }
        Ok(())
    }
}

pub struct ScriptedHost {
    log: Rc<HostLog>,
    events: Option<UnboundedReceiver<HostEvent>>,
}

impl ScriptedHost {
    /// Host without a push channel
    pub fn new() -> (Self, Rc<HostLog>) {
        let log = Rc::new(HostLog::default());
        let host = Self {
            log: Rc::clone(&log),
            events: None,
        };
        (host, log)
    }

    /// Host that pushes events through the returned sender
    pub fn with_events() -> (Self, Rc<HostLog>, UnboundedSender<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mut host, log) = Self::new();
        host.events = Some(rx);
        (host, log, tx)
    }
}

impl HostProcess for ScriptedHost {
    async fn set_always_on_top(&self, flag: bool) -> Result<(), HostError> {
        self.log.record(HostCall::AlwaysOnTop(flag))
    }

    async fn set_ignore_cursor_events(&self, flag: bool) -> Result<(), HostError> {
        self.log.record(HostCall::IgnoreCursorEvents(flag))
    }

    async fn set_theme_color(&self, color: ThemeColor) -> Result<(), HostError> {
        self.log.record(HostCall::ThemeColor(color))
    }

    async fn send_current_song(&self, track: &TrackMetadata) -> Result<(), HostError> {
        self.log.record(HostCall::CurrentSong(track.clone()))
    }

    fn take_events(&mut self) -> Option<UnboundedReceiver<HostEvent>> {
        self.events.take()
    }
}

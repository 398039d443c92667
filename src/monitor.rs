//! Stream health monitor and reconnector.
//!
//! The monitor owns the one audio pipeline (source, analyzer, scheduler) for
//! the life of the process. Source events, the liveness probe, retry timers
//! and explicit reconnect requests are all fed through `transition`, a pure
//! function from (state, event) to the next state plus the side effects to
//! perform. The async runner only executes those effects.

use std::collections::VecDeque;
use std::future;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::analyzer::{AnalyzerError, MagnitudeScale, SpectralAnalyzer};
use crate::audio_source::{ReadyState, SignalSource, SourceError, SourceEvent, SourceEvents, SourceFactory};
use crate::scheduler::{RenderScheduler, Renderer, SchedulerHandle};
use crate::shared_state::{OverlayState, PlaybackState};

/// Why a healthy or connecting link was declared stalled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallCause {
    SourceError,
    NoData,
    InitFailed,
    Requested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Healthy,
    Stalled(StallCause),
    Reconnecting,
}

impl LinkState {
    /// What the user gets to see
    pub fn playback(self, failed_before: bool) -> PlaybackState {
        match self {
            LinkState::Disconnected if failed_before => PlaybackState::Failed,
            LinkState::Disconnected => PlaybackState::Idle,
            LinkState::Connecting | LinkState::Reconnecting => PlaybackState::Connecting,
            LinkState::Healthy => PlaybackState::Playing,
            LinkState::Stalled(_) => PlaybackState::Stalled,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    /// Process startup
    Start,
    /// Someone asked for a fresh connection
    ReconnectRequested,
    SourcePlaying,
    SourcePaused,
    SourceFailed(String),
    /// Liveness probe: playing, yet no data ever arrived
    ProbeStalled,
    /// Building the pipeline failed before playback started
    InitFailed(String),
    /// The previous pipeline is fully released
    TornDown,
    /// The retry delay ran out
    BackoffElapsed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    BuildPipeline,
    Teardown,
    ResumePlayback,
    ScheduleRetry(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Flat delay between failed attempts; retries never stop
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Result of one transition
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub next: LinkState,
    pub actions: Vec<Action>,
    /// Event to feed back once `actions` have run
    pub follow_up: Option<MonitorEvent>,
}

impl Step {
    fn to(next: LinkState, actions: Vec<Action>) -> Self {
        Self {
            next,
            actions,
            follow_up: None,
        }
    }

    fn stay(state: LinkState) -> Self {
        Self::to(state, Vec::new())
    }

    /// Tear the pipeline down, then report back so reconnection can start
    fn stall(cause: StallCause) -> Self {
        Self {
            next: LinkState::Stalled(cause),
            actions: vec![Action::Teardown],
            follow_up: Some(MonitorEvent::TornDown),
        }
    }

    /// Whether anything happens at all
    pub fn is_noop(&self, from: LinkState) -> bool {
        self.next == from && self.actions.is_empty() && self.follow_up.is_none()
    }
}

/// The monitor's whole decision table
pub fn transition(state: &LinkState, event: &MonitorEvent, policy: &ReconnectPolicy) -> Step {
    use LinkState::*;
    use MonitorEvent::*;

    match (*state, event) {
        (Disconnected, Start | ReconnectRequested | BackoffElapsed) => {
            Step::to(Connecting, vec![Action::BuildPipeline])
        }

        (Connecting | Reconnecting, SourcePlaying) => Step::to(Healthy, Vec::new()),

        (Connecting | Healthy, SourceFailed(_)) => Step::stall(StallCause::SourceError),
        (Connecting | Healthy, ProbeStalled) => Step::stall(StallCause::NoData),
        (Connecting | Healthy, InitFailed(_)) => Step::stall(StallCause::InitFailed),
        (Connecting | Healthy | Reconnecting, ReconnectRequested) => Step::stall(StallCause::Requested),

        (Stalled(_), TornDown) => Step::to(Reconnecting, vec![Action::BuildPipeline]),

        (Reconnecting, SourceFailed(_) | ProbeStalled | InitFailed(_)) => Step::to(
            Disconnected,
            vec![Action::Teardown, Action::ScheduleRetry(policy.retry_delay)],
        ),

        // Paused out from under us (e.g. the stream dropped us): ask again
        (Healthy, SourcePaused) => Step::to(Connecting, vec![Action::ResumePlayback]),

        (state, _) => Step::stay(state),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("source events already taken")]
    EventsTaken,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Source(e) => e.is_fatal(),
            PipelineError::Analyzer(AnalyzerError::SamplesHidden) => true,
            _ => false,
        }
    }
}

/// Runtime knobs for the monitor
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub stream_url: String,
    pub probe_interval: Duration,
    pub retry_delay: Duration,
    pub frame_interval: Duration,
    pub scale: MagnitudeScale,
}

impl MonitorSettings {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            probe_interval: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            frame_interval: Duration::from_micros(16_667),
            scale: MagnitudeScale::default(),
        }
    }
}

/// Cloneable, thread-safe way to ask the monitor for a fresh connection
#[derive(Clone, Debug)]
pub struct MonitorHandle {
    requests: mpsc::UnboundedSender<()>,
}

impl MonitorHandle {
    /// Returns false once the monitor has stopped
    pub fn reconnect(&self) -> bool {
        self.requests.send(()).is_ok()
    }
}

/// The one live pipeline
struct AudioPipeline<S> {
    source: S,
    scheduler: SchedulerHandle,
    generation: u64,
    started: Instant,
}

enum Wake {
    Shutdown,
    Source(SourceEvent),
    Reconnect,
    RetryDue,
    Probe,
}

pub struct StreamMonitor<F: SourceFactory, R: Renderer> {
    factory: F,
    renderer: Rc<R>,
    state: Rc<OverlayState>,
    settings: MonitorSettings,
    policy: ReconnectPolicy,

    link: LinkState,
    pipeline: Option<AudioPipeline<F::Source>>,
    events: Option<SourceEvents>,
    generation: u64,
    failures: u32,
    retry_at: Option<Instant>,

    requests_tx: mpsc::UnboundedSender<()>,
    requests_rx: mpsc::UnboundedReceiver<()>,
    observer: Option<mpsc::UnboundedSender<LinkState>>,
}

impl<F, R> StreamMonitor<F, R>
where
    F: SourceFactory,
    R: Renderer + 'static,
{
    pub fn new(factory: F, renderer: Rc<R>, state: Rc<OverlayState>, settings: MonitorSettings) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy {
            retry_delay: settings.retry_delay,
        };

        Self {
            factory,
            renderer,
            state,
            settings,
            policy,
            link: LinkState::Disconnected,
            pipeline: None,
            events: None,
            generation: 0,
            failures: 0,
            retry_at: None,
            requests_tx,
            requests_rx,
            observer: None,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            requests: self.requests_tx.clone(),
        }
    }

    /// Receive every state change
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<LinkState>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until `shutdown` turns true (or its sender goes away), then
    /// release the pipeline.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("[Monitor] Watching {}", self.settings.stream_url);

        let period = self.settings.probe_interval;
        let mut probe = time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.dispatch(MonitorEvent::Start).await;

        loop {
            let wake = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => Wake::Shutdown,
                event = next_source_event(&mut self.events) => Wake::Source(event),
                Some(()) = self.requests_rx.recv() => Wake::Reconnect,
                _ = retry_due(self.retry_at) => Wake::RetryDue,
                _ = probe.tick() => Wake::Probe,
            };

            let event = match wake {
                Wake::Shutdown => break,
                Wake::Source(SourceEvent::Playing) => MonitorEvent::SourcePlaying,
                Wake::Source(SourceEvent::Pause) => MonitorEvent::SourcePaused,
                Wake::Source(SourceEvent::Error(reason)) => MonitorEvent::SourceFailed(reason),
                Wake::Reconnect => {
                    tracing::info!("[Monitor] Reconnect requested");
                    MonitorEvent::ReconnectRequested
                }
                Wake::RetryDue => {
                    self.retry_at = None;
                    MonitorEvent::BackoffElapsed
                }
                Wake::Probe => {
                    if !self.probe_detects_stall() {
                        continue;
                    }
                    tracing::warn!("[Monitor] Probe: playing but no data has arrived");
                    MonitorEvent::ProbeStalled
                }
            };

            self.dispatch(event).await;
        }

        self.teardown().await;
        tracing::info!("[Monitor] Stopped");
    }

    // === Effects ===

    async fn dispatch(&mut self, event: MonitorEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let step = transition(&self.link, &event, &self.policy);
            if step.is_noop(self.link) {
                tracing::trace!("[Monitor] Ignoring {:?} while {:?}", event, self.link);
                continue;
            }

            match &event {
                MonitorEvent::SourceFailed(reason) | MonitorEvent::InitFailed(reason) => {
                    self.failures += 1;
                    tracing::warn!("[Monitor] Stream failure #{}: {}", self.failures, reason);
                    self.state.report_error(Some(reason.clone()));
                }
                MonitorEvent::SourcePlaying => {
                    tracing::info!("[Monitor] Stream playing (generation {})", self.generation);
                    self.failures = 0;
                    self.state.report_error(None);
                }
                _ => {}
            }

            if step.next != self.link {
                tracing::debug!("[Monitor] {:?} -> {:?} on {:?}", self.link, step.next, event);
                self.link = step.next;
                self.publish();
            }

            for action in step.actions {
                if let Some(feedback) = self.perform(action).await {
                    queue.push_back(feedback);
                }
            }
            if let Some(follow_up) = step.follow_up {
                queue.push_back(follow_up);
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<MonitorEvent> {
        match action {
            Action::BuildPipeline => {
                self.retry_at = None;
                // Never two pipelines: release whatever is left first
                self.teardown().await;
                match self.build_pipeline() {
                    Ok(()) => None,
                    Err(e) => {
                        if e.is_fatal() {
                            tracing::error!("[Monitor] Pipeline cannot start: {} (retrying anyway)", e);
                        }
                        Some(MonitorEvent::InitFailed(e.to_string()))
                    }
                }
            }
            Action::Teardown => {
                self.teardown().await;
                None
            }
            Action::ResumePlayback => {
                let pipeline = self.pipeline.as_mut()?;
                tracing::info!("[Monitor] Source paused, resuming playback");
                match pipeline.source.play() {
                    Ok(()) => None,
                    Err(e) => Some(MonitorEvent::SourceFailed(e.to_string())),
                }
            }
            Action::ScheduleRetry(delay) => {
                tracing::info!("[Monitor] Retrying in {:?}", delay);
                self.retry_at = Some(Instant::now() + delay);
                None
            }
        }
    }

    fn build_pipeline(&mut self) -> Result<(), PipelineError> {
        let mut source = self.factory.open(&self.settings.stream_url)?;
        let analyzer = SpectralAnalyzer::attach(&mut source, self.settings.scale)?;
        // Subscribe before play() so the first `playing` can't be missed
        let events = source.take_events().ok_or(PipelineError::EventsTaken)?;
        source.play()?;

        self.generation += 1;
        let scheduler = RenderScheduler::new(
            analyzer,
            Rc::clone(&self.renderer),
            Rc::clone(&self.state),
            self.generation,
            self.settings.frame_interval,
        )
        .spawn();

        tracing::debug!("[Monitor] Pipeline generation {} built", self.generation);

        self.events = Some(events);
        self.pipeline = Some(AudioPipeline {
            source,
            scheduler,
            generation: self.generation,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Cancel the scheduler, stop the source and drop everything. Completes
    /// before any new pipeline is built.
    async fn teardown(&mut self) {
        self.events = None;
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };

        let AudioPipeline {
            mut source,
            scheduler,
            generation,
            ..
        } = pipeline;

        // Analyzer lives inside the scheduler task and goes with it
        let ticks = scheduler.ticks();
        scheduler.cancel().await;
        source.pause();
        drop(source);

        tracing::debug!("[Monitor] Pipeline generation {} released after {} frames", generation, ticks);
    }

    fn probe_detects_stall(&self) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        pipeline.started.elapsed() >= self.settings.probe_interval
            && pipeline.source.is_playing()
            && pipeline.source.ready_state() == ReadyState::HaveNothing
    }

    fn publish(&self) {
        self.state.set_playback(self.link.playback(self.failures > 0));
        if let Some(observer) = &self.observer {
            let _ = observer.send(self.link);
        }
    }
}

/// Next event from the current source. A closed channel reports one error
/// and then goes quiet until a new pipeline installs its own receiver.
async fn next_source_event(events: &mut Option<SourceEvents>) -> SourceEvent {
    let Some(rx) = events.as_mut() else {
        return future::pending().await;
    };
    let next = rx.recv().await;
    match next {
        Some(event) => event,
        None => {
            *events = None;
            SourceEvent::Error("source went away".into())
        }
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

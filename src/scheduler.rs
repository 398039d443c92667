use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::analyzer::{FrequencyVector, SpectralAnalyzer};
use crate::shared_state::{OverlayState, ThemeColor};

/// One published frame
#[derive(Debug)]
pub struct Frame<'a> {
    /// Pipeline that produced the frame
    pub generation: u64,
    /// Tick number within that pipeline, starting at 0
    pub tick: u64,
    pub bars: &'a FrequencyVector,
    /// Largest value a bar can take (255 in byte mode, 1 in decibel mode)
    pub full_scale: f32,
    pub color: ThemeColor,
}

/// External bar renderer. Pure sink: it gets a frame and gives nothing back.
pub trait Renderer {
    fn render(&self, frame: &Frame<'_>);
}

/// Drives one analyzer at display cadence
pub struct RenderScheduler<R: Renderer> {
    analyzer: SpectralAnalyzer,
    renderer: Rc<R>,
    state: Rc<OverlayState>,
    generation: u64,
    interval: Duration,
}

impl<R: Renderer + 'static> RenderScheduler<R> {
    pub fn new(
        analyzer: SpectralAnalyzer,
        renderer: Rc<R>,
        state: Rc<OverlayState>,
        generation: u64,
        interval: Duration,
    ) -> Self {
        Self {
            analyzer,
            renderer,
            state,
            generation,
            interval,
        }
    }

    /// Start ticking on the current `LocalSet`
    pub fn spawn(self) -> SchedulerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ticks = Rc::new(Cell::new(0));
        let generation = self.generation;

        let task = tokio::task::spawn_local(self.run(cancel_rx, Rc::clone(&ticks)));

        SchedulerHandle {
            cancel: cancel_tx,
            task: Some(task),
            ticks,
            generation,
        }
    }

    async fn run(mut self, mut cancel: watch::Receiver<bool>, ticks: Rc<Cell<u64>>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!("[Scheduler] Generation {} started", self.generation);

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            // Cancellation lands between ticks, never inside one
            if *cancel.borrow() {
                break;
            }

            let tick = ticks.get();
            self.tick(tick);
            ticks.set(tick + 1);
        }

        tracing::debug!(
            "[Scheduler] Generation {} stopped after {} ticks",
            self.generation,
            ticks.get()
        );
    }

    fn tick(&mut self, tick: u64) {
        // Best effort: a source that isn't flowing yet just means another
        // frame of the last vector
        if let Err(e) = self.analyzer.resume_if_suspended() {
            if tick == 0 {
                tracing::debug!("[Scheduler] Transform still suspended: {}", e);
            }
        }

        let bars = self.analyzer.sample();
        let frame = Frame {
            generation: self.generation,
            tick,
            bars: &bars,
            full_scale: self.analyzer.scale().full_scale(),
            color: self.state.intent().theme_color,
        };
        self.renderer.render(&frame);
    }
}

/// Owner's side of a running scheduler.
///
/// Dropping the handle cancels the scheduler at its next tick boundary;
/// `cancel()` also waits until it has stopped.
pub struct SchedulerHandle {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    ticks: Rc<Cell<u64>>,
    generation: u64,
}

impl SchedulerHandle {
    /// Ticks completed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Cancel and wait for the loop to exit. No tick runs after this returns.
    pub async fn cancel(mut self) {
        self.cancel.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("[Scheduler] Generation {} ended abnormally: {}", self.generation, e);
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

// ============ Tests ============
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::MagnitudeScale;
    use crate::shared_state::WindowIntent;
    use crate::testing::{ScriptedSource, SpyRenderer};
    use tokio::task::LocalSet;

    const FRAME: Duration = Duration::from_millis(16);

    fn scheduler(
        source: &mut ScriptedSource,
        renderer: &Rc<SpyRenderer>,
        state: &Rc<OverlayState>,
        generation: u64,
    ) -> RenderScheduler<SpyRenderer> {
        let analyzer = SpectralAnalyzer::attach(source, MagnitudeScale::Byte).unwrap();
        RenderScheduler::new(analyzer, Rc::clone(renderer), Rc::clone(state), generation, FRAME)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_publish_until_cancelled() {
        LocalSet::new()
            .run_until(async {
                let renderer = Rc::new(SpyRenderer::default());
                let state = Rc::new(OverlayState::default());
                let mut source = ScriptedSource::new();
                source.set_flowing(true);

                let handle = scheduler(&mut source, &renderer, &state, 7).spawn();
                time::sleep(Duration::from_millis(100)).await;

                let published = renderer.frames().len();
                assert!(published >= 5, "only {} frames", published);
                assert_eq!(handle.ticks() as usize, published);
                assert!(renderer.frames().iter().all(|f| f.generation == 7));

                // Tick numbers are strictly sequential
                for (i, frame) in renderer.frames().iter().enumerate() {
                    assert_eq!(frame.tick, i as u64);
                }

                handle.cancel().await;
                time::sleep(Duration::from_millis(200)).await;
                assert_eq!(renderer.frames().len(), published);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        LocalSet::new()
            .run_until(async {
                let renderer = Rc::new(SpyRenderer::default());
                let state = Rc::new(OverlayState::default());
                let mut source = ScriptedSource::new();

                let handle = scheduler(&mut source, &renderer, &state, 1).spawn();
                time::sleep(Duration::from_millis(50)).await;
                drop(handle);

                // One more wakeup may observe the flag; nothing after that
                time::sleep(Duration::from_millis(20)).await;
                let settled = renderer.frames().len();
                time::sleep(Duration::from_millis(200)).await;
                assert_eq!(renderer.frames().len(), settled);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_follow_theme_color() {
        LocalSet::new()
            .run_until(async {
                let renderer = Rc::new(SpyRenderer::default());
                let state = Rc::new(OverlayState::default());
                let mut source = ScriptedSource::new();

                let handle = scheduler(&mut source, &renderer, &state, 1).spawn();
                time::sleep(Duration::from_millis(40)).await;

                let red = ThemeColor::from_rgb(255, 0, 0);
                state.set_intent(WindowIntent {
                    theme_color: red,
                    ..state.intent()
                });
                time::sleep(Duration::from_millis(40)).await;
                handle.cancel().await;

                let frames = renderer.frames();
                assert_eq!(frames[0].color, ThemeColor::DEFAULT_BARS);
                assert_eq!(frames.last().map(|f| f.color), Some(red));
                assert!(frames.iter().all(|f| f.bar_count == crate::analyzer::BAR_COUNT));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_source_still_publishes_last_vector() {
        LocalSet::new()
            .run_until(async {
                let renderer = Rc::new(SpyRenderer::default());
                let state = Rc::new(OverlayState::default());
                let mut source = ScriptedSource::new();

                // Source never starts flowing: every frame is the silent vector
                let handle = scheduler(&mut source, &renderer, &state, 3).spawn();
                time::sleep(Duration::from_millis(100)).await;
                handle.cancel().await;

                let frames = renderer.frames();
                assert!(!frames.is_empty());
                assert!(frames.iter().all(|f| f.peak == 0.0));
            })
            .await;
    }
}

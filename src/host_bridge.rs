use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::host::{HostError, HostEvent, HostProcess};
use crate::metadata::{self, MetadataError};
use crate::shared_state::{OverlayState, ThemeColor, TrackMetadata, WindowIntent};

/// Local user interaction with the overlay window
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UiCommand {
    TogglePinned,
    ToggleClickThrough,
    SetThemeColor(ThemeColor),
}

/// Cloneable sender for `UiCommand`s; safe to use from any thread
#[derive(Clone, Debug)]
pub struct ControlHandle {
    commands: UnboundedSender<UiCommand>,
}

impl ControlHandle {
    /// Returns false once the bridge has stopped
    pub fn send(&self, command: UiCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn toggle_pinned(&self) -> bool {
        self.send(UiCommand::TogglePinned)
    }

    pub fn toggle_click_through(&self) -> bool {
        self.send(UiCommand::ToggleClickThrough)
    }

    pub fn set_theme_color(&self, color: ThemeColor) -> bool {
        self.send(UiCommand::SetThemeColor(color))
    }
}

/// Where now-playing information comes from when the host doesn't push it
#[derive(Clone, Debug)]
pub struct MetadataSettings {
    pub status_url: String,
    pub poll_interval: Duration,
    pub feed_url: Option<String>,
    /// Pause before reopening the event feed after it drops
    pub feed_retry: Duration,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            status_url: "http://localhost:8000/status-json.xsl".into(),
            poll_interval: Duration::from_secs(10),
            feed_url: None,
            feed_retry: metadata::FEED_RECONNECT_DELAY,
        }
    }
}

/// Inbound metadata channel, best first
enum Inbound {
    /// Host pushes `song-info-update`
    Push(UnboundedReceiver<HostEvent>),
    /// Server-sent event feed
    Feed(UnboundedReceiver<TrackMetadata>),
    /// Status endpoint on a timer
    Poll {
        ticker: Interval,
        agent: ureq::Agent,
        url: String,
        pending: Option<JoinHandle<Result<TrackMetadata, MetadataError>>>,
    },
}

enum Update {
    Host(HostEvent),
    Track(TrackMetadata),
    PollFailed(String),
    Closed,
}

impl Inbound {
    fn name(&self) -> &'static str {
        match self {
            Inbound::Push(_) => "host push",
            Inbound::Feed(_) => "event feed",
            Inbound::Poll { .. } => "status polling",
        }
    }

    fn poll(url: String, interval: Duration) -> Self {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Inbound::Poll {
            ticker,
            agent: metadata::status_agent(),
            url,
            pending: None,
        }
    }

    /// Cancel safe: an in-flight fetch survives being dropped mid-await
    async fn next(&mut self) -> Update {
        match self {
            Inbound::Push(events) => events.recv().await.map_or(Update::Closed, Update::Host),
            Inbound::Feed(tracks) => tracks.recv().await.map_or(Update::Closed, Update::Track),
            Inbound::Poll {
                ticker,
                agent,
                url,
                pending,
            } => {
                if pending.is_none() {
                    ticker.tick().await;
                    let agent = agent.clone();
                    let url = url.clone();
                    *pending = Some(tokio::task::spawn_blocking(move || {
                        metadata::fetch_status(&agent, &url)
                    }));
                }

                let result = match pending.as_mut() {
                    Some(fetch) => fetch.await,
                    None => return Update::PollFailed("no fetch in flight".into()),
                };
                *pending = None;

                match result {
                    Ok(Ok(track)) => Update::Track(track),
                    Ok(Err(e)) => Update::PollFailed(e.to_string()),
                    Err(e) => Update::PollFailed(e.to_string()),
                }
            }
        }
    }
}

/// Keeps window behaviour and now-playing info in sync with the host.
///
/// Outbound: local intent is applied to `OverlayState` first and only then
/// mirrored to the host. A failed notification is logged and never undone.
///
/// Inbound: track metadata from host push events, else an event feed, else
/// polling. Independent of the audio pipeline.
pub struct HostBridge<H: HostProcess> {
    host: H,
    state: Rc<OverlayState>,
    settings: MetadataSettings,
    commands: UnboundedReceiver<UiCommand>,
}

impl<H: HostProcess> HostBridge<H> {
    pub fn new(host: H, state: Rc<OverlayState>, settings: MetadataSettings) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            host,
            state,
            settings,
            commands: rx,
        };
        (bridge, ControlHandle { commands: tx })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.announce().await;

        let mut inbound = self.open_inbound();
        tracing::info!("[Bridge] Metadata via {}", inbound.name());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(command) = self.commands.recv() => self.apply(command).await,
                update = inbound.next() => match update {
                    Update::Host(event) => self.on_host_event(event).await,
                    Update::Track(track) => self.update_track(track),
                    Update::PollFailed(e) => {
                        // Keep showing the last known track
                        tracing::debug!("[Bridge] Status poll failed: {}", e);
                    }
                    Update::Closed => {
                        inbound = self.fallback_inbound(&inbound);
                        tracing::warn!("[Bridge] Metadata channel closed, falling back to {}", inbound.name());
                    }
                },
            }
        }

        tracing::info!("[Bridge] Stopped");
    }

    // === Outbound ===

    /// Mirror the whole initial intent so host and overlay start in agreement
    async fn announce(&self) {
        let intent = self.state.intent();
        let results = [
            ("always-on-top", self.host.set_always_on_top(intent.pinned).await),
            ("click-through", self.host.set_ignore_cursor_events(intent.click_through).await),
            ("theme color", self.host.set_theme_color(intent.theme_color).await),
        ];
        for (what, result) in results {
            if let Err(e) = result {
                Self::log_host_failure(what, &e);
            }
        }
    }

    async fn apply(&self, command: UiCommand) {
        let before = self.state.intent();
        let intent = match command {
            UiCommand::TogglePinned => WindowIntent {
                pinned: !before.pinned,
                ..before
            },
            UiCommand::ToggleClickThrough => WindowIntent {
                click_through: !before.click_through,
                ..before
            },
            UiCommand::SetThemeColor(color) => WindowIntent {
                theme_color: color,
                ..before
            },
        };

        // Local state first; the host only ever follows
        self.state.set_intent(intent);

        let (what, result) = match command {
            UiCommand::TogglePinned => {
                tracing::info!("[Bridge] Window State: pinned={}", intent.pinned);
                ("always-on-top", self.host.set_always_on_top(intent.pinned).await)
            }
            UiCommand::ToggleClickThrough => {
                tracing::info!("[Bridge] Window State: click-through={}", intent.click_through);
                ("click-through", self.host.set_ignore_cursor_events(intent.click_through).await)
            }
            UiCommand::SetThemeColor(color) => {
                tracing::info!("[Bridge] Theme color: {}", color);
                ("theme color", self.host.set_theme_color(color).await)
            }
        };

        if let Err(e) = result {
            Self::log_host_failure(what, &e);
        }
    }

    fn log_host_failure(what: &str, error: &HostError) {
        match error {
            HostError::Unavailable => tracing::debug!("[Bridge] No host to notify of {} change", what),
            _ => tracing::warn!("[Bridge] Host {} notification failed: {} (local state kept)", what, error),
        }
    }

    // === Inbound ===

    fn open_inbound(&mut self) -> Inbound {
        match self.host.take_events() {
            Some(events) => Inbound::Push(events),
            None => self.without_push(),
        }
    }

    fn fallback_inbound(&self, closed: &Inbound) -> Inbound {
        match closed {
            Inbound::Push(_) => self.without_push(),
            _ => Inbound::poll(self.settings.status_url.clone(), self.settings.poll_interval),
        }
    }

    fn without_push(&self) -> Inbound {
        if let Some(url) = &self.settings.feed_url {
            let (tx, rx) = mpsc::unbounded_channel();
            match metadata::spawn_event_feed(url.clone(), self.settings.feed_retry, tx) {
                Ok(_) => return Inbound::Feed(rx),
                Err(e) => tracing::warn!("[Bridge] Could not start event feed: {}", e),
            }
        }
        Inbound::poll(self.settings.status_url.clone(), self.settings.poll_interval)
    }

    async fn on_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::SongInfoUpdate(payload) => self.update_track(payload.into()),
            HostEvent::GetCurrentSong => {
                let track = self.state.track();
                if let Err(e) = self.host.send_current_song(&track).await {
                    Self::log_host_failure("current song", &e);
                }
            }
        }
    }

    fn update_track(&self, track: TrackMetadata) {
        if self.state.track() != track {
            tracing::info!("[Bridge] Now playing: {}", track);
            self.state.set_track(track);
        }
    }
}

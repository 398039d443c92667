use std::cell::Cell;
use std::io::IsTerminal;
use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::LocalSet;

use radioscope::config::{HostMode, OverlayConfig};
use radioscope::host::{DetachedHost, HostProcess, StdioHost};
use radioscope::host_bridge::{ControlHandle, HostBridge};
use radioscope::http_source::HttpSourceFactory;
use radioscope::logging;
use radioscope::monitor::{MonitorHandle, StreamMonitor};
use radioscope::scheduler::{Frame, Renderer};
use radioscope::shared_state::OverlayState;

// ========================================================================
// RENDERING WITHOUT A HOST
// ========================================================================

/// Stand-in renderer for detached runs: summarises frames in the log
#[derive(Default)]
struct FrameLog {
    generation: Cell<u64>,
}

impl Renderer for FrameLog {
    fn render(&self, frame: &Frame<'_>) {
        if frame.generation != self.generation.get() {
            self.generation.set(frame.generation);
            tracing::info!("[Render] Pipeline generation {} publishing", frame.generation);
        }
        if frame.tick % 60 == 0 {
            tracing::debug!(
                "[Render] gen {} tick {}: peak {:.2} of {} in {}",
                frame.generation,
                frame.tick,
                frame.bars.peak(),
                frame.full_scale,
                frame.color
            );
        }
    }
}

// ========================================================================
// SIGNALS
// ========================================================================
//    SIGUSR1 toggles pinned, SIGUSR2 toggles click-through, SIGHUP reconnects

#[cfg(unix)]
fn spawn_signal_controls(control: ControlHandle, monitor: MonitorHandle) -> std::io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGUSR1, SIGUSR2};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGUSR1, SIGUSR2, SIGHUP])?;

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                let delivered = match signal {
                    SIGUSR1 => control.toggle_pinned(),
                    SIGUSR2 => control.toggle_click_through(),
                    SIGHUP => monitor.reconnect(),
                    _ => true,
                };
                if !delivered {
                    break;
                }
            }
        })?;

    tracing::info!("[Main] Controls: SIGUSR1 = pin, SIGUSR2 = click-through, SIGHUP = reconnect");
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_controls(_control: ControlHandle, _monitor: MonitorHandle) -> std::io::Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("[Main] SIGTERM handler unavailable: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[Main] Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

// ========================================================================
// WIRING
// ========================================================================

async fn run(config: OverlayConfig) -> Result<()> {
    let mode = match config.host {
        HostMode::Auto if std::io::stdin().is_terminal() => HostMode::Detached,
        HostMode::Auto => HostMode::Stdio,
        mode => mode,
    };

    match mode {
        HostMode::Stdio => {
            let host = StdioHost::spawn().context("Failed to attach to host over stdio")?;
            let frames = Rc::new(host.frame_sink());
            run_with(config, host, frames).await
        }
        _ => {
            tracing::info!("[Main] No host attached, window commands stay local");
            run_with(config, DetachedHost::new(), Rc::new(FrameLog::default())).await
        }
    }
}

async fn run_with<H, R>(config: OverlayConfig, host: H, renderer: Rc<R>) -> Result<()>
where
    H: HostProcess + 'static,
    R: Renderer + 'static,
{
    let state = Rc::new(OverlayState::new(config.initial_intent()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (bridge, control) = HostBridge::new(host, Rc::clone(&state), config.metadata_settings());
    let monitor = StreamMonitor::new(
        HttpSourceFactory::new(),
        renderer,
        Rc::clone(&state),
        config.monitor_settings(),
    );
    let reconnect = monitor.handle();

    let bridge_task = tokio::task::spawn_local(bridge.run(shutdown_rx.clone()));
    let monitor_task = tokio::task::spawn_local(monitor.run(shutdown_rx));

    if let Err(e) = spawn_signal_controls(control, reconnect) {
        tracing::warn!("[Main] Signal controls unavailable: {}", e);
    }

    shutdown_signal().await;

    tracing::info!("[Main] Shutting down...");
    shutdown_tx.send_replace(true);

    if let Err(e) = monitor_task.await {
        tracing::error!("[Main] Monitor task failed: {}", e);
    }
    if let Err(e) = bridge_task.await {
        tracing::error!("[Main] Bridge task failed: {}", e);
    }

    tracing::info!(
        "[Main] ✓ Shutdown complete (last state: {:?}, now playing: {})",
        state.playback(),
        state.track()
    );
    Ok(())
}

fn main() -> Result<()> {
    // Logging depends on the config, so a bad file is reported once logging is up
    let (config, config_error) = match OverlayConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (OverlayConfig::default(), Some(e)),
    };

    let _log_guard = logging::init(&config.log)?;
    tracing::info!("=== radioscope {} ===", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        tracing::warn!("[Main] {} (using defaults)", e);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build event loop")?;

    LocalSet::new().block_on(&runtime, run(config))
}

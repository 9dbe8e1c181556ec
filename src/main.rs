//! voxcore: runtime core of a voice-assistant device
//!
//! The daemon runs the device orchestrator on a dedicated thread and
//! provides:
//! - Device state machine driven by event flags and scheduled tasks
//! - Activation and firmware check worker
//! - Streaming MP3 playback with lyrics and progress tracking
//! - Tools (music, display, countdown, memo) exposed over MCP and IPC
//! - IPC server for local clients
//!
//! Board collaborators are host implementations: audio output is paced and
//! discarded, and UI changes are written to the log.

mod activation;
mod clock;
mod config;
mod device;
mod events;
mod ipc;
mod lifecycle;
mod media;
mod orchestrator;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod tools;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::ClockTimer;
use crate::config::Config;
use crate::device::host::{HostAudioService, HostBoard, HostCodec, HostProtocol};
use crate::device::{HttpOta, LogDisplay, Services};
use crate::events::EventFlagSet;
use crate::ipc::{Notification, Server};
use crate::lifecycle::ShutdownSignal;
use crate::media::{HttpSource, Mp3DecoderFactory};
use crate::orchestrator::{AppOptions, Application, MediaBackend, Scheduler};
use crate::state::DeviceStateMachine;
use crate::store::JsonFileStore;
use crate::tools::{build_registry, CountdownTimer, McpServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "voxcore starting");

    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, ota_url = %config.ota_url, aec = ?config.aec_mode, "configuration loaded");

    let mut shutdown = ShutdownSignal::new()?;

    let events = Arc::new(EventFlagSet::new());
    let scheduler = Scheduler::new(Arc::clone(&events));
    let state = Arc::new(DeviceStateMachine::new());

    let settings = JsonFileStore::open(&config.settings_path)
        .with_context(|| format!("failed to open {}", config.settings_path.display()))?;
    let ota = HttpOta::new(config.ota_url.clone(), config.data_dir.clone())
        .context("failed to create OTA client")?;
    let services = Services {
        protocol: Arc::new(HostProtocol::new()),
        audio: Arc::new(HostAudioService::new()),
        codec: Arc::new(HostCodec::new(config.output_sample_rate, config.output_channels)),
        display: Arc::new(LogDisplay),
        board: Arc::new(HostBoard::new(Arc::clone(&events))),
        ota: Arc::new(ota),
        settings: Arc::new(settings),
    };

    let media = MediaBackend {
        source: Arc::new(
            HttpSource::new(config.stream_connect_timeout).context("failed to create HTTP client")?,
        ),
        decoders: Arc::new(Mp3DecoderFactory),
    };
    let app = Application::new(
        services.clone(),
        scheduler.clone(),
        Arc::clone(&state),
        AppOptions {
            aec_mode: config.aec_mode,
            player: config.player.clone(),
            activation: config.activation.clone(),
        },
        media,
    );

    // Tools answer both the server (MCP) and local clients (IPC)
    let countdown = Arc::new(CountdownTimer::new(
        services.clone(),
        scheduler.clone(),
        Duration::from_secs(1),
    ));
    let registry = Arc::new(build_registry(
        &app,
        Arc::clone(&countdown),
        services.clone(),
        scheduler.clone(),
    ));
    app.set_tool_server(Arc::new(McpServer::new(Arc::clone(&registry))));
    info!(tools = registry.list().len(), "tools registered");

    // State machine -> IPC subscribers
    let (notify_tx, _) = broadcast::channel::<Notification>(64);
    let state_tx = notify_tx.clone();
    state.add_state_change_listener(move |from, to| {
        // No subscribers is not an error
        let _ = state_tx.send(Notification::StateChanged { from, to });
    });

    let clock = ClockTimer::new(Arc::clone(&events), Duration::from_secs(1));
    if let Err(e) = clock.start() {
        error!(?e, "failed to start clock");
    }

    let orchestrator = {
        let app = Arc::clone(&app);
        thread::Builder::new()
            .name("orchestrator".to_string())
            .spawn(move || {
                app.start();
                app.run();
            })
            .context("failed to spawn orchestrator thread")?
    };
    let mut orchestrator_done = tokio::task::spawn_blocking(move || orchestrator.join());

    // The host is online from the start
    app.notify_network_connected();

    let server = Server::new(&config.socket_path, Arc::clone(&app), registry, notify_tx)?;

    info!("daemon initialized, entering main loop");

    let mut orchestrator_exited = false;
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = &mut orchestrator_done => {
            info!("dispatch loop exited");
            orchestrator_exited = true;
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    let cleanup_app = Arc::clone(&app);
    tokio::task::spawn_blocking(move || {
        clock.stop();
        countdown.stop();
        if let Err(e) = cleanup_app.stop_music() {
            warn!(error = %e, "music did not stop");
        }
        cleanup_app.request_exit();
    })
    .await
    .context("cleanup task failed")?;

    if !orchestrator_exited {
        match orchestrator_done.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("orchestrator thread panicked"),
            Err(e) => error!(?e, "failed to join orchestrator thread"),
        }
    }

    server.shutdown().await;

    info!("voxcore stopped");

    Ok(())
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use hwclink_composer::{Device, FrameLogOutput, HostListener, PRIMARY_DISPLAY};
use hwclink_core::{DisplayId, EngineConfig};
use hwclink_transport::{Channel, ChannelId, ChannelObserver, RemoteSession};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Channel lifecycle, forwarded from whichever thread noticed it to the
/// accept loop. Observers must not call into the [`Device`] directly: a
/// disconnect can surface inside a host call that already holds it.
#[derive(Debug)]
enum SessionEvent {
    Connected(ChannelId),
    Disconnected(ChannelId),
}

struct SessionEvents(mpsc::UnboundedSender<SessionEvent>);

impl ChannelObserver for SessionEvents {
    fn on_connect(&self, id: ChannelId) {
        let _ = self.0.send(SessionEvent::Connected(id));
    }

    fn on_disconnect(&self, id: ChannelId) {
        let _ = self.0.send(SessionEvent::Disconnected(id));
    }
}

/// Host stand-in: the bridge has no compositor, so hotplugs are only logged.
struct LogHost;

impl HostListener for LogHost {
    fn on_hotplug(&self, display_id: DisplayId, connected: bool) {
        info!("Display {display_id} {}", if connected { "connected" } else { "disconnected" });
    }

    fn on_refresh(&self, display_id: DisplayId) {
        debug!("Display {display_id} refresh requested");
    }
}

/// Bridge main loop.
///
/// # Flow
/// 1. Load [`EngineConfig`] (`HWCLINK_CONFIG` JSON file, then `HWCLINK_*` env)
/// 2. Bind the Unix socket renderers connect to
/// 3. Per connection: send the display-info request and run the session's
///    event loop on a blocking thread
/// 4. Display-info ack → attach to a display; disconnect → detach
/// 5. Ctrl-C closes every session and removes the socket
pub async fn run() -> Result<()> {
    let config = load_config()?;
    info!(
        "Socket {} | container {} | max displays {}",
        config.socket_path.display(),
        config.container_id,
        config.max_display_count
    );

    let device = Device::new(config.clone());
    device.register_listener(Arc::new(LogHost));
    if config.frames_to_dump > 0 {
        device.with_display(PRIMARY_DISPLAY, |d| {
            d.set_local_output(Some(Box::new(FrameLogOutput::new())));
            Ok(())
        })?;
    }

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path).with_context(|| {
            format!("removing stale socket {}", config.socket_path.display())
        })?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    info!("Waiting for remote renderers...");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let observer: Arc<dyn ChannelObserver> = Arc::new(SessionEvents(event_tx));
    let mut sessions: HashMap<ChannelId, Arc<RemoteSession>> = HashMap::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };
                match open_session(stream, observer.clone(), config.container_id) {
                    Ok(session) => {
                        info!("Renderer connected (session {})", session.id());
                        sessions.insert(session.id(), session);
                    }
                    Err(e) => warn!("Failed to open session: {:#}", e),
                }
            }
            Some(event) = event_rx.recv() => {
                handle_event(&device, &mut sessions, event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    for session in sessions.values() {
        session.shutdown();
    }
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

fn load_config() -> Result<EngineConfig> {
    let mut config = match std::env::var("HWCLINK_CONFIG") {
        Ok(path) => EngineConfig::from_json_file(&path)
            .with_context(|| format!("loading config {path}"))?,
        Err(_) => EngineConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Wraps an accepted connection in a session and starts its event loop.
fn open_session(
    stream: UnixStream,
    observer: Arc<dyn ChannelObserver>,
    container_id: i32,
) -> Result<Arc<RemoteSession>> {
    let stream = stream.into_std().context("detaching socket from runtime")?;
    stream.set_nonblocking(false).context("switching socket to blocking")?;

    let session = Arc::new(RemoteSession::new(Channel::with_observer(stream, observer), container_id));
    session.request_display_info().context("sending display info request")?;

    let events = session.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = events.run_event_loop() {
            warn!("Session {} event loop ended: {e}", events.id());
        }
    });
    Ok(session)
}

fn handle_event(
    device: &Device,
    sessions: &mut HashMap<ChannelId, Arc<RemoteSession>>,
    event: SessionEvent,
) {
    match event {
        SessionEvent::Connected(id) => {
            let Some(session) = sessions.get(&id) else {
                warn!("Connect for unknown session {id}");
                return;
            };
            match device.add_remote_display(session.clone()) {
                Ok(display_id) => info!("Session {id} attached to display {display_id}"),
                Err(e) => {
                    warn!("Session {id} rejected: {e}");
                    session.shutdown();
                }
            }
        }
        SessionEvent::Disconnected(id) => {
            let Some(session) = sessions.remove(&id) else {
                return;
            };
            if let Err(e) = device.remove_remote_display(&session) {
                warn!("Session {id} detach failed: {e}");
            }
            info!(
                "Session {id} closed ({} remote displays left)",
                device.remote_display_count()
            );
        }
    }
}

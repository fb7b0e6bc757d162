use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hwclink_core::{ComposerError, DisplayId, EngineConfig, LayerId};
use hwclink_transport::{BufferInfo, DisplayEventListener, LayerBufferInfo, RemoteSession};
use tracing::{debug, info, warn};

use crate::display::{AckCounters, Display};
use crate::layer::Layer;

pub const PRIMARY_DISPLAY: DisplayId = 0;

/// Callbacks into the host compositor.
pub trait HostListener: Send + Sync {
    fn on_hotplug(&self, display: DisplayId, connected: bool);

    fn on_refresh(&self, display: DisplayId);
}

// MARK: - Device

/// Registry of displays and the remote sessions bound to them.
///
/// Display 0 always exists. Remote sessions fill it first; every further
/// session gets a display of its own which is hot-plugged in on attach and
/// out on detach.
pub struct Device {
    config: EngineConfig,
    displays: Mutex<BTreeMap<DisplayId, Display>>,
    next_display_id: AtomicU64,
    listener: Mutex<Option<Arc<dyn HostListener>>>,
    pending_hotplugs: Mutex<Vec<(DisplayId, bool)>>,
}

impl Device {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let mut displays = BTreeMap::new();
        displays.insert(PRIMARY_DISPLAY, Display::new(PRIMARY_DISPLAY, &config));
        let device = Arc::new(Self {
            config,
            displays: Mutex::new(displays),
            next_display_id: AtomicU64::new(PRIMARY_DISPLAY + 1),
            listener: Mutex::new(None),
            pending_hotplugs: Mutex::new(Vec::new()),
        });
        device.hotplug(PRIMARY_DISPLAY, true);
        device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Installs the host listener and replays hotplugs it missed.
    pub fn register_listener(&self, listener: Arc<dyn HostListener>) {
        *lock(&self.listener) = Some(listener.clone());
        let pending = std::mem::take(&mut *lock(&self.pending_hotplugs));
        for (display, connected) in pending {
            listener.on_hotplug(display, connected);
        }
    }

    // ── Host access ───────────────────────────────────────────────────────────

    /// Runs `f` on display `id` under the registry lock.
    ///
    /// The lock is held across any socket I/O `f` performs, so a stalled
    /// remote blocks other host calls and session attach/detach until the
    /// send returns. Acks from the event thread do not take this lock.
    pub fn with_display<T>(
        &self,
        id: DisplayId,
        f: impl FnOnce(&mut Display) -> Result<T, ComposerError>,
    ) -> Result<T, ComposerError> {
        let mut displays = lock(&self.displays);
        let display = displays.get_mut(&id).ok_or(ComposerError::BadDisplay(id))?;
        f(display)
    }

    pub fn with_layer<T>(
        &self,
        display: DisplayId,
        layer: LayerId,
        f: impl FnOnce(&mut Layer) -> Result<T, ComposerError>,
    ) -> Result<T, ComposerError> {
        self.with_display(display, |d| f(d.layer_mut(layer)?))
    }

    pub fn display_ids(&self) -> Vec<DisplayId> {
        lock(&self.displays).keys().copied().collect()
    }

    // ── Remote sessions ───────────────────────────────────────────────────────

    /// Binds a session whose display info has arrived to a display.
    pub fn add_remote_display(&self, session: Arc<RemoteSession>) -> Result<DisplayId, ComposerError> {
        let (id, created, acks) = {
            let mut displays = lock(&self.displays);

            let primary_free = displays.get(&PRIMARY_DISPLAY).is_some_and(|d| !d.is_attached());
            if primary_free {
                let primary = displays
                    .get_mut(&PRIMARY_DISPLAY)
                    .ok_or(ComposerError::BadDisplay(PRIMARY_DISPLAY))?;
                primary.attach(session.clone())?;
                (PRIMARY_DISPLAY, false, primary.acks())
            } else {
                let remotes = displays.values().filter(|d| d.is_attached()).count();
                if remotes as u32 >= self.config.max_display_count {
                    warn!("Rejecting session {}: {remotes} remote displays attached", session.id());
                    return Err(ComposerError::NoMoreDisplays { max: self.config.max_display_count });
                }
                let id = self.next_display_id.fetch_add(1, Ordering::Relaxed);
                let mut display = Display::new(id, &self.config);
                display.attach(session.clone())?;
                let acks = display.acks();
                displays.insert(id, display);
                (id, true, acks)
            }
        };

        session.set_event_listener(Some(Arc::new(DisplayRouter { display: id, acks })));
        info!("Session {} → display {id}", session.id());

        if created {
            self.hotplug(id, true);
        } else {
            self.refresh(id);
        }
        Ok(id)
    }

    /// Unbinds `session` from whichever display it is attached to.
    pub fn remove_remote_display(&self, session: &Arc<RemoteSession>) -> Result<(), ComposerError> {
        session.set_event_listener(None);

        let removed = {
            let mut displays = lock(&self.displays);
            let id = displays
                .iter()
                .find(|(_, d)| d.remote().is_some_and(|r| Arc::ptr_eq(r, session)))
                .map(|(id, _)| *id);
            let Some(id) = id else {
                debug!("Session {} was not attached", session.id());
                return Ok(());
            };
            if let Some(display) = displays.get_mut(&id) {
                display.detach(session);
            }
            if id != PRIMARY_DISPLAY {
                displays.remove(&id);
            }
            id
        };

        info!("Session {} left display {removed}", session.id());
        if removed == PRIMARY_DISPLAY {
            self.refresh(removed);
        } else {
            self.hotplug(removed, false);
        }
        Ok(())
    }

    pub fn remote_display_count(&self) -> usize {
        lock(&self.displays).values().filter(|d| d.is_attached()).count()
    }

    pub fn max_remote_display_count(&self) -> u32 {
        self.config.max_display_count
    }

    // ── Host notifications ────────────────────────────────────────────────────

    fn hotplug(&self, display: DisplayId, connected: bool) {
        let listener = lock(&self.listener).clone();
        match listener {
            Some(listener) => listener.on_hotplug(display, connected),
            None => lock(&self.pending_hotplugs).push((display, connected)),
        }
    }

    fn refresh(&self, display: DisplayId) {
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener.on_refresh(display);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("displays", &self.display_ids())
            .field("max_display_count", &self.config.max_display_count)
            .finish()
    }
}

/// Recovers the guard of a poisoned lock; display state stays usable after
/// a panicking host call.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// MARK: - Event routing

/// Forwards a session's acks to the display it is attached to.
struct DisplayRouter {
    display: DisplayId,
    acks: Arc<AckCounters>,
}

impl DisplayEventListener for DisplayRouter {
    fn on_buffer_displayed(&self, info: BufferInfo) {
        self.acks.on_buffer_displayed(self.display, info);
    }

    fn on_presented(&self, layers: Vec<LayerBufferInfo>, release_fence: i32) {
        self.acks.on_presented(self.display, &layers, release_fence);
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hwclink_core::{
    dataspace, pixel_format, transform, Attribute, BufferHandle, BufferId, ComposerError,
    Composition, CompositionMode, DisplayId, EngineConfig, Fence, LayerId, Region,
    TransportError,
};
use hwclink_transport::{BufferInfo, LayerBufferInfo, LayerInfo, RemoteSession};
use tracing::{debug, info, trace, warn};

use crate::layer::Layer;
use crate::local::{local_rotation_code, LocalOutput, ROTATION_SKIP};

// MARK: - Defaults

pub const DEFAULT_WIDTH: i32 = 1280;
pub const DEFAULT_HEIGHT: i32 = 720;
pub const DEFAULT_FPS: i32 = 60;
pub const DEFAULT_DPI: i32 = 240;

/// The only config a display exposes.
pub const DEFAULT_CONFIG: u32 = 0;

pub const COLOR_MODE_NATIVE: i32 = 0;

/// Frames handed to the local dumper after a remote rotation change.
const ROTATION_DUMP_FRAMES: u32 = 10;

/// Rotation code sent to the remote renderer. Anything that is not a plain
/// rotation is reported as 270 degrees.
pub fn remote_rotation_code(tr: u32) -> i32 {
    match tr {
        transform::NONE => 0,
        transform::ROT_90 => 1,
        transform::ROT_180 => 2,
        _ => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    Physical,
    Virtual,
}

/// Result of [`Display::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidateOutcome {
    pub num_types: u32,
    pub num_requests: u32,
}

impl ValidateOutcome {
    /// The host must fetch and accept changed composition types.
    pub fn has_changes(&self) -> bool {
        self.num_types > 0
    }
}

// MARK: - Display

/// Composition state of one display.
///
/// ```text
///   Detached ──attach(session)──▶ Attached
///      ▲                              │
///      └────────detach(session)───────┘
/// ```
///
/// Layers and host-side state survive detach; the set of buffers known to
/// the remote side and the cached rotation do not.
pub struct Display {
    id: DisplayId,
    name: String,

    width: i32,
    height: i32,
    fps: i32,
    xdpi: i32,
    ydpi: i32,
    version: u8,
    mode: CompositionMode,
    config: u32,
    color_mode: i32,

    layers: BTreeMap<LayerId, Layer>,
    next_layer_id: LayerId,

    remote: Option<Arc<RemoteSession>>,
    registered: HashSet<BufferId>,
    transform: u32,

    client_target: Option<BufferHandle>,
    client_target_fence: Fence,
    output_buffer: Option<BufferHandle>,
    output_fence: Fence,

    local: Option<Box<dyn LocalOutput>>,
    local_transform: u32,
    frames_to_dump: u32,

    frame_num: u64,
    acks: Arc<AckCounters>,
}

impl Display {
    pub fn new(id: DisplayId, config: &EngineConfig) -> Self {
        let (width, height) = match config.display_size {
            Some(size) => (size.width as i32, size.height as i32),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        debug!("Display({id}) default size {width}x{height}");

        Self {
            id,
            name: format!("Remote Display {id}"),
            width,
            height,
            fps: DEFAULT_FPS,
            xdpi: DEFAULT_DPI,
            ydpi: DEFAULT_DPI,
            version: 0,
            mode: CompositionMode::default(),
            config: DEFAULT_CONFIG,
            color_mode: COLOR_MODE_NATIVE,
            layers: BTreeMap::new(),
            next_layer_id: 1,
            remote: None,
            registered: HashSet::new(),
            transform: 0,
            client_target: None,
            client_target_fence: None,
            output_buffer: None,
            output_fence: None,
            local: None,
            local_transform: 0,
            frames_to_dump: config.frames_to_dump,
            frame_num: 0,
            acks: Arc::new(AckCounters::default()),
        }
    }

    pub fn set_local_output(&mut self, output: Option<Box<dyn LocalOutput>>) {
        self.local = output;
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    // ── Session binding ───────────────────────────────────────────────────────

    /// Binds a remote session and adopts its geometry and composition mode.
    pub fn attach(&mut self, session: Arc<RemoteSession>) -> Result<(), ComposerError> {
        let info = session.display_info().ok_or(ComposerError::NoDisplayInfo)?;

        self.width = info.width;
        self.height = info.height;
        self.fps = info.fps;
        self.xdpi = info.xdpi;
        self.ydpi = info.ydpi;
        self.version = info.flags.version;
        self.mode = info.flags.mode;
        self.registered.clear();
        self.remote = Some(session);

        info!(
            "Display({}) attached: {}x{}@{} dpi={}x{} version={} mode={:?}",
            self.id, self.width, self.height, self.fps, self.xdpi, self.ydpi, self.version, self.mode
        );
        Ok(())
    }

    /// Unbinds `session` if it is the one attached; other sessions are ignored.
    pub fn detach(&mut self, session: &Arc<RemoteSession>) {
        let attached = self.remote.as_ref().is_some_and(|r| Arc::ptr_eq(r, session));
        if !attached {
            return;
        }
        info!("Display({}) detached from session {}", self.id, session.id());
        self.registered.clear();
        self.transform = 0;
        self.remote = None;
    }

    pub fn is_attached(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteSession>> {
        self.remote.as_ref()
    }

    pub fn mode(&self) -> CompositionMode {
        self.mode
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Registers `buffer` with the remote side the first time it is seen in
    /// this session. A failed send is logged; it shows up again on the next
    /// present, and the next attachment starts a fresh registration set.
    fn register_buffer(&mut self, buffer: &BufferHandle) {
        let Some(remote) = &self.remote else {
            return;
        };
        if !self.registered.insert(buffer.id()) {
            return;
        }
        trace!("Display({}) register buffer {}", self.id, buffer.id());
        if let Err(e) = remote.create_buffer(buffer) {
            warn!("Display({}) register buffer {} failed: {e}", self.id, buffer.id());
        }
    }

    // ── Layers ────────────────────────────────────────────────────────────────

    pub fn create_layer(&mut self) -> Result<LayerId, ComposerError> {
        let id = self.next_layer_id;
        self.next_layer_id += 1;
        self.layers.insert(id, Layer::new(id));
        trace!("Display({}) create layer {id:#x} mode={:?}", self.id, self.mode);

        if let Some(remote) = &self.remote {
            if self.mode.ships_layers() {
                if let Err(e) = remote.create_layer(id) {
                    warn!("Display({}) remote create layer {id:#x} failed: {e}", self.id);
                }
            }
        }
        Ok(id)
    }

    pub fn destroy_layer(&mut self, id: LayerId) -> Result<(), ComposerError> {
        if self.layers.remove(&id).is_none() {
            return Err(ComposerError::BadLayer(id));
        }
        trace!("Display({}) destroy layer {id:#x}", self.id);

        if let Some(remote) = &self.remote {
            if self.mode.ships_layers() {
                if let Err(e) = remote.remove_layer(id) {
                    warn!("Display({}) remote remove layer {id:#x} failed: {e}", self.id);
                }
            }
        }
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Result<&Layer, ComposerError> {
        self.layers.get(&id).ok_or(ComposerError::BadLayer(id))
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, ComposerError> {
        self.layers.get_mut(&id).ok_or(ComposerError::BadLayer(id))
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.keys().copied().collect()
    }

    /// Sets a layer's buffer and registers it with the remote side if new.
    pub fn set_layer_buffer(
        &mut self,
        id: LayerId,
        buffer: Option<BufferHandle>,
        acquire_fence: Fence,
    ) -> Result<(), ComposerError> {
        let layer = self.layers.get_mut(&id).ok_or(ComposerError::BadLayer(id))?;
        if layer.set_buffer(buffer.clone(), acquire_fence) {
            if let Some(buffer) = &buffer {
                self.register_buffer(buffer);
            }
        }
        Ok(())
    }

    // ── Client target & output ────────────────────────────────────────────────

    pub fn set_client_target(
        &mut self,
        target: Option<BufferHandle>,
        acquire_fence: Fence,
        _dataspace: i32,
        _damage: Region,
    ) -> Result<(), ComposerError> {
        self.client_target_fence = acquire_fence;
        self.client_target = target.clone();
        if let Some(target) = &target {
            self.register_buffer(target);
        }
        Ok(())
    }

    pub fn client_target(&self) -> Option<&BufferHandle> {
        self.client_target.as_ref()
    }

    pub fn set_output_buffer(&mut self, buffer: Option<BufferHandle>, release_fence: Fence) {
        self.output_buffer = buffer;
        self.output_fence = release_fence;
    }

    // ── Validate / present ────────────────────────────────────────────────────

    /// Moves every layer to a type this engine can compose. Layers the
    /// engine cannot handle fall back to client composition.
    pub fn validate(&mut self) -> ValidateOutcome {
        let mut outcome = ValidateOutcome::default();
        for layer in self.layers.values_mut() {
            if layer.validate() {
                outcome.num_types += 1;
            }
        }
        if self.local.is_some() {
            self.check_local_rotation();
        }
        trace!("Display({}) validate: {} type changes", self.id, outcome.num_types);
        outcome
    }

    pub fn changed_composition_types(&self) -> Vec<(LayerId, Composition)> {
        self.layers
            .values()
            .filter(|l| l.type_changed())
            .map(|l| (l.id(), l.validated_type()))
            .collect()
    }

    /// Layer requests; this engine never makes any.
    pub fn requests(&self) -> Vec<(LayerId, i32)> {
        Vec::new()
    }

    pub fn accept_changes(&mut self) {
        for layer in self.layers.values_mut() {
            layer.accept_type_change();
        }
    }

    /// Ships the frame to the remote renderer according to the negotiated
    /// mode and returns the retire fence (always none).
    ///
    /// Every batch is attempted even if an earlier one failed; the first
    /// failure is returned. Layer dirty flags are cleared only when both
    /// layer batches went out, so a failed frame is re-sent in full.
    pub fn present(&mut self) -> Result<Fence, ComposerError> {
        let mut first_err: Option<TransportError> = None;

        if let Some(remote) = self.remote.clone() {
            if self.mode.ships_client_target() {
                if let Some(target) = self.client_target.clone() {
                    keep_first(&mut first_err, remote.display_buffer(target.id()));
                    keep_first(&mut first_err, self.update_rotation(&remote));
                }
            }

            if self.mode.ships_layers() {
                let infos: Vec<LayerInfo> =
                    self.layers.values().filter(|l| l.changed()).map(|l| *l.info()).collect();
                let updated = if infos.is_empty() { Ok(()) } else { remote.update_layers(&infos) };

                let buffers: Vec<LayerBufferInfo> = self
                    .layers
                    .values()
                    .filter(|l| l.buffer_changed())
                    .map(|l| *l.layer_buffer())
                    .collect();
                let presented =
                    if buffers.is_empty() { Ok(()) } else { remote.present_layers(&buffers) };

                if updated.is_ok() && presented.is_ok() {
                    for layer in self.layers.values_mut() {
                        layer.mark_clean();
                    }
                }
                keep_first(&mut first_err, updated);
                keep_first(&mut first_err, presented);
            }
        }

        if let (Some(local), Some(target)) = (self.local.as_mut(), self.client_target.as_ref()) {
            local.post_frame(target);
            if self.frames_to_dump > 0 {
                local.dump_frame(target, self.frame_num);
                self.frames_to_dump -= 1;
            }
        }

        self.frame_num += 1;

        match first_err {
            Some(e) => {
                warn!("Display({}) present frame {} failed: {e}", self.id, self.frame_num - 1);
                Err(e.into())
            }
            None => Ok(None),
        }
    }

    pub fn frame_num(&self) -> u64 {
        self.frame_num
    }

    /// Transform the rotation scan settles on: the first layer holding a
    /// buffer whose transform matches `cached`, otherwise the last layer's
    /// transform (0 with no layers).
    fn scan_transform(&self, cached: u32) -> u32 {
        let mut tr = 0;
        for layer in self.layers.values() {
            tr = layer.transform();
            if layer.buffer().is_some() && tr == cached {
                break;
            }
        }
        tr
    }

    fn update_rotation(&mut self, remote: &RemoteSession) -> Result<(), TransportError> {
        let tr = self.scan_transform(self.transform);
        if tr == self.transform {
            return Ok(());
        }
        let rot = remote_rotation_code(tr);
        info!("Display({}) set rotation {rot} (tr={tr})", self.id);
        remote.set_rotation(rot)?;
        self.transform = tr;
        if self.local.is_some() {
            self.frames_to_dump = ROTATION_DUMP_FRAMES;
        }
        Ok(())
    }

    fn check_local_rotation(&mut self) {
        let tr = self.scan_transform(self.local_transform);
        if tr == self.local_transform {
            return;
        }
        let rot = local_rotation_code(tr);
        if rot == ROTATION_SKIP {
            return;
        }
        if let Some(local) = self.local.as_mut() {
            info!("Display({}) local rotation {rot} (tr={tr})", self.id);
            local.set_rotation(rot);
            self.local_transform = tr;
        }
    }

    // ── Remote callbacks ──────────────────────────────────────────────────────

    /// Ack counters shared with the event thread, which updates them
    /// without going through the display.
    pub fn acks(&self) -> Arc<AckCounters> {
        self.acks.clone()
    }

    pub fn buffers_displayed(&self) -> u64 {
        self.acks.buffers_displayed.load(Ordering::Relaxed)
    }

    pub fn presents_acked(&self) -> u64 {
        self.acks.presents_acked.load(Ordering::Relaxed)
    }

    // ── Host queries ──────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_type(&self) -> DisplayType {
        DisplayType::Physical
    }

    pub fn active_config(&self) -> u32 {
        self.config
    }

    pub fn set_active_config(&mut self, config: u32) {
        self.config = config;
    }

    pub fn configs(&self) -> Vec<u32> {
        vec![DEFAULT_CONFIG]
    }

    pub fn attribute(&self, config: u32, attribute: Attribute) -> Result<i32, ComposerError> {
        if config != DEFAULT_CONFIG {
            return Err(ComposerError::BadConfig(config));
        }
        Ok(match attribute {
            Attribute::Width => self.width,
            Attribute::Height => self.height,
            Attribute::VsyncPeriod => self.vsync_period() as i32,
            Attribute::DpiX => self.xdpi.saturating_mul(1000),
            Attribute::DpiY => self.ydpi.saturating_mul(1000),
        })
    }

    /// Nanoseconds per frame.
    pub fn vsync_period(&self) -> u32 {
        1_000_000_000 / self.fps.max(1) as u32
    }

    pub fn client_target_support(
        &self,
        width: u32,
        height: u32,
        format: i32,
        space: i32,
    ) -> Result<(), ComposerError> {
        if width != self.width as u32 || height != self.height as u32 {
            return Err(ComposerError::Unsupported);
        }
        let format_ok = matches!(
            format,
            pixel_format::RGBA_8888 | pixel_format::RGBX_8888 | pixel_format::BGRA_8888
        );
        let space_ok = matches!(space, dataspace::UNKNOWN | dataspace::STANDARD_UNSPECIFIED);
        if format_ok && space_ok {
            Ok(())
        } else {
            Err(ComposerError::Unsupported)
        }
    }

    pub fn color_modes(&self) -> Vec<i32> {
        vec![COLOR_MODE_NATIVE]
    }

    pub fn color_mode(&self) -> i32 {
        self.color_mode
    }

    pub fn set_color_mode(&mut self, mode: i32) {
        self.color_mode = mode;
    }

    /// One "no fence" entry per layer.
    pub fn release_fences(&self) -> Vec<(LayerId, Fence)> {
        self.layers.values().map(|l| (l.id(), l.release_fence())).collect()
    }

    pub fn doze_support(&self) -> bool {
        false
    }

    /// Supported HDR types; none.
    pub fn hdr_capabilities(&self) -> Vec<i32> {
        Vec::new()
    }

    pub fn set_power_mode(&mut self, _mode: i32) {}

    pub fn set_vsync_enabled(&mut self, _enabled: bool) {}

    pub fn set_color_transform(&mut self, _matrix: &[f32; 16], _hint: i32) {}

    pub fn set_brightness(&mut self, _brightness: f32) {}

    pub fn dump(&self) {
        debug!(
            "----- Display({}) frame={} attached={} mode={:?} -----",
            self.id,
            self.frame_num,
            self.is_attached(),
            self.mode
        );
        for layer in self.layers.values() {
            layer.dump();
        }
    }
}

/// Acknowledgement counters of one display.
#[derive(Debug, Default)]
pub struct AckCounters {
    buffers_displayed: AtomicU64,
    presents_acked: AtomicU64,
}

impl AckCounters {
    pub fn on_buffer_displayed(&self, display_id: DisplayId, info: BufferInfo) {
        self.buffers_displayed.fetch_add(1, Ordering::Relaxed);
        trace!("Display({}) buffer {} displayed", display_id, info.buffer_id);
    }

    pub fn on_presented(&self, display_id: DisplayId, layers: &[LayerBufferInfo], release_fence: i32) {
        self.presents_acked.fetch_add(1, Ordering::Relaxed);
        trace!("Display({}) presented {} layers, release fence {release_fence}", display_id, layers.len());
    }
}

fn keep_first(slot: &mut Option<TransportError>, result: Result<(), TransportError>) {
    if let Err(e) = result {
        slot.get_or_insert(e);
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        let Some(remote) = self.remote.take() else {
            return;
        };
        if !remote.is_connected() {
            return;
        }
        for id in self.registered.drain() {
            if remote.remove_buffer(id).is_err() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("id", &self.id)
            .field("size", &(self.width, self.height))
            .field("mode", &self.mode)
            .field("layers", &self.layers.len())
            .field("attached", &self.remote.is_some())
            .field("client_target", &self.client_target.as_ref().map(|b| b.id()))
            .field("client_target_fence", &self.client_target_fence)
            .field("output_buffer", &self.output_buffer.as_ref().map(|b| b.id()))
            .field("output_fence", &self.output_fence)
            .field("frame_num", &self.frame_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Buf;
    use hwclink_core::{DisplayFlags, DisplayInfo, NativeHandle, Resolution};
    use hwclink_transport::protocol::{
        self, MessageHeader, MessageType, WireRecord, BATCH_HEADER_SIZE, HEADER_SIZE,
    };
    use hwclink_transport::Channel;

    use super::*;

    fn buffer(id: u64) -> BufferHandle {
        BufferHandle::new(BufferId(id), Arc::new(NativeHandle::new(Vec::new(), vec![id as i32])))
    }

    fn info(mode: CompositionMode) -> DisplayInfo {
        DisplayInfo {
            width: 1920,
            height: 1080,
            fps: 60,
            xdpi: 160,
            ydpi: 160,
            flags: DisplayFlags { version: 1, mode },
        }
    }

    /// A session that has completed the display-info handshake, plus the
    /// renderer's end of the socket.
    fn connected_session(mode: CompositionMode) -> (Arc<RemoteSession>, UnixStream) {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let session = RemoteSession::new(Channel::new(local), 0);
        remote.write_all(&protocol::encode_display_info_ack(&info(mode))).unwrap();
        session.dispatch_event().unwrap();
        remote.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        (Arc::new(session), remote)
    }

    fn attached(mode: CompositionMode) -> (Display, Arc<RemoteSession>, UnixStream) {
        let mut display = Display::new(0, &EngineConfig::default());
        let (session, remote) = connected_session(mode);
        display.attach(session.clone()).unwrap();
        (display, session, remote)
    }

    fn read_message(remote: &mut UnixStream) -> (MessageType, Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        remote.read_exact(&mut raw).unwrap();
        let header = MessageHeader::decode(&raw).unwrap();
        let mut body = vec![0u8; header.payload_len()];
        remote.read_exact(&mut body).unwrap();
        (header.message_type().unwrap(), body)
    }

    /// Reads a CreateBuffer message: both parts arrive as one header + body.
    fn read_create_buffer(remote: &mut UnixStream) -> u64 {
        let (ty, body) = read_message(remote);
        assert_eq!(ty, MessageType::CreateBuffer);
        (&body[..]).get_u64_ne()
    }

    fn assert_silent(remote: &mut UnixStream) {
        let mut byte = [0u8; 1];
        assert!(remote.read(&mut byte).is_err(), "unexpected message from engine");
    }

    #[derive(Default)]
    struct RecordingOutput {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LocalOutput for RecordingOutput {
        fn post_frame(&mut self, buffer: &BufferHandle) {
            self.log.lock().unwrap().push(format!("post {}", buffer.id()));
        }
        fn set_rotation(&mut self, rotation: i32) {
            self.log.lock().unwrap().push(format!("rotate {rotation}"));
        }
        fn dump_frame(&mut self, _buffer: &BufferHandle, frame: u64) {
            self.log.lock().unwrap().push(format!("dump {frame}"));
        }
    }

    #[test]
    fn defaults_before_attach() {
        let display = Display::new(0, &EngineConfig::default());
        assert_eq!(display.attribute(0, Attribute::Width).unwrap(), 1280);
        assert_eq!(display.attribute(0, Attribute::Height).unwrap(), 720);
        assert_eq!(display.attribute(0, Attribute::DpiX).unwrap(), 240_000);
        assert_eq!(display.vsync_period(), 16_666_666);
        assert!(!display.is_attached());

        let config = EngineConfig { display_size: Some(Resolution::FHD), ..Default::default() };
        let display = Display::new(1, &config);
        assert_eq!(display.attribute(0, Attribute::Width).unwrap(), 1920);
    }

    #[test]
    fn attach_adopts_remote_display_info() {
        let (display, _session, _remote) = attached(CompositionMode::LayerLevel);
        assert_eq!(display.attribute(0, Attribute::Width).unwrap(), 1920);
        assert_eq!(display.attribute(0, Attribute::Height).unwrap(), 1080);
        assert_eq!(display.attribute(0, Attribute::DpiY).unwrap(), 160_000);
        assert_eq!(display.attribute(0, Attribute::VsyncPeriod).unwrap(), 16_666_666);
        assert_eq!(display.version(), 1);
        assert_eq!(display.mode(), CompositionMode::LayerLevel);
        assert!(matches!(
            display.attribute(3, Attribute::Width),
            Err(ComposerError::BadConfig(3))
        ));
    }

    #[test]
    fn attach_requires_display_info() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let session = Arc::new(RemoteSession::new(Channel::new(local), 0));
        let mut display = Display::new(0, &EngineConfig::default());
        assert!(matches!(display.attach(session), Err(ComposerError::NoDisplayInfo)));
    }

    #[test]
    fn client_target_support_checks_size_format_and_dataspace() {
        let display = Display::new(0, &EngineConfig::default());
        assert!(display.client_target_support(1280, 720, pixel_format::RGBA_8888, 0).is_ok());
        assert!(display
            .client_target_support(1280, 720, pixel_format::BGRA_8888, dataspace::STANDARD_UNSPECIFIED)
            .is_ok());
        assert!(display.client_target_support(1280, 721, pixel_format::RGBA_8888, 0).is_err());
        assert!(display.client_target_support(1280, 720, 0x16, 0).is_err());
        assert!(display.client_target_support(1280, 720, pixel_format::RGBX_8888, 0x0810_0000).is_err());
    }

    #[test]
    fn validate_is_idempotent_after_first_pass() {
        let mut display = Display::new(0, &EngineConfig::default());
        let a = display.create_layer().unwrap();
        let b = display.create_layer().unwrap();
        display.layer_mut(a).unwrap().set_composition_type(Composition::Device);
        display.layer_mut(b).unwrap().set_composition_type(Composition::Client);

        let first = display.validate();
        assert_eq!(first.num_types, 1);
        assert!(first.has_changes());
        assert_eq!(display.changed_composition_types(), vec![(a, Composition::Client)]);

        display.accept_changes();
        assert!(display.changed_composition_types().is_empty());
        assert_eq!(display.layer(a).unwrap().validated_type(), Composition::Client);

        let second = display.validate();
        assert_eq!(second, ValidateOutcome::default());
        assert!(display.requests().is_empty());
    }

    #[test]
    fn unknown_layer_is_rejected() {
        let mut display = Display::new(0, &EngineConfig::default());
        assert!(matches!(display.destroy_layer(42), Err(ComposerError::BadLayer(42))));
        assert!(matches!(
            display.set_layer_buffer(42, Some(buffer(1)), None),
            Err(ComposerError::BadLayer(42))
        ));
    }

    #[test]
    fn release_fences_cover_every_layer() {
        let mut display = Display::new(0, &EngineConfig::default());
        display.create_layer().unwrap();
        display.create_layer().unwrap();
        let fences = display.release_fences();
        assert_eq!(fences.len(), 2);
        assert!(fences.iter().all(|(_, f)| f.is_none()));
    }

    #[test]
    fn remote_rotation_mapping() {
        let codes: Vec<i32> = [0, 4, 3, 7, 9].into_iter().map(remote_rotation_code).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 3]);
    }

    #[test]
    fn present_sends_rotation_for_rotated_layer() {
        for (tr, expected) in [(4, 1), (3, 2), (7, 3), (9, 3)] {
            let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
            let layer = display.create_layer().unwrap();
            display.layer_mut(layer).unwrap().set_transform(tr);
            display.set_layer_buffer(layer, Some(buffer(0x10)), None).unwrap();
            display.set_client_target(Some(buffer(0x20)), None, 0, Vec::new()).unwrap();
            assert_eq!(read_create_buffer(&mut remote), 0x10);
            assert_eq!(read_create_buffer(&mut remote), 0x20);

            display.present().unwrap();
            let (ty, body) = read_message(&mut remote);
            assert_eq!(ty, MessageType::DisplayRequest);
            assert_eq!((&body[..]).get_u64_ne(), 0x20);
            let (ty, body) = read_message(&mut remote);
            assert_eq!(ty, MessageType::SetRotation);
            assert_eq!((&body[..]).get_i32_ne(), expected);

            display.present().unwrap();
            let (ty, _) = read_message(&mut remote);
            assert_eq!(ty, MessageType::DisplayRequest);
            assert_silent(&mut remote);
        }
    }

    #[test]
    fn rotation_returns_to_zero() {
        let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
        let layer = display.create_layer().unwrap();
        display.layer_mut(layer).unwrap().set_transform(4);
        display.set_layer_buffer(layer, Some(buffer(1)), None).unwrap();
        display.set_client_target(Some(buffer(2)), None, 0, Vec::new()).unwrap();
        read_create_buffer(&mut remote);
        read_create_buffer(&mut remote);
        display.present().unwrap();
        read_message(&mut remote);
        read_message(&mut remote);

        display.layer_mut(layer).unwrap().set_transform(0);
        display.present().unwrap();
        read_message(&mut remote);
        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::SetRotation);
        assert_eq!((&body[..]).get_i32_ne(), 0);
    }

    #[test]
    fn client_target_registered_once_per_session() {
        let (mut display, session, mut remote) = attached(CompositionMode::FramebufferOnly);
        display.set_client_target(Some(buffer(7)), None, 0, Vec::new()).unwrap();
        display.set_client_target(Some(buffer(7)), None, 0, Vec::new()).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 7);
        assert_silent(&mut remote);

        // A new session starts from an empty registration set.
        display.detach(&session);
        let (session2, mut remote2) = connected_session(CompositionMode::FramebufferOnly);
        display.attach(session2).unwrap();
        display.set_client_target(Some(buffer(7)), None, 0, Vec::new()).unwrap();
        assert_eq!(read_create_buffer(&mut remote2), 7);
    }

    #[test]
    fn detach_ignores_foreign_session() {
        let (mut display, _session, _remote) = attached(CompositionMode::LayerLevel);
        let (other, _other_remote) = connected_session(CompositionMode::LayerLevel);
        display.detach(&other);
        assert!(display.is_attached());
    }

    #[test]
    fn layer_level_present_ships_dirty_layers_then_clears() {
        let (mut display, _session, mut remote) = attached(CompositionMode::LayerLevel);

        let layer = display.create_layer().unwrap();
        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::CreateLayer);
        assert_eq!((&body[..]).get_u64_ne(), layer);

        display.layer_mut(layer).unwrap().set_display_frame(hwclink_core::Rect::new(0, 0, 1920, 1080));
        display.set_layer_buffer(layer, Some(buffer(0xb0)), None).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 0xb0);

        display.present().unwrap();

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::UpdateLayers);
        assert_eq!((&body[..]).get_u32_ne(), 1);
        assert_eq!(body.len(), BATCH_HEADER_SIZE - HEADER_SIZE + LayerInfo::SIZE);
        let record = LayerInfo::decode(&body[BATCH_HEADER_SIZE - HEADER_SIZE..]).unwrap();
        assert_eq!(record.layer_id, layer);
        assert_eq!(record.dst_frame.right, 1920);
        assert!(record.changed);

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::PresentLayersRequest);
        let record = LayerBufferInfo::decode(&body[BATCH_HEADER_SIZE - HEADER_SIZE..]).unwrap();
        assert_eq!(record.buffer_id, 0xb0);
        assert_eq!(record.fence, -1);

        assert!(!display.layer(layer).unwrap().changed());
        assert!(!display.layer(layer).unwrap().buffer_changed());

        // Nothing dirty: nothing sent.
        display.present().unwrap();
        assert_silent(&mut remote);
        assert_eq!(display.frame_num(), 2);
    }

    #[test]
    fn layer_level_present_splits_geometry_and_buffer_changes() {
        let (mut display, _session, mut remote) = attached(CompositionMode::LayerLevel);
        let a = display.create_layer().unwrap();
        let b = display.create_layer().unwrap();
        read_message(&mut remote);
        read_message(&mut remote);

        // Ship the initial state of both layers.
        display.present().unwrap();
        read_message(&mut remote);
        assert_silent(&mut remote);

        display.layer_mut(a).unwrap().set_display_frame(hwclink_core::Rect::new(0, 0, 64, 64));
        display.set_layer_buffer(b, Some(buffer(0xbb)), None).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 0xbb);

        display.present().unwrap();

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::UpdateLayers);
        assert_eq!((&body[..]).get_u32_ne(), 1);
        let record = LayerInfo::decode(&body[BATCH_HEADER_SIZE - HEADER_SIZE..]).unwrap();
        assert_eq!(record.layer_id, a);

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::PresentLayersRequest);
        assert_eq!((&body[..]).get_u32_ne(), 1);
        let record = LayerBufferInfo::decode(&body[BATCH_HEADER_SIZE - HEADER_SIZE..]).unwrap();
        assert_eq!(record.layer_id, b);
        assert_eq!(record.buffer_id, 0xbb);
        assert_silent(&mut remote);

        for id in [a, b] {
            let layer = display.layer(id).unwrap();
            assert!(!layer.changed());
            assert!(!layer.buffer_changed());
        }
    }

    #[test]
    fn framebuffer_mode_does_not_ship_layers() {
        let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, Some(buffer(3)), None).unwrap();
        // Buffers are registered regardless of mode.
        assert_eq!(read_create_buffer(&mut remote), 3);
        display.present().unwrap();
        assert_silent(&mut remote);
        assert!(display.layer(layer).unwrap().changed());
    }

    #[test]
    fn present_after_disconnect_keeps_state() {
        let (mut display, session, remote) = attached(CompositionMode::LayerLevel);
        let layer = display.create_layer().unwrap();
        drop(remote);
        session.shutdown();

        assert!(display.present().is_err());
        assert!(display.layer(layer).unwrap().changed());
        assert_eq!(display.frame_num(), 1);

        assert!(display.present().unwrap_err().is_transport());
        assert_eq!(display.frame_num(), 2);
    }

    #[test]
    fn detached_present_only_counts_frames() {
        let mut display = Display::new(0, &EngineConfig::default());
        display.create_layer().unwrap();
        display.set_client_target(Some(buffer(1)), None, 0, Vec::new()).unwrap();
        assert!(display.present().unwrap().is_none());
        assert_eq!(display.frame_num(), 1);
    }

    #[test]
    fn local_output_posts_dumps_and_rotates() {
        let config = EngineConfig { frames_to_dump: 1, ..Default::default() };
        let mut display = Display::new(0, &config);
        let output = RecordingOutput::default();
        let log = output.log.clone();
        display.set_local_output(Some(Box::new(output)));

        let layer = display.create_layer().unwrap();
        display.layer_mut(layer).unwrap().set_transform(3);
        display.set_layer_buffer(layer, Some(buffer(1)), None).unwrap();
        display.set_client_target(Some(buffer(9)), None, 0, Vec::new()).unwrap();

        display.validate();
        display.present().unwrap();
        display.present().unwrap();

        // Flips never reach the local output.
        display.layer_mut(layer).unwrap().set_transform(transform::FLIP_H);
        display.validate();

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["rotate 2", "post 0x9", "dump 0", "post 0x9"]);
    }

    #[test]
    fn remote_rotation_rearms_local_dumping() {
        let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
        let output = RecordingOutput::default();
        let log = output.log.clone();
        display.set_local_output(Some(Box::new(output)));

        let layer = display.create_layer().unwrap();
        display.layer_mut(layer).unwrap().set_transform(4);
        display.set_layer_buffer(layer, Some(buffer(1)), None).unwrap();
        display.set_client_target(Some(buffer(2)), None, 0, Vec::new()).unwrap();
        read_create_buffer(&mut remote);
        read_create_buffer(&mut remote);

        display.present().unwrap();
        let dumps = log.lock().unwrap().iter().filter(|l| l.starts_with("dump")).count();
        assert_eq!(dumps, 1);
    }

    #[test]
    fn callbacks_are_counted() {
        let display = Display::new(0, &EngineConfig::default());
        let acks = display.acks();
        acks.on_buffer_displayed(0, BufferInfo { buffer_id: BufferId(1) });
        acks.on_presented(0, &[], -1);
        acks.on_presented(0, &[], -1);
        assert_eq!(display.buffers_displayed(), 1);
        assert_eq!(display.presents_acked(), 2);
    }

    #[test]
    fn drop_releases_registered_buffers_while_connected() {
        let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
        display.set_client_target(Some(buffer(5)), None, 0, Vec::new()).unwrap();
        read_create_buffer(&mut remote);
        drop(display);

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::RemoveBuffer);
        assert_eq!((&body[..]).get_u64_ne(), 5);
    }

    #[test]
    fn layer_calls_succeed_locally_after_disconnect() {
        let (mut display, session, remote) = attached(CompositionMode::LayerLevel);
        drop(remote);
        session.shutdown();

        let first = display.create_layer().unwrap();
        let second = display.create_layer().unwrap();
        assert_eq!(display.layer_ids(), vec![first, second]);
        assert!(!session.is_connected());

        display.set_layer_buffer(first, Some(buffer(1)), None).unwrap();
        display.set_client_target(Some(buffer(2)), None, 0, Vec::new()).unwrap();

        display.destroy_layer(first).unwrap();
        assert_eq!(display.layer_ids(), vec![second]);
        assert!(matches!(display.destroy_layer(first), Err(ComposerError::BadLayer(id)) if id == first));

        // The transport failure is reported by present.
        assert!(display.present().unwrap_err().is_transport());
    }

    #[test]
    fn buffer_registered_once_across_layers_and_client_target() {
        let (mut display, _session, mut remote) = attached(CompositionMode::FramebufferOnly);
        let a = display.create_layer().unwrap();
        let b = display.create_layer().unwrap();

        display.set_layer_buffer(a, Some(buffer(0x50)), None).unwrap();
        display.set_layer_buffer(b, Some(buffer(0x50)), None).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 0x50);

        display.set_layer_buffer(a, Some(buffer(0x60)), None).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 0x60);
        display.set_layer_buffer(a, Some(buffer(0x50)), None).unwrap();
        display.set_client_target(Some(buffer(0x50)), None, 0, Vec::new()).unwrap();
        assert_silent(&mut remote);
    }

    #[test]
    fn hybrid_present_ships_client_target_then_layers() {
        let (mut display, _session, mut remote) = attached(CompositionMode::Hybrid);
        let layer = display.create_layer().unwrap();
        let (ty, _) = read_message(&mut remote);
        assert_eq!(ty, MessageType::CreateLayer);

        display.layer_mut(layer).unwrap().set_transform(4);
        display.set_layer_buffer(layer, Some(buffer(0x10)), None).unwrap();
        display.set_client_target(Some(buffer(0x20)), None, 0, Vec::new()).unwrap();
        assert_eq!(read_create_buffer(&mut remote), 0x10);
        assert_eq!(read_create_buffer(&mut remote), 0x20);

        display.present().unwrap();

        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::DisplayRequest);
        assert_eq!((&body[..]).get_u64_ne(), 0x20);
        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::SetRotation);
        assert_eq!((&body[..]).get_i32_ne(), 1);
        let (ty, _) = read_message(&mut remote);
        assert_eq!(ty, MessageType::UpdateLayers);
        let (ty, body) = read_message(&mut remote);
        assert_eq!(ty, MessageType::PresentLayersRequest);
        let record = LayerBufferInfo::decode(&body[BATCH_HEADER_SIZE - HEADER_SIZE..]).unwrap();
        assert_eq!(record.buffer_id, 0x10);
        assert_silent(&mut remote);
    }

    #[test]
    fn drop_after_disconnect_sends_nothing() {
        let (mut display, session, mut remote) = attached(CompositionMode::FramebufferOnly);
        display.set_client_target(Some(buffer(5)), None, 0, Vec::new()).unwrap();
        read_create_buffer(&mut remote);

        session.shutdown();
        assert!(display.present().is_err());
        assert!(!session.is_connected());
        drop(display);

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn dpi_attribute_saturates() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let session = RemoteSession::new(Channel::new(local), 0);
        let huge = DisplayInfo { xdpi: 3_000_000, ..info(CompositionMode::FramebufferOnly) };
        remote.write_all(&protocol::encode_display_info_ack(&huge)).unwrap();
        session.dispatch_event().unwrap();

        let mut display = Display::new(0, &EngineConfig::default());
        display.attach(Arc::new(session)).unwrap();
        assert_eq!(display.attribute(0, Attribute::DpiX).unwrap(), i32::MAX);
        assert_eq!(display.attribute(0, Attribute::DpiY).unwrap(), 160_000);
    }
}

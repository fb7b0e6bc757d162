//! Remote display session: outbound requests plus the inbound event loop.
//!
//! # Lifecycle
//!
//! ```text
//! 1. RemoteSession::new(channel, container_id)
//! 2. session.request_display_info()
//! 3. event thread: session.run_event_loop()
//!       ├─ DisplayInfoAck     → display_info() populated, observer.on_connect
//!       ├─ DisplayAck         → listener.on_buffer_displayed
//!       ├─ PresentLayersAck   → listener.on_presented
//!       └─ anything else      → drained and logged
//! 4. host thread: create_buffer / update_layers / present_layers / ...
//! ```

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use hwclink_core::{BufferHandle, BufferId, DisplayFlags, DisplayInfo, LayerId, TransportError};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelId, MAX_FDS_PER_TRANSFER};
use crate::protocol::{
    self, BufferInfo, LayerBufferInfo, LayerInfo, MessageHeader, MessageType, PresentAck,
    WireRecord, HEADER_SIZE, PRESENT_ACK_FIXED_SIZE,
};

/// Largest message body read into memory; bigger ones are drained.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

const DRAIN_CHUNK: usize = 1024;

// ── Listener ──────────────────────────────────────────────────────────────────

/// Receives acknowledgements routed from the event loop.
pub trait DisplayEventListener: Send + Sync {
    fn on_buffer_displayed(&self, info: BufferInfo);

    fn on_presented(&self, layers: Vec<LayerBufferInfo>, release_fence: i32);
}

// ── RemoteSession ─────────────────────────────────────────────────────────────

pub struct RemoteSession {
    channel: Channel,
    container_id: i32,
    info: OnceLock<DisplayInfo>,
    flags: AtomicU32,
    listener: Mutex<Option<Arc<dyn DisplayEventListener>>>,
}

impl RemoteSession {
    pub fn new(channel: Channel, container_id: i32) -> Self {
        Self {
            channel,
            container_id,
            info: OnceLock::new(),
            flags: AtomicU32::new(0),
            listener: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn container_id(&self) -> i32 {
        self.container_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Display description; `None` until the first display-info ack.
    pub fn display_info(&self) -> Option<DisplayInfo> {
        self.info.get().copied()
    }

    /// Latest flags word reported by the renderer.
    pub fn flags(&self) -> DisplayFlags {
        DisplayFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn set_event_listener(&self, listener: Option<Arc<dyn DisplayEventListener>>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// Closes the channel from any thread; a blocked event loop returns.
    pub fn shutdown(&self) {
        self.channel.shutdown();
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub fn request_display_info(&self) -> Result<(), TransportError> {
        trace!("RemoteSession({})::request_display_info id={}", self.id(), self.container_id);
        let msg = protocol::encode_display_info_request(self.container_id);
        self.send_parts("display info request", &[&msg[..]])
    }

    /// Registers a buffer: header, native handle, then its descriptors.
    pub fn create_buffer(&self, buffer: &BufferHandle) -> Result<(), TransportError> {
        trace!("RemoteSession({})::create_buffer {}", self.id(), buffer.id());
        let num_fds = buffer.native().num_fds();
        if num_fds > MAX_FDS_PER_TRANSFER {
            // Checked before the handle goes out: the peer would otherwise
            // wait for a descriptor message that never follows.
            return Err(TransportError::DescriptorTransfer {
                reason: format!("{num_fds} descriptors exceed limit {MAX_FDS_PER_TRANSFER}"),
            });
        }
        let (head, body) = protocol::encode_create_buffer(buffer);
        self.send_parts("create buffer", &[&head[..], &body[..]])?;

        let native = buffer.native();
        if native.num_fds() > 0 {
            let fds: Vec<BorrowedFd<'_>> = native.fds.iter().map(|fd| fd.as_fd()).collect();
            self.channel.send_descriptors(&fds).map_err(|e| {
                error!("RemoteSession({}) failed to send buffer descriptors: {e}", self.id());
                e
            })?;
        }
        Ok(())
    }

    pub fn remove_buffer(&self, id: BufferId) -> Result<(), TransportError> {
        trace!("RemoteSession({})::remove_buffer {id}", self.id());
        let msg = protocol::encode_buffer_message(MessageType::RemoveBuffer, id);
        self.send_parts("remove buffer", &[&msg[..]])
    }

    pub fn display_buffer(&self, id: BufferId) -> Result<(), TransportError> {
        trace!("RemoteSession({})::display_buffer {id}", self.id());
        let msg = protocol::encode_buffer_message(MessageType::DisplayRequest, id);
        self.send_parts("display buffer request", &[&msg[..]])
    }

    pub fn set_rotation(&self, rotation: i32) -> Result<(), TransportError> {
        trace!("RemoteSession({})::set_rotation {rotation}", self.id());
        let msg = protocol::encode_set_rotation(rotation);
        self.send_parts("rotation request", &[&msg[..]])
    }

    pub fn create_layer(&self, id: LayerId) -> Result<(), TransportError> {
        trace!("RemoteSession({})::create_layer {id:#x}", self.id());
        let msg = protocol::encode_layer_message(MessageType::CreateLayer, id);
        self.send_parts("create layer", &[&msg[..]])
    }

    pub fn remove_layer(&self, id: LayerId) -> Result<(), TransportError> {
        trace!("RemoteSession({})::remove_layer {id:#x}", self.id());
        let msg = protocol::encode_layer_message(MessageType::RemoveLayer, id);
        self.send_parts("remove layer", &[&msg[..]])
    }

    pub fn update_layers(&self, layers: &[LayerInfo]) -> Result<(), TransportError> {
        trace!("RemoteSession({})::update_layers count={}", self.id(), layers.len());
        for (i, layer) in layers.iter().enumerate() {
            trace!("  {i} layer {:#x} stack {} task {}", layer.layer_id, layer.stack_id, layer.task_id);
        }
        self.send_batch("update layers", MessageType::UpdateLayers, layers)
    }

    pub fn present_layers(&self, layers: &[LayerBufferInfo]) -> Result<(), TransportError> {
        trace!("RemoteSession({})::present_layers count={}", self.id(), layers.len());
        self.send_batch("present layers", MessageType::PresentLayersRequest, layers)
    }

    fn send_batch<R: WireRecord>(
        &self,
        what: &str,
        ty: MessageType,
        records: &[R],
    ) -> Result<(), TransportError> {
        let scratch = protocol::encode_records(records).map_err(|e| {
            error!("RemoteSession({}) {what}: {e}", self.id());
            e
        })?;
        let header = protocol::encode_batch_header::<R>(ty, records.len());
        self.send_parts(what, &[&header[..], &scratch[..]])
    }

    fn send_parts(&self, what: &str, parts: &[&[u8]]) -> Result<(), TransportError> {
        for part in parts {
            if let Err(e) = self.channel.send(part) {
                error!("RemoteSession({}) failed to send {what}: {e}", self.id());
                return Err(e);
            }
        }
        Ok(())
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Dispatches inbound messages until the channel closes.
    pub fn run_event_loop(&self) -> Result<(), TransportError> {
        info!("RemoteSession({}) event loop started", self.id());
        loop {
            match self.dispatch_event() {
                Ok(()) => {}
                Err(e) if !self.is_connected() => {
                    info!("RemoteSession({}) event loop finished: {e}", self.id());
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one message and routes it. Unknown messages are drained so the
    /// stream stays aligned on the next header.
    pub fn dispatch_event(&self) -> Result<(), TransportError> {
        let mut raw = [0u8; HEADER_SIZE];
        self.channel.receive(&mut raw)?;
        let header = MessageHeader::decode(&raw)?;
        trace!("RemoteSession({}) event type={:#x} size={}", self.id(), header.code, header.size);

        match header.message_type() {
            Some(MessageType::DisplayInfoAck) => self.on_display_info_ack(&header),
            Some(MessageType::DisplayAck) => self.on_display_buffer_ack(&header),
            Some(MessageType::PresentLayersAck) => self.on_present_layers_ack(&header),
            _ => {
                let expected = header.payload_len();
                self.drain(expected)?;
                warn!(
                    "RemoteSession({}) unknown command type {:#x}, drained {expected} bytes",
                    self.id(),
                    header.code
                );
                Ok(())
            }
        }
    }

    fn on_display_info_ack(&self, header: &MessageHeader) -> Result<(), TransportError> {
        let Some(body) = self.read_body(header)? else { return Ok(()) };
        let info = match protocol::decode_display_info(&body) {
            Ok(info) => info,
            Err(e) => {
                warn!("RemoteSession({}) malformed display info ack: {e}", self.id());
                return Ok(());
            }
        };

        if self.info.set(info).is_err() {
            warn!("RemoteSession({}) ignoring repeated display info ack", self.id());
            return Ok(());
        }
        self.flags.store(info.flags.to_bits(), Ordering::Release);
        info!(
            "RemoteSession({}) display {}x{} @{}fps dpi {}x{} version={} mode={:?}",
            self.id(),
            info.width,
            info.height,
            info.fps,
            info.xdpi,
            info.ydpi,
            info.flags.version,
            info.flags.mode
        );
        self.channel.notify_connected();
        Ok(())
    }

    fn on_display_buffer_ack(&self, header: &MessageHeader) -> Result<(), TransportError> {
        let Some(body) = self.read_body(header)? else { return Ok(()) };
        match BufferInfo::decode(&body) {
            Ok(info) => {
                if let Some(listener) = self.listener() {
                    listener.on_buffer_displayed(info);
                }
            }
            Err(e) => warn!("RemoteSession({}) malformed display ack: {e}", self.id()),
        }
        Ok(())
    }

    fn on_present_layers_ack(&self, header: &MessageHeader) -> Result<(), TransportError> {
        let Some(body) = self.read_body(header)? else { return Ok(()) };
        let ack = match PresentAck::decode(&body) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("RemoteSession({}) malformed present ack: {e}", self.id());
                return Ok(());
            }
        };
        self.flags.store(ack.flags.to_bits(), Ordering::Release);

        let records = &body[PRESENT_ACK_FIXED_SIZE..];
        let count = ack.num_layers as usize;
        if records.len() < count * LayerBufferInfo::SIZE {
            warn!(
                "RemoteSession({}) present ack claims {count} layers but carries {} bytes",
                self.id(),
                records.len()
            );
            return Ok(());
        }
        let layers = records
            .chunks_exact(LayerBufferInfo::SIZE)
            .take(count)
            .map(LayerBufferInfo::decode)
            .collect::<Result<Vec<_>, _>>()?;

        debug!("RemoteSession({}) presented {} layers", self.id(), layers.len());
        if let Some(listener) = self.listener() {
            listener.on_presented(layers, ack.release_fence);
        }
        Ok(())
    }

    /// Reads the declared body of a recognized message. Oversized bodies are
    /// drained and yield `None`.
    fn read_body(&self, header: &MessageHeader) -> Result<Option<Bytes>, TransportError> {
        let len = header.payload_len();
        if len > MAX_MESSAGE_SIZE {
            self.drain(len)?;
            warn!("RemoteSession({}) dropped {len}-byte message {:#x}", self.id(), header.code);
            return Ok(None);
        }
        let mut body = vec![0u8; len];
        self.channel.receive(&mut body)?;
        Ok(Some(Bytes::from(body)))
    }

    fn drain(&self, mut remaining: usize) -> Result<(), TransportError> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let n = remaining.min(DRAIN_CHUNK);
            self.channel.receive(&mut scratch[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn DisplayEventListener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("channel", &self.channel)
            .field("container_id", &self.container_id)
            .field("info", &self.info.get())
            .finish()
    }
}

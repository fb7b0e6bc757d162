//! Fixed binary message layouts exchanged with the remote renderer.
//!
//! All integers are host byte order. Every message starts with
//!
//! ```text
//! [0..4]  type   i32   message type code
//! [4..8]  size   u32   total message length, header included
//! ```
//!
//! so a reader can always skip a message it does not understand.
//!
//! | message               | body after header                                   |
//! |-----------------------|-----------------------------------------------------|
//! | DisplayInfoRequest    | id i32                                              |
//! | DisplayInfoAck        | width, height, fps, xdpi, ydpi i32, flags u32       |
//! | CreateBuffer          | bufferId i64, native handle, then SCM_RIGHTS        |
//! | RemoveBuffer          | bufferId i64                                        |
//! | DisplayRequest / Ack  | bufferId i64                                        |
//! | SetRotation           | rotation i32                                        |
//! | CreateLayer / Remove  | layerId u64                                         |
//! | UpdateLayers          | numLayers u32, numLayers × [`LayerInfo`]            |
//! | PresentLayersRequest  | numLayers u32, numLayers × [`LayerBufferInfo`]      |
//! | PresentLayersAck      | flags u32, numLayers u32, releaseFence i32, records |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hwclink_core::{
    BufferHandle, BufferId, DisplayFlags, DisplayInfo, FRect, LayerId, ProtocolError, Rect,
    TransportError,
};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const HEADER_SIZE: usize = 8;
pub const DISPLAY_INFO_SIZE: usize = 24;
pub const BUFFER_INFO_SIZE: usize = 8;
/// Header plus the `numLayers` word of a batched message.
pub const BATCH_HEADER_SIZE: usize = HEADER_SIZE + 4;
/// Fixed part of a present ack after the header.
pub const PRESENT_ACK_FIXED_SIZE: usize = 12;

// ── MessageType ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DisplayInfoRequest,
    DisplayInfoAck,
    CreateBuffer,
    RemoveBuffer,
    DisplayRequest,
    DisplayAck,
    SetRotation,
    CreateLayer,
    RemoveLayer,
    UpdateLayers,
    PresentLayersRequest,
    PresentLayersAck,
}

impl MessageType {
    pub const fn code(self) -> i32 {
        match self {
            Self::DisplayInfoRequest => 0x1000,
            Self::DisplayInfoAck => 0x1001,
            Self::CreateBuffer => 0x1002,
            Self::RemoveBuffer => 0x1003,
            Self::DisplayRequest => 0x1004,
            Self::DisplayAck => 0x1005,
            Self::SetRotation => 0x1006,
            Self::CreateLayer => 0x1007,
            Self::RemoveLayer => 0x1008,
            Self::UpdateLayers => 0x1009,
            Self::PresentLayersRequest => 0x100A,
            Self::PresentLayersAck => 0x100B,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0x1000 => Self::DisplayInfoRequest,
            0x1001 => Self::DisplayInfoAck,
            0x1002 => Self::CreateBuffer,
            0x1003 => Self::RemoveBuffer,
            0x1004 => Self::DisplayRequest,
            0x1005 => Self::DisplayAck,
            0x1006 => Self::SetRotation,
            0x1007 => Self::CreateLayer,
            0x1008 => Self::RemoveLayer,
            0x1009 => Self::UpdateLayers,
            0x100A => Self::PresentLayersRequest,
            0x100B => Self::PresentLayersAck,
            _ => return None,
        })
    }
}

// ── MessageHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub code: i32,
    pub size: u32,
}

impl MessageHeader {
    pub fn new(ty: MessageType, size: usize) -> Self {
        Self { code: ty.code(), size: size as u32 }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.code)
    }

    /// Bytes that follow the header according to `size`.
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_ne(self.code);
        buf.put_u32_ne(self.size);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(bytes, HEADER_SIZE)?;
        let mut b = bytes;
        Ok(Self { code: b.get_i32_ne(), size: b.get_u32_ne() })
    }
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if bytes.len() < needed {
        Err(ProtocolError::Truncated { needed, got: bytes.len() })
    } else {
        Ok(())
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// A fixed-size element of a batched message.
pub trait WireRecord: Sized {
    const SIZE: usize;

    fn encode(&self, buf: &mut impl BufMut);

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

/// Wire mirror of a layer's composition attributes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayerInfo {
    pub layer_id: LayerId,
    pub stack_id: u32,
    pub task_id: u32,
    pub user_id: u32,
    pub index: u32,
    pub blend_mode: i32,
    pub z: u32,
    pub plane_alpha: f32,
    pub color: u32,
    pub src_crop: FRect,
    pub dst_frame: Rect,
    pub transform: u32,
    pub changed: bool,
}

impl WireRecord for LayerInfo {
    const SIZE: usize = 80;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_ne(self.layer_id);
        buf.put_u32_ne(self.stack_id);
        buf.put_u32_ne(self.task_id);
        buf.put_u32_ne(self.user_id);
        buf.put_u32_ne(self.index);
        buf.put_i32_ne(self.blend_mode);
        buf.put_u32_ne(self.z);
        buf.put_f32_ne(self.plane_alpha);
        buf.put_u32_ne(self.color);
        buf.put_f32_ne(self.src_crop.left);
        buf.put_f32_ne(self.src_crop.top);
        buf.put_f32_ne(self.src_crop.right);
        buf.put_f32_ne(self.src_crop.bottom);
        buf.put_i32_ne(self.dst_frame.left);
        buf.put_i32_ne(self.dst_frame.top);
        buf.put_i32_ne(self.dst_frame.right);
        buf.put_i32_ne(self.dst_frame.bottom);
        buf.put_u32_ne(self.transform);
        buf.put_u32_ne(u32::from(self.changed));
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(bytes, Self::SIZE)?;
        let mut b = bytes;
        Ok(Self {
            layer_id: b.get_u64_ne(),
            stack_id: b.get_u32_ne(),
            task_id: b.get_u32_ne(),
            user_id: b.get_u32_ne(),
            index: b.get_u32_ne(),
            blend_mode: b.get_i32_ne(),
            z: b.get_u32_ne(),
            plane_alpha: b.get_f32_ne(),
            color: b.get_u32_ne(),
            src_crop: FRect::new(b.get_f32_ne(), b.get_f32_ne(), b.get_f32_ne(), b.get_f32_ne()),
            dst_frame: Rect::new(b.get_i32_ne(), b.get_i32_ne(), b.get_i32_ne(), b.get_i32_ne()),
            transform: b.get_u32_ne(),
            changed: b.get_u32_ne() != 0,
        })
    }
}

/// A layer's current buffer as shipped in present requests and acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerBufferInfo {
    pub layer_id: LayerId,
    pub buffer_id: u64,
    pub fence: i32,
    pub changed: bool,
}

impl WireRecord for LayerBufferInfo {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_ne(self.layer_id);
        buf.put_u64_ne(self.buffer_id);
        buf.put_i32_ne(self.fence);
        buf.put_u32_ne(u32::from(self.changed));
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(bytes, Self::SIZE)?;
        let mut b = bytes;
        Ok(Self {
            layer_id: b.get_u64_ne(),
            buffer_id: b.get_u64_ne(),
            fence: b.get_i32_ne(),
            changed: b.get_u32_ne() != 0,
        })
    }
}

/// Body of a display-buffer ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub buffer_id: BufferId,
}

impl BufferInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(bytes, BUFFER_INFO_SIZE)?;
        let mut b = bytes;
        Ok(Self { buffer_id: BufferId(b.get_u64_ne()) })
    }
}

/// Fixed part of a present-layers ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentAck {
    pub flags: DisplayFlags,
    pub num_layers: u32,
    pub release_fence: i32,
}

impl PresentAck {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(bytes, PRESENT_ACK_FIXED_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            flags: DisplayFlags::from_bits(b.get_u32_ne()),
            num_layers: b.get_u32_ne(),
            release_fence: b.get_i32_ne(),
        })
    }
}

pub fn decode_display_info(bytes: &[u8]) -> Result<DisplayInfo, ProtocolError> {
    ensure_len(bytes, DISPLAY_INFO_SIZE)?;
    let mut b = bytes;
    Ok(DisplayInfo {
        width: b.get_i32_ne(),
        height: b.get_i32_ne(),
        fps: b.get_i32_ne(),
        xdpi: b.get_i32_ne(),
        ydpi: b.get_i32_ne(),
        flags: DisplayFlags::from_bits(b.get_u32_ne()),
    })
}

// ── Request encoders ──────────────────────────────────────────────────────────

pub fn encode_display_info_request(id: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 4);
    MessageHeader::new(MessageType::DisplayInfoRequest, HEADER_SIZE + 4).encode(&mut buf);
    buf.put_i32_ne(id);
    buf.freeze()
}

/// The two structured parts of a create-buffer message: header with buffer
/// id, then the native handle. Descriptors travel separately.
pub fn encode_create_buffer(buffer: &BufferHandle) -> (Bytes, Bytes) {
    use std::os::fd::AsRawFd;

    let native = buffer.native();
    let total = HEADER_SIZE + BUFFER_INFO_SIZE + native.wire_len();

    let mut head = BytesMut::with_capacity(HEADER_SIZE + BUFFER_INFO_SIZE);
    MessageHeader::new(MessageType::CreateBuffer, total).encode(&mut head);
    head.put_u64_ne(buffer.id().0);

    let mut body = BytesMut::with_capacity(native.wire_len());
    body.put_i32_ne(native.version);
    body.put_i32_ne(native.num_fds() as i32);
    body.put_i32_ne(native.num_ints() as i32);
    for fd in &native.fds {
        body.put_i32_ne(fd.as_raw_fd());
    }
    for value in &native.ints {
        body.put_i32_ne(*value);
    }
    (head.freeze(), body.freeze())
}

/// RemoveBuffer and DisplayRequest share the `{header, bufferId}` layout.
pub fn encode_buffer_message(ty: MessageType, id: BufferId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + BUFFER_INFO_SIZE);
    MessageHeader::new(ty, HEADER_SIZE + BUFFER_INFO_SIZE).encode(&mut buf);
    buf.put_u64_ne(id.0);
    buf.freeze()
}

pub fn encode_set_rotation(rotation: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 4);
    MessageHeader::new(MessageType::SetRotation, HEADER_SIZE + 4).encode(&mut buf);
    buf.put_i32_ne(rotation);
    buf.freeze()
}

/// CreateLayer and RemoveLayer share the `{header, layerId}` layout.
pub fn encode_layer_message(ty: MessageType, id: LayerId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8);
    MessageHeader::new(ty, HEADER_SIZE + 8).encode(&mut buf);
    buf.put_u64_ne(id);
    buf.freeze()
}

/// Header and count of a batched message carrying `count` records of `R`.
pub fn encode_batch_header<R: WireRecord>(ty: MessageType, count: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE);
    MessageHeader::new(ty, BATCH_HEADER_SIZE + R::SIZE * count).encode(&mut buf);
    buf.put_u32_ne(count as u32);
    buf.freeze()
}

/// Packs `records` into one contiguous scratch array.
pub fn encode_records<R: WireRecord>(records: &[R]) -> Result<Vec<u8>, TransportError> {
    let mut scratch = Vec::new();
    scratch
        .try_reserve_exact(R::SIZE * records.len())
        .map_err(|_| TransportError::OutOfMemory { records: records.len() })?;
    for record in records {
        record.encode(&mut scratch);
    }
    Ok(scratch)
}

// ── Ack encoders (renderer side) ──────────────────────────────────────────────

pub fn encode_display_info_ack(info: &DisplayInfo) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + DISPLAY_INFO_SIZE);
    MessageHeader::new(MessageType::DisplayInfoAck, HEADER_SIZE + DISPLAY_INFO_SIZE)
        .encode(&mut buf);
    buf.put_i32_ne(info.width);
    buf.put_i32_ne(info.height);
    buf.put_i32_ne(info.fps);
    buf.put_i32_ne(info.xdpi);
    buf.put_i32_ne(info.ydpi);
    buf.put_u32_ne(info.flags.to_bits());
    buf.freeze()
}

pub fn encode_present_ack(flags: DisplayFlags, release_fence: i32, layers: &[LayerBufferInfo]) -> Bytes {
    let total = HEADER_SIZE + PRESENT_ACK_FIXED_SIZE + LayerBufferInfo::SIZE * layers.len();
    let mut buf = BytesMut::with_capacity(total);
    MessageHeader::new(MessageType::PresentLayersAck, total).encode(&mut buf);
    buf.put_u32_ne(flags.to_bits());
    buf.put_u32_ne(layers.len() as u32);
    buf.put_i32_ne(release_fence);
    for layer in layers {
        layer.encode(&mut buf);
    }
    buf.freeze()
}

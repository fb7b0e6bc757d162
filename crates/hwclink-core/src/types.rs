use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub type DisplayId = u64;
pub type LayerId = u64;

// MARK: - Resolution

/// Display dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parses the `"WxH"` form used by environment overrides.
    pub fn parse(value: &str) -> Option<Self> {
        let (w, h) = value.trim().split_once(['x', 'X'])?;
        let width = w.trim().parse().ok()?;
        let height = h.trim().parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// MARK: - CompositionMode

/// Strategy negotiated with the remote renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompositionMode {
    /// Only the composed client target is shipped.
    #[default]
    FramebufferOnly,
    /// Individual layers and their buffers are shipped.
    LayerLevel,
    /// Both the client target and individual layers are shipped.
    Hybrid,
    /// A mode this engine does not know; treated as layer-level.
    Other(u8),
}

impl CompositionMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::FramebufferOnly,
            1 => Self::LayerLevel,
            2 => Self::Hybrid,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::FramebufferOnly => 0,
            Self::LayerLevel => 1,
            Self::Hybrid => 2,
            Self::Other(other) => other,
        }
    }

    /// Modes 0 and 2 send the client target on present.
    pub fn ships_client_target(self) -> bool {
        matches!(self, Self::FramebufferOnly | Self::Hybrid)
    }

    /// Every mode above 0 sends layer attributes and layer buffers.
    pub fn ships_layers(self) -> bool {
        self.raw() > 0
    }
}

// MARK: - DisplayFlags

/// The packed flags word of the display-info and present acks, split into
/// named fields at the wire boundary.
///
/// Bits 0..8 hold the protocol version, bits 8..16 the composition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayFlags {
    pub version: u8,
    pub mode: CompositionMode,
}

impl DisplayFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            version: (bits & 0xff) as u8,
            mode: CompositionMode::from_raw(((bits >> 8) & 0xff) as u8),
        }
    }

    pub fn to_bits(self) -> u32 {
        u32::from(self.version) | (u32::from(self.mode.raw()) << 8)
    }
}

// MARK: - DisplayInfo

/// Remote display description, received once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    pub xdpi: i32,
    pub ydpi: i32,
    pub flags: DisplayFlags,
}

// MARK: - Composition

/// Composition type of a layer, numbered as the host numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Composition {
    #[default]
    Invalid,
    Client,
    Device,
    SolidColor,
    Cursor,
    Sideband,
}

impl Composition {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::Client,
            2 => Self::Device,
            3 => Self::SolidColor,
            4 => Self::Cursor,
            5 => Self::Sideband,
            _ => return None,
        })
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Client => 1,
            Self::Device => 2,
            Self::SolidColor => 3,
            Self::Cursor => 4,
            Self::Sideband => 5,
        }
    }
}

// MARK: - BlendMode

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Invalid,
    None,
    Premultiplied,
    Coverage,
}

impl BlendMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::None,
            2 => Self::Premultiplied,
            3 => Self::Coverage,
            _ => return None,
        })
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::None => 1,
            Self::Premultiplied => 2,
            Self::Coverage => 3,
        }
    }
}

// MARK: - Geometry

/// Integer rectangle (destination frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }
}

/// Floating rectangle (source crop).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }
}

/// A region is a list of rectangles; an empty list means "everything".
pub type Region = Vec<Rect>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Wire form: `r | g << 8 | b << 16 | a << 24`.
    pub fn packed(self) -> u32 {
        u32::from(self.r)
            | (u32::from(self.g) << 8)
            | (u32::from(self.b) << 16)
            | (u32::from(self.a) << 24)
    }
}

// MARK: - Transform

/// Layer transform values as the host encodes them.
pub mod transform {
    pub const NONE: u32 = 0;
    pub const FLIP_H: u32 = 1;
    pub const FLIP_V: u32 = 2;
    pub const ROT_90: u32 = 4;
    pub const ROT_180: u32 = 3;
    pub const ROT_270: u32 = 7;
}

// MARK: - Client target formats

pub mod pixel_format {
    pub const RGBA_8888: i32 = 1;
    pub const RGBX_8888: i32 = 2;
    pub const BGRA_8888: i32 = 5;
}

pub mod dataspace {
    pub const UNKNOWN: i32 = 0;
    pub const STANDARD_UNSPECIFIED: i32 = 1 << 16;
}

/// Display attributes the host may query for a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Width,
    Height,
    VsyncPeriod,
    DpiX,
    DpiY,
}

// MARK: - Buffers

/// Native buffer description: descriptors plus opaque integer data.
///
/// The descriptors stay owned by whoever allocated the buffer; the engine
/// only borrows them to pass a copy to the remote side.
#[derive(Debug)]
pub struct NativeHandle {
    pub version: i32,
    pub fds: Vec<OwnedFd>,
    pub ints: Vec<i32>,
}

impl NativeHandle {
    /// Size in bytes of the fixed `{version, numFds, numInts}` prefix.
    pub const HEADER_SIZE: usize = 12;

    pub fn new(fds: Vec<OwnedFd>, ints: Vec<i32>) -> Self {
        Self { version: Self::HEADER_SIZE as i32, fds, ints }
    }

    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    pub fn num_ints(&self) -> usize {
        self.ints.len()
    }

    /// Bytes of the native description on the wire, prefix included.
    pub fn wire_len(&self) -> usize {
        Self::HEADER_SIZE + (self.num_fds() + self.num_ints()) * 4
    }
}

/// Identity of a buffer as seen by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Reference to a host buffer. Cheap to clone; equality is identity.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    id: BufferId,
    native: Arc<NativeHandle>,
}

impl BufferHandle {
    pub fn new(id: BufferId, native: Arc<NativeHandle>) -> Self {
        Self { id, native }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn native(&self) -> &NativeHandle {
        &self.native
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BufferHandle {}

// MARK: - Fences

/// A sync fence descriptor; `None` means "no fence".
pub type Fence = Option<OwnedFd>;

/// Raw descriptor number for the wire, `-1` for no fence.
pub fn fence_raw(fence: &Fence) -> i32 {
    fence.as_ref().map_or(-1, |fd| fd.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_split_version_and_mode() {
        let flags = DisplayFlags::from_bits(0x0201);
        assert_eq!(flags.version, 1);
        assert_eq!(flags.mode, CompositionMode::Hybrid);
        assert_eq!(flags.to_bits(), 0x0201);
    }

    #[test]
    fn unknown_mode_behaves_as_layer_level() {
        let mode = CompositionMode::from_raw(7);
        assert_eq!(mode, CompositionMode::Other(7));
        assert!(mode.ships_layers());
        assert!(!mode.ships_client_target());
        assert!(!CompositionMode::FramebufferOnly.ships_layers());
        assert!(CompositionMode::Hybrid.ships_client_target());
    }

    #[test]
    fn color_packs_all_channels() {
        let color = Color::new(0x11, 0x22, 0x33, 0x44);
        assert_eq!(color.packed(), 0x4433_2211);
    }

    #[test]
    fn resolution_parses_env_form() {
        assert_eq!(Resolution::parse("1920x1080"), Some(Resolution::FHD));
        assert_eq!(Resolution::parse(" 720 X 1280 "), Some(Resolution::new(720, 1280)));
        assert_eq!(Resolution::parse("0x10"), None);
        assert_eq!(Resolution::parse("garbage"), None);
    }

    #[test]
    fn buffer_equality_is_identity() {
        let native = Arc::new(NativeHandle::new(Vec::new(), vec![1, 2]));
        let a = BufferHandle::new(BufferId(7), native.clone());
        let b = BufferHandle::new(BufferId(7), Arc::new(NativeHandle::new(Vec::new(), Vec::new())));
        let c = BufferHandle::new(BufferId(8), native);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.native().wire_len(), 12 + 2 * 4);
    }
}

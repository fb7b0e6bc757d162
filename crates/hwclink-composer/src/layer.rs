use std::os::fd::{AsFd, BorrowedFd};

use hwclink_core::{
    BlendMode, BufferHandle, Color, ComposerError, Composition, FRect, Fence, LayerId, Rect,
    Region, fence_raw,
};
use hwclink_transport::{LayerBufferInfo, LayerInfo};
use tracing::{debug, trace};

/// One layer of a display.
///
/// Attribute setters compare before writing: only a real change updates the
/// wire mirror and raises `changed`. A buffer change is tracked separately
/// and only by identity.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    requested_type: Composition,
    validated_type: Composition,
    type_changed: bool,

    blend_mode: BlendMode,
    color: Color,
    dataspace: i32,
    dst_frame: Rect,
    src_crop: FRect,
    plane_alpha: f32,
    transform: u32,
    z_order: u32,
    task: (u32, u32, u32, u32),
    damage: Region,
    visible_region: Region,

    buffer: Option<BufferHandle>,
    acquire_fence: Fence,

    info: LayerInfo,
    layer_buffer: LayerBufferInfo,
}

impl Layer {
    pub fn new(id: LayerId) -> Self {
        Self {
            id,
            requested_type: Composition::Invalid,
            validated_type: Composition::Invalid,
            type_changed: false,
            blend_mode: BlendMode::default(),
            color: Color::default(),
            dataspace: 0,
            dst_frame: Rect::default(),
            src_crop: FRect::default(),
            plane_alpha: 0.0,
            transform: 0,
            z_order: 0,
            task: (0, 0, 0, 0),
            damage: Region::new(),
            visible_region: Region::new(),
            buffer: None,
            acquire_fence: None,
            // A new layer ships its attributes on the first present.
            info: LayerInfo { layer_id: id, changed: true, ..Default::default() },
            layer_buffer: LayerBufferInfo { layer_id: id, ..Default::default() },
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    // ── Composition type ──────────────────────────────────────────────────────

    pub fn set_composition_type(&mut self, ty: Composition) {
        trace!("Layer({:#x})::set_composition_type {ty:?}", self.id);
        self.requested_type = ty;
    }

    pub fn requested_type(&self) -> Composition {
        self.requested_type
    }

    pub fn validated_type(&self) -> Composition {
        self.validated_type
    }

    /// Validated type differs from what the host asked for and the host has
    /// not accepted it yet.
    pub fn type_changed(&self) -> bool {
        self.type_changed
    }

    /// Applies the validation rule and moves the layer to its validated type.
    /// Returns `true` when the type had to change.
    pub fn validate(&mut self) -> bool {
        let validated = match self.requested_type {
            // No device-side composition: everything falls back to the client.
            Composition::Device
            | Composition::SolidColor
            | Composition::Cursor
            | Composition::Sideband => Composition::Client,
            other => other,
        };
        let changed = validated != self.requested_type;
        self.validated_type = validated;
        self.requested_type = validated;
        self.type_changed = changed;
        changed
    }

    pub fn accept_type_change(&mut self) {
        self.type_changed = false;
    }

    // ── Attributes ────────────────────────────────────────────────────────────

    pub fn set_cursor_position(&mut self, _x: i32, _y: i32) {}

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        if self.blend_mode != mode {
            self.blend_mode = mode;
            self.info.blend_mode = mode.raw();
            self.info.changed = true;
        }
    }

    pub fn set_color(&mut self, color: Color) {
        if self.color != color {
            self.color = color;
            self.info.color = color.packed();
            self.info.changed = true;
        }
    }

    pub fn set_dataspace(&mut self, dataspace: i32) {
        self.dataspace = dataspace;
    }

    pub fn dataspace(&self) -> i32 {
        self.dataspace
    }

    pub fn set_display_frame(&mut self, frame: Rect) {
        if self.dst_frame != frame {
            self.dst_frame = frame;
            self.info.dst_frame = frame;
            self.info.changed = true;
        }
    }

    pub fn set_source_crop(&mut self, crop: FRect) {
        if self.src_crop != crop {
            self.src_crop = crop;
            self.info.src_crop = crop;
            self.info.changed = true;
        }
    }

    pub fn set_plane_alpha(&mut self, alpha: f32) {
        if self.plane_alpha != alpha {
            self.plane_alpha = alpha;
            self.info.plane_alpha = alpha;
            self.info.changed = true;
        }
    }

    pub fn set_transform(&mut self, transform: u32) {
        if self.transform != transform {
            self.transform = transform;
            self.info.transform = transform;
            self.info.changed = true;
        }
    }

    pub fn set_z_order(&mut self, z: u32) {
        if self.z_order != z {
            self.z_order = z;
            self.info.z = z;
            self.info.changed = true;
        }
    }

    pub fn set_task_info(&mut self, stack_id: u32, task_id: u32, user_id: u32, index: u32) {
        let task = (stack_id, task_id, user_id, index);
        if self.task != task {
            self.task = task;
            self.info.stack_id = stack_id;
            self.info.task_id = task_id;
            self.info.user_id = user_id;
            self.info.index = index;
            self.info.changed = true;
        }
    }

    pub fn set_surface_damage(&mut self, damage: Region) {
        self.damage = damage;
    }

    pub fn set_visible_region(&mut self, visible: Region) {
        self.visible_region = visible;
    }

    pub fn surface_damage(&self) -> &Region {
        &self.damage
    }

    pub fn visible_region(&self) -> &Region {
        &self.visible_region
    }

    pub fn set_sideband_stream(&mut self) -> Result<(), ComposerError> {
        Err(ComposerError::Unsupported)
    }

    // ── Buffer ────────────────────────────────────────────────────────────────

    /// Replaces the acquire fence (closing the previous one) and, when the
    /// buffer identity changes, the buffer itself.
    ///
    /// Returns `true` on an identity change; the caller registers new
    /// buffers with the remote side.
    pub fn set_buffer(&mut self, buffer: Option<BufferHandle>, acquire_fence: Fence) -> bool {
        self.layer_buffer.fence = fence_raw(&acquire_fence);
        self.acquire_fence = acquire_fence;

        if self.buffer == buffer {
            return false;
        }
        self.layer_buffer.buffer_id = buffer.as_ref().map_or(0, |b| b.id().0);
        self.layer_buffer.changed = true;
        self.buffer = buffer;
        true
    }

    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref()
    }

    pub fn acquire_fence(&self) -> Option<BorrowedFd<'_>> {
        self.acquire_fence.as_ref().map(|fd| fd.as_fd())
    }

    /// Layers never hand back a release fence.
    pub fn release_fence(&self) -> Fence {
        None
    }

    // ── Dirty tracking ────────────────────────────────────────────────────────

    pub fn changed(&self) -> bool {
        self.info.changed
    }

    pub fn buffer_changed(&self) -> bool {
        self.layer_buffer.changed
    }

    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    pub fn layer_buffer(&self) -> &LayerBufferInfo {
        &self.layer_buffer
    }

    pub fn transform(&self) -> u32 {
        self.transform
    }

    pub fn mark_clean(&mut self) {
        self.info.changed = false;
        self.layer_buffer.changed = false;
    }

    pub fn dump(&self) {
        debug!(
            "  Layer {:#x}: type={:?} buf={:?} dst=<{},{},{},{}> src=<{:.1},{:.1},{:.1},{:.1}> \
             tr={} alpha={:.2} z={} stack={} task={} user={} index={}",
            self.id,
            self.requested_type,
            self.buffer.as_ref().map(|b| b.id()),
            self.dst_frame.left,
            self.dst_frame.top,
            self.dst_frame.right,
            self.dst_frame.bottom,
            self.src_crop.left,
            self.src_crop.top,
            self.src_crop.right,
            self.src_crop.bottom,
            self.transform,
            self.plane_alpha,
            self.z_order,
            self.task.0,
            self.task.1,
            self.task.2,
            self.task.3,
        );
    }
}

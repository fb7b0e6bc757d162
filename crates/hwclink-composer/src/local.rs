//! Optional local output path: a display may mirror its client target to a
//! locally attached sink alongside the remote renderer.

use hwclink_core::{transform, BufferHandle};
use tracing::info;

/// Returned by [`local_rotation_code`] for transforms the local path ignores.
pub const ROTATION_SKIP: i32 = 0x80;

/// A locally attached frame sink.
pub trait LocalOutput: Send {
    fn post_frame(&mut self, buffer: &BufferHandle);

    fn set_rotation(&mut self, rotation: i32);

    /// Called for the first frames after start-up or a rotation change.
    fn dump_frame(&mut self, _buffer: &BufferHandle, _frame: u64) {}
}

/// Rotation code for the local path. Flips and combined transforms map to
/// [`ROTATION_SKIP`] and leave the current rotation alone.
pub fn local_rotation_code(tr: u32) -> i32 {
    match tr {
        transform::NONE => 0,
        transform::ROT_90 => 1,
        transform::ROT_180 => 2,
        transform::ROT_270 => 3,
        _ => ROTATION_SKIP,
    }
}

/// Local output that only records what it is given in the log.
#[derive(Debug, Default)]
pub struct FrameLogOutput {
    posted: u64,
    rotation: i32,
}

impl FrameLogOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posted(&self) -> u64 {
        self.posted
    }

    pub fn rotation(&self) -> i32 {
        self.rotation
    }
}

impl LocalOutput for FrameLogOutput {
    fn post_frame(&mut self, _buffer: &BufferHandle) {
        self.posted += 1;
    }

    fn set_rotation(&mut self, rotation: i32) {
        info!("Local output rotation → {rotation}");
        self.rotation = rotation;
    }

    fn dump_frame(&mut self, buffer: &BufferHandle, frame: u64) {
        let native = buffer.native();
        info!(
            "frame {frame}: buffer {} ({} fds, {} ints)",
            buffer.id(),
            native.num_fds(),
            native.num_ints()
        );
    }
}

//! hwclink-composer: host-facing composition state
//!
//! Tracks what the host compositor sets on each display and layer, decides
//! which layers fall back to client composition, and on present forwards the
//! changed state to the remote renderer bound to the display.
//!
//! ```text
//! host ──set_*──▶ Layer (dirty flags)
//!      ──validate / accept_changes──▶ Display
//!      ──present──▶ Display ──client target / layer batches──▶ RemoteSession
//! RemoteSession acks ──DisplayRouter──▶ AckCounters (shared with the Display)
//! ```
//!
//! [`Device`] owns every display behind one mutex and serializes host calls
//! through it. Ack callbacks only touch the display's [`AckCounters`].

pub mod device;
pub mod display;
pub mod layer;
pub mod local;

pub use device::{Device, HostListener, PRIMARY_DISPLAY};
pub use display::{AckCounters, Display, DisplayType, ValidateOutcome};
pub use layer::Layer;
pub use local::{FrameLogOutput, LocalOutput};

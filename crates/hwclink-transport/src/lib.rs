//! hwclink-transport: remote renderer link
//!
//! # Architecture
//!
//! ```text
//! Composer (host thread)                 Remote renderer
//! ──────────────────────                 ───────────────
//! RemoteSession::create_buffer ──┐
//! RemoteSession::update_layers ──┼─ Channel (Unix stream + SCM_RIGHTS) ──►
//! RemoteSession::present_layers ─┘
//! RemoteSession::run_event_loop ◄─────── acks (display info, buffer, present)
//! (event thread)
//! ```

pub mod channel;
pub mod protocol;
pub mod session;

pub use channel::{Channel, ChannelId, ChannelObserver};
pub use protocol::{BufferInfo, LayerBufferInfo, LayerInfo, MessageHeader, MessageType};
pub use session::{DisplayEventListener, RemoteSession};

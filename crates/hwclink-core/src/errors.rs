use thiserror::Error;

use crate::types::{DisplayId, LayerId};

#[derive(Error, Debug)]
pub enum HwcLinkError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Composer error: {0}")]
    Composer(#[from] ComposerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the socket channel.
///
/// Every variant except `ChannelClosed` and `OutOfMemory` leaves the channel
/// permanently disconnected.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Descriptor transfer failed: {reason}")]
    DescriptorTransfer { reason: String },

    #[error("Out of memory preparing batch of {records} records")]
    OutOfMemory { records: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
}

/// Host-facing result codes of the composition engine.
#[derive(Error, Debug)]
pub enum ComposerError {
    #[error("Bad display {0}")]
    BadDisplay(DisplayId),

    #[error("Bad layer {0}")]
    BadLayer(LayerId),

    #[error("Bad config {0}")]
    BadConfig(u32),

    #[error("Unsupported operation")]
    Unsupported,

    #[error("Remote display has not reported its display info")]
    NoDisplayInfo,

    #[error("No more displays available (max {max})")]
    NoMoreDisplays { max: u32 },

    #[error("Remote transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl ComposerError {
    /// `true` when the failure came from the remote side rather than from a
    /// bad host argument.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

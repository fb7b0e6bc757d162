pub mod config;
pub mod errors;
pub mod types;

pub use config::EngineConfig;
pub use errors::{ComposerError, HwcLinkError, ProtocolError, TransportError};
pub use types::*;

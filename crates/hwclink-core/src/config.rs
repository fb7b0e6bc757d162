use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::HwcLinkError;
use crate::types::Resolution;

/// Engine configuration.
///
/// Loaded from JSON (snake_case or camelCase keys) and/or overlaid from
/// `HWCLINK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier sent in the display-info request; selects which remote
    /// endpoint's display the renderer reports.
    #[serde(alias = "containerId")]
    pub container_id: i32,
    #[serde(alias = "socketPath")]
    pub socket_path: PathBuf,
    /// Display size used before any remote renderer attaches.
    #[serde(alias = "displaySize")]
    pub display_size: Option<Resolution>,
    #[serde(alias = "maxDisplayCount")]
    pub max_display_count: u32,
    /// Frames handed to a local output's dumper after start-up.
    #[serde(alias = "framesToDump")]
    pub frames_to_dump: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_id: 0,
            socket_path: PathBuf::from("/tmp/hwclink.sock"),
            display_size: None,
            max_display_count: 100,
            frames_to_dump: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HwcLinkError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| HwcLinkError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    /// Applies `HWCLINK_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HWCLINK_CONTAINER_ID") {
            match v.trim().parse() {
                Ok(id) => self.container_id = id,
                Err(_) => warn!("Ignoring HWCLINK_CONTAINER_ID={v:?}: not an integer"),
            }
        }
        if let Some(v) = lookup("HWCLINK_SOCKET") {
            if !v.is_empty() {
                self.socket_path = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("HWCLINK_DISPLAY_SIZE") {
            match Resolution::parse(&v) {
                Some(res) => self.display_size = Some(res),
                None => warn!("Ignoring HWCLINK_DISPLAY_SIZE={v:?}: expected WxH"),
            }
        }
        if let Some(v) = lookup("HWCLINK_MAX_DISPLAYS") {
            match v.trim().parse::<u32>() {
                Ok(n) if n > 0 => self.max_display_count = n,
                _ => warn!("Ignoring HWCLINK_MAX_DISPLAYS={v:?}"),
            }
        }
        if let Some(v) = lookup("HWCLINK_FRAMES_TO_DUMP") {
            match v.trim().parse() {
                Ok(n) => self.frames_to_dump = n,
                Err(_) => warn!("Ignoring HWCLINK_FRAMES_TO_DUMP={v:?}"),
            }
        }
    }
}

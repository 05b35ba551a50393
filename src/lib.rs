pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureProperties, DeviceId, Frame, FrameCopy, FrameShape, Property};
pub use error::{AttachFailure, CaptureError, Result};
pub use pipeline::{FrameReader, LatestFrameSlot, SharedFrameBuffer};
pub use session::{CaptureSession, SessionState};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device index, V4L2 node path, or `pattern[:label]`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// How frames travel from the worker to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Worker thread + latest-frame slot
    InProcess,
    /// Worker process + named shared memory
    SharedMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub transport: Transport,
    /// Explicit shared-memory name; a unique one is generated when unset
    pub buffer_name: Option<String>,
    pub open_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Frames read while negotiating before giving up on the device
    pub negotiate_attempts: u32,
    /// Binary hosting the cross-process worker (`<program> worker ...`)
    pub worker_program: Option<PathBuf>,
    /// Pin the in-process worker thread to this core
    pub worker_core: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "0".into(),
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transport: Transport::InProcess,
            buffer_name: None,
            open_timeout_ms: 5000,
            read_timeout_ms: 2000,
            negotiate_attempts: 5,
            worker_program: None,
            worker_core: None,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `FRAMEGRAB__*` environment variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("FRAMEGRAB")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

impl CaptureConfig {
    pub fn properties(&self) -> CaptureProperties {
        CaptureProperties {
            width: Some(self.width),
            height: Some(self.height),
            target_fps: Some(self.fps),
            ..Default::default()
        }
    }
}

impl PipelineConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.pipeline.transport, Transport::InProcess);
        assert_eq!(config.pipeline.open_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_toml_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[capture]\ndevice = \"pattern\"\nwidth = 640\n\n[pipeline]\ntransport = \"shared-memory\"\nbuffer_name = \"/framegrab-test\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.device, "pattern");
        assert_eq!(config.capture.width, 640);
        // Untouched keys keep their defaults
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.pipeline.transport, Transport::SharedMemory);
        assert_eq!(config.pipeline.buffer_name.as_deref(), Some("/framegrab-test"));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/framegrab.toml"))).is_err());
    }
}

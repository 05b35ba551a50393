//! Error taxonomy for the capture pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be acquired or does not report itself open.
    /// Fatal for the open attempt, never retried automatically.
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// Another session is streaming from the same device.
    #[error("device {0} is already streaming in another session")]
    DeviceBusy(String),

    /// A single frame read failed. Absorbed by the worker loop.
    #[error("frame read failed: {0}")]
    ReadFailure(String),

    #[error("shared frame buffer {name}: {kind}")]
    BufferAttach { name: String, kind: AttachFailure },

    /// Read or configure on a session or handle that was already released.
    #[error("capture session already released")]
    AlreadyReleased,

    /// The worker died or stopped publishing within the allowed wait.
    #[error("capture worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("invalid frame shape: {0}")]
    InvalidShape(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachFailure {
    #[error("not found")]
    NotFound,
    #[error("size mismatch (expected {expected} bytes, found {actual})")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("already exists")]
    AlreadyExists,
    #[error("not a frame buffer")]
    BadHeader,
    #[error("os error: {0}")]
    Os(nix::errno::Errno),
}

impl CaptureError {
    pub(crate) fn unavailable(device: impl ToString, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn attach(name: impl ToString, kind: AttachFailure) -> Self {
        Self::BufferAttach {
            name: name.to_string(),
            kind,
        }
    }

    /// Whether the worker loop should swallow this error and keep going.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadFailure(_) | Self::Decode(_))
    }
}

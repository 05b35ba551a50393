//! Capture session: device negotiation, worker lifecycle, reconfiguration

mod process;
mod registry;
mod thread;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

pub use process::{parse_property, run_worker_process, WorkerArgs};

use self::process::ProcessBackend;
use self::registry::DeviceLease;
use self::thread::ThreadBackend;
use crate::capture::device::{self, apply_properties};
use crate::capture::{
    CaptureProperties, DeviceId, DeviceProvider, FrameCopy, FrameShape, Property, SystemDevices,
    Worker,
};
use crate::error::{CaptureError, Result};
use crate::pipeline::SharedFrameBuffer;
use crate::{PipelineConfig, Transport};

/// Pause between failed reads while negotiating
const NEGOTIATE_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Streaming,
    Closing,
}

/// One transport strategy behind a streaming session
trait Backend: Send + Sync {
    /// Newest frame, `None` before the first publish
    fn read_frame(&self) -> Result<Option<FrameCopy>>;

    fn wait_frame(&self, timeout: Duration) -> Result<FrameCopy>;

    fn is_alive(&self) -> bool;

    fn buffer_name(&self) -> Option<&str>;

    /// Cancel, join, release. Idempotent.
    fn shutdown(&mut self);
}

/// Owns one device stream at a time.
///
/// ```no_run
/// use framegrab::{CaptureProperties, CaptureSession, DeviceId, PipelineConfig};
///
/// let mut session = CaptureSession::new(PipelineConfig::default());
/// session.open(DeviceId::index(0), CaptureProperties::new(1280, 720, 30.0))?;
/// let frame = session.wait_frame()?;
/// assert_eq!(frame.shape().width, 1280);
/// session.close();
/// # Ok::<(), framegrab::CaptureError>(())
/// ```
pub struct CaptureSession {
    config: PipelineConfig,
    provider: Arc<dyn DeviceProvider>,
    state: SessionState,
    device: Option<DeviceId>,
    /// What the caller asked for, merged across `set` calls
    requested: CaptureProperties,
    /// What the device settled on, handed to the worker
    effective: CaptureProperties,
    shape: Option<FrameShape>,
    backend: Option<Box<dyn Backend>>,
    lease: Option<DeviceLease>,
}

impl CaptureSession {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_provider(config, Arc::new(SystemDevices))
    }

    /// Session opening devices through `provider`. Only the in-process
    /// transport runs its worker with it; worker processes use the system devices.
    pub fn with_provider(config: PipelineConfig, provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            config,
            provider,
            state: SessionState::Closed,
            device: None,
            requested: CaptureProperties::default(),
            effective: CaptureProperties::default(),
            shape: None,
            backend: None,
            lease: None,
        }
    }

    /// Negotiate with the device and start streaming from it.
    /// An already streaming session is closed first.
    #[instrument(skip(self, properties), fields(device = %device))]
    pub fn open(&mut self, device: DeviceId, properties: CaptureProperties) -> Result<()> {
        if self.state != SessionState::Closed {
            info!("Session already open, closing before reopening");
            self.close();
        }

        self.state = SessionState::Opening;
        match self.start(&device, &properties) {
            Ok(()) => {
                self.device = Some(device);
                self.requested = properties;
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(e) => {
                error!("Cannot open {}: {}", device, e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn start(&mut self, device: &DeviceId, properties: &CaptureProperties) -> Result<()> {
        let lease = DeviceLease::acquire(device)?;
        let (shape, reported) = negotiate(
            self.provider.as_ref(),
            device,
            properties,
            self.config.negotiate_attempts,
        )?;
        let effective = properties.merge(&reported);
        info!("Negotiated {} for {}", shape, device);

        let backend: Box<dyn Backend> = match self.config.transport {
            Transport::InProcess => Box::new(ThreadBackend::start(
                Worker::new(device.clone(), effective.clone(), shape),
                Arc::clone(&self.provider),
                self.config.open_timeout(),
                self.config.worker_core,
            )?),
            Transport::SharedMemory => {
                let name = self
                    .config
                    .buffer_name
                    .clone()
                    .unwrap_or_else(SharedFrameBuffer::unique_name);
                let args = WorkerArgs {
                    buffer: name.clone(),
                    device: device.clone(),
                    shape,
                    properties: effective.clone(),
                    parent_pid: Some(std::process::id() as i32),
                };
                Box::new(ProcessBackend::start(
                    &self.worker_program()?,
                    &name,
                    args,
                    self.config.open_timeout(),
                )?)
            }
        };

        self.lease = Some(lease);
        self.shape = Some(shape);
        self.effective = effective;
        self.backend = Some(backend);
        Ok(())
    }

    fn worker_program(&self) -> Result<PathBuf> {
        match &self.config.worker_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// True only while streaming
    pub fn is_opened(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Negotiated frame shape while streaming
    pub fn shape(&self) -> Option<FrameShape> {
        self.shape
    }

    /// Shared-memory name other processes can attach a `FrameReader` to
    pub fn buffer_name(&self) -> Option<&str> {
        self.backend.as_ref()?.buffer_name()
    }

    fn backend(&self) -> Result<&dyn Backend> {
        match (&self.state, &self.backend) {
            (SessionState::Streaming, Some(backend)) => Ok(backend.as_ref()),
            _ => Err(CaptureError::AlreadyReleased),
        }
    }

    /// Owned copy of the newest frame; `None` if nothing was published yet.
    pub fn read_frame(&self) -> Result<Option<FrameCopy>> {
        self.backend()?.read_frame()
    }

    /// Newest frame, waiting up to the configured read timeout for the first one.
    pub fn wait_frame(&self) -> Result<FrameCopy> {
        self.wait_frame_for(self.config.read_timeout())
    }

    pub fn wait_frame_for(&self, timeout: Duration) -> Result<FrameCopy> {
        self.backend()?.wait_frame(timeout)
    }

    /// Whether the worker is still running
    pub fn worker_alive(&self) -> bool {
        self.backend().is_ok_and(|b| b.is_alive())
    }

    /// Effective value of `property`
    pub fn get(&self, property: &Property) -> Result<f64> {
        self.backend()?;
        self.effective.get(property).ok_or_else(|| {
            CaptureError::unavailable(
                self.device.as_ref().map_or("device".into(), |d| d.to_string()),
                format!("property {} is not reported", property),
            )
        })
    }

    /// Change one property by releasing and reopening the device.
    ///
    /// `Ok(false)` when the new configuration could not be opened; the session
    /// then falls back to the previous configuration if it still opens. An
    /// unusable value (non-finite, or a size below one pixel) is refused
    /// without touching the stream.
    pub fn set(&mut self, property: Property, value: f64) -> Result<bool> {
        self.backend()?;
        let device = self.device.clone().ok_or(CaptureError::AlreadyReleased)?;
        if !valid_value(&property, value) {
            warn!("Ignoring {}={}: not a usable value", property, value);
            return Ok(false);
        }
        let previous = self.requested.clone();
        let mut updated = previous.clone();
        updated.insert(property.clone(), value);

        info!("Reopening {} with {}={}", device, property, value);
        self.close();
        match self.open(device.clone(), updated) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("{}={} rejected: {}", property, value, e);
                if let Err(e) = self.open(device, previous) {
                    error!("Previous configuration no longer opens: {}", e);
                }
                Ok(false)
            }
        }
    }

    /// Cancel and join the worker, release device and buffer. Idempotent.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        self.teardown();
        info!("Session closed");
    }

    /// Close and drop
    pub fn destroy(mut self) {
        self.close();
    }

    fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        self.lease = None;
        self.shape = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sizes must be positive, every value finite
fn valid_value(property: &Property, value: f64) -> bool {
    match property {
        Property::Width | Property::Height => value.is_finite() && value >= 1.0,
        _ => value.is_finite(),
    }
}

/// Open the device once, apply `properties`, and read back what it settled on.
/// The first frame decides the buffer shape.
fn negotiate(
    provider: &dyn DeviceProvider,
    id: &DeviceId,
    properties: &CaptureProperties,
    attempts: u32,
) -> Result<(FrameShape, CaptureProperties)> {
    let mut device = device::acquire(provider, id)?;
    apply_properties(device.0.as_mut(), properties);

    let mut reported = CaptureProperties::default();
    for (property, _) in properties.iter() {
        if let Some(value) = device.0.get(&property) {
            reported.insert(property, value);
        }
    }

    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match device.0.read() {
            Ok(frame) => {
                let shape = frame.shape();
                if shape.is_empty() {
                    return Err(CaptureError::InvalidShape(format!(
                        "{} negotiated an empty frame ({})",
                        id, shape
                    )));
                }
                reported.width = Some(shape.width);
                reported.height = Some(shape.height);
                debug!("Negotiation read frame after {} attempt(s)", attempt);
                return Ok((shape, reported));
            }
            Err(e) => {
                debug!("Negotiation read {} failed: {}", attempt, e);
                last_error = Some(e);
                std::thread::sleep(NEGOTIATE_RETRY);
            }
        }
    }

    Err(CaptureError::unavailable(
        id,
        format!(
            "no frame while negotiating: {}",
            last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        ),
    ))
}

//! Capture worker: owns the device and runs the read-publish loop

use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::device::{self, CaptureProperties, DeviceId, DeviceProvider};
use super::frame::{Frame, FrameShape};
use crate::error::Result;

const DEFAULT_FPS: f64 = 30.0;

/// Worker lifecycle, also stored in shared memory for the cross-process tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WorkerState {
    Idle = 0,
    Opening = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl WorkerState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Opening,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// The worker will not publish again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Where a worker sends its frames and reports its state
pub trait FrameSink {
    fn publish(&mut self, frame: &Frame) -> Result<()>;

    /// Checked at the top of every loop iteration
    fn is_cancelled(&self) -> bool;

    fn report(&mut self, state: WorkerState);
}

/// One capture loop for one device. Holds nothing but configuration; the
/// device handle only exists inside [`Worker::run`].
#[derive(Debug, Clone)]
pub struct Worker {
    device: DeviceId,
    properties: CaptureProperties,
    shape: FrameShape,
    interval: Duration,
}

impl Worker {
    /// `properties` are applied on open, `shape` is what every published frame must have.
    pub fn new(device: DeviceId, properties: CaptureProperties, shape: FrameShape) -> Self {
        let fps = properties
            .target_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(DEFAULT_FPS);
        Self {
            device,
            properties,
            shape,
            interval: Duration::from_secs_f64(1.0 / fps),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Opening -> Running -> Stopping -> Stopped, or Opening -> Failed.
    ///
    /// Returns once cancelled. Only an open failure is returned as an error;
    /// per-frame failures are logged and skipped.
    #[instrument(skip_all, fields(device = %self.device))]
    pub fn run(&self, provider: &dyn DeviceProvider, sink: &mut dyn FrameSink) -> Result<()> {
        sink.report(WorkerState::Opening);
        let mut device = match device::acquire(provider, &self.device) {
            Ok(device) => device,
            Err(e) => {
                error!("Failed to open {}: {}", self.device, e);
                sink.report(WorkerState::Failed);
                return Err(e);
            }
        };
        device::apply_properties(device.0.as_mut(), &self.properties);

        info!("Worker running: {} every {:?}", self.shape, self.interval);
        sink.report(WorkerState::Running);

        let mut failures = 0u32;
        let mut published = 0u64;
        while !sink.is_cancelled() {
            match device.0.read() {
                Ok(frame) if frame.shape() != self.shape => {
                    metrics::counter!("framegrab_shape_mismatches_total").increment(1);
                    warn!(
                        "Dropping frame {}: shape {} differs from negotiated {}",
                        frame.sequence(),
                        frame.shape(),
                        self.shape
                    );
                }
                Ok(frame) => {
                    if failures > 0 {
                        debug!("Device recovered after {} failed reads", failures);
                        failures = 0;
                    }
                    if let Err(e) = sink.publish(&frame) {
                        if e.is_transient() {
                            warn!("Publish failed: {}", e);
                        } else {
                            error!("Publish failed, stopping worker: {}", e);
                            break;
                        }
                    } else {
                        published += 1;
                        metrics::counter!("framegrab_frames_published_total").increment(1);
                    }
                }
                Err(e) => {
                    // Keep the previous frame available instead of stalling
                    failures += 1;
                    metrics::counter!("framegrab_read_failures_total").increment(1);
                    if failures == 1 {
                        warn!("Frame read failed: {}", e);
                    } else {
                        debug!("Frame read failed ({} in a row): {}", failures, e);
                    }
                }
            }
            thread::sleep(self.interval);
        }

        sink.report(WorkerState::Stopping);
        drop(device);
        info!("Worker stopped after {} frames", published);
        sink.report(WorkerState::Stopped);
        Ok(())
    }
}

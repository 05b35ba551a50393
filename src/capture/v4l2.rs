//! V4L2 capture device with memory-mapped streaming

use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder;
use super::device::{CaptureDevice, Property};
use super::frame::{Frame, FrameShape, PixelFormat};
use crate::error::{CaptureError, Result};

const BUFFER_COUNT: u32 = 4;

/// V4L2 node streaming MJPEG or YUYV, decoded to BGR
pub struct V4l2Device {
    // Declared first so the stream is dropped before the device
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    path: String,
    width: u32,
    height: u32,
    fps: Option<u32>,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Device {
    #[instrument]
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| CaptureError::unavailable(path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::unavailable(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::unavailable(
                path,
                "device doesn't support video capture",
            ));
        }

        let fmt = device
            .format()
            .map_err(|e| CaptureError::unavailable(path, e))?;

        let mut this = Self {
            stream: None,
            device: Some(device),
            path: path.to_string(),
            width: fmt.width,
            height: fmt.height,
            fps: None,
            format: PixelFormat::Mjpeg,
            sequence: 0,
        };
        // Settle on a format we can decode before anything else is applied
        this.apply_format(fmt.width, fmt.height)?;
        Ok(this)
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(CaptureError::AlreadyReleased)
    }

    /// Negotiate size + fourcc. The driver may adjust both; keep what it reports.
    fn apply_format(&mut self, width: u32, height: u32) -> Result<()> {
        // Formats cannot change under a live stream
        self.stream = None;

        let device = self.device()?;
        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;

        let mut effective = None;
        for (fourcc, format) in [
            (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
            (FourCC::new(b"YUYV"), PixelFormat::Yuyv4),
        ] {
            fmt.fourcc = fourcc;
            match device.set_format(&fmt) {
                Ok(actual) if actual.fourcc == fourcc => {
                    effective = Some((actual, format));
                    break;
                }
                Ok(actual) => debug!("{} refused {}, got {}", self.path, fourcc, actual.fourcc),
                Err(e) => debug!("{} set_format({}) failed: {}", self.path, fourcc, e),
            }
        }

        let (actual, format) = effective.ok_or_else(|| {
            CaptureError::unavailable(&self.path, "neither MJPEG nor YUYV is supported")
        })?;

        if actual.width != width || actual.height != height {
            info!(
                "{} adjusted {}x{} to {}x{}",
                self.path, width, height, actual.width, actual.height
            );
        }
        self.width = actual.width;
        self.height = actual.height;
        self.format = format;
        Ok(())
    }

    fn apply_fps(&mut self, fps: f64) -> bool {
        let Ok(device) = self.device() else {
            return false;
        };
        let requested = fps.round().max(1.0) as u32;
        match device.set_params(&Parameters::with_fps(requested)) {
            Ok(params) => {
                let interval = params.interval;
                self.fps = (interval.numerator > 0)
                    .then(|| interval.denominator / interval.numerator)
                    .or(Some(requested));
                true
            }
            Err(e) => {
                warn!("{} rejected frame rate {}: {}", self.path, requested, e);
                false
            }
        }
    }

    fn shape(&self) -> FrameShape {
        FrameShape::bgr(self.width, self.height)
    }

    fn start_stream(&mut self) -> Result<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(self.device()?, Type::VideoCapture, BUFFER_COUNT)?;
            info!(
                "{} streaming {:?} {}x{} with {} buffers",
                self.path, self.format, self.width, self.height, BUFFER_COUNT
            );
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| CaptureError::ReadFailure("stream not started".into()))
    }
}

impl CaptureDevice for V4l2Device {
    fn is_opened(&self) -> bool {
        self.device.is_some()
    }

    fn set(&mut self, property: &Property, value: f64) -> bool {
        if self.device.is_none() {
            return false;
        }
        let value_px = value.round().max(1.0) as u32;
        match property {
            Property::Width => self.apply_format(value_px, self.height).is_ok(),
            Property::Height => self.apply_format(self.width, value_px).is_ok(),
            Property::TargetFps => self.apply_fps(value),
            Property::Other(_) => false,
        }
    }

    fn get(&self, property: &Property) -> Option<f64> {
        self.device.as_ref()?;
        match property {
            Property::Width => Some(f64::from(self.width)),
            Property::Height => Some(f64::from(self.height)),
            Property::TargetFps => self.fps.map(f64::from),
            Property::Other(_) => None,
        }
    }

    fn read(&mut self) -> Result<Frame> {
        let shape = self.shape();
        let format = self.format;
        let stream = self
            .start_stream()
            .map_err(|e| CaptureError::ReadFailure(e.to_string()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::ReadFailure(e.to_string()))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let bgr = decoder::decode_frame(&buf[..used], format, shape)?;
        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        self.sequence += 1;
        Ok(Frame::new(bgr, shape, self.sequence)?.with_device_timestamp(device_ts))
    }

    fn release(&mut self) {
        if self.device.is_some() {
            self.stream = None;
            self.device = None;
            debug!("Released {}", self.path);
        }
    }
}

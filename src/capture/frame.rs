use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};

/// `(height, width, channels)` of a row-major `u8` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    /// BGR frame of the given size
    pub const fn bgr(width: u32, height: u32) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    pub const fn len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// A published frame. Immutable and cheap to clone.
#[derive(Clone)]
pub struct Frame {
    /// BGR pixel data, `meta.shape.len()` bytes
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub shape: FrameShape,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, shape: FrameShape, sequence: u64) -> Result<Self> {
        let data = data.into();
        if data.len() != shape.len() {
            return Err(CaptureError::InvalidShape(format!(
                "{} bytes do not fill {}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                shape,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn with_device_timestamp(mut self, ts: Duration) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = Some(ts);
        self
    }

    pub fn shape(&self) -> FrameShape {
        self.meta.shape
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Private copy for a consumer
    pub fn to_copy(&self) -> FrameCopy {
        FrameCopy {
            data: self.data.to_vec(),
            shape: self.meta.shape,
            sequence: self.meta.sequence,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("shape", &self.meta.shape)
            .finish()
    }
}

/// A frame owned by its reader. Never aliases pipeline memory, so it can be
/// mutated or held for as long as the caller likes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCopy {
    data: Vec<u8>,
    shape: FrameShape,
    sequence: u64,
}

impl FrameCopy {
    pub(crate) fn from_parts(data: Vec<u8>, shape: FrameShape, sequence: u64) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Self {
            data,
            shape,
            sequence,
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// BGR triple at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.shape.width || y >= self.shape.height {
            return None;
        }
        let ch = self.shape.channels as usize;
        let start = y as usize * self.shape.row_stride() + x as usize * ch;
        self.data.get(start..start + ch)
    }
}

/// Pixel formats a device may deliver before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_len() {
        let shape = FrameShape::bgr(1280, 720);
        assert_eq!(shape.len(), 720 * 1280 * 3);
        assert_eq!(shape.row_stride(), 3840);
        assert_eq!(shape.to_string(), "720x1280x3");
    }

    #[test]
    fn test_frame_rejects_wrong_size() {
        let err = Frame::new(vec![0u8; 10], FrameShape::bgr(2, 2), 1).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidShape(_)));
    }

    #[test]
    fn test_copy_is_independent() {
        let frame = Frame::new(vec![7u8; 12], FrameShape::bgr(2, 2), 3).unwrap();
        let mut copy = frame.to_copy();
        copy.data_mut()[0] = 0;
        assert_eq!(frame.data[0], 7);
        assert_eq!(frame.to_copy().data()[0], 7);
        assert_eq!(copy.sequence(), 3);
    }

    #[test]
    fn test_pixel_lookup() {
        let data: Vec<u8> = (0..12).collect();
        let copy = FrameCopy::from_parts(data, FrameShape::bgr(2, 2), 1);
        assert_eq!(copy.pixel(1, 1), Some(&[9u8, 10, 11][..]));
        assert_eq!(copy.pixel(2, 0), None);
    }
}

//! Synthetic test-pattern source, always available

use super::device::{CaptureDevice, Property};
use super::frame::{Frame, FrameShape};
use crate::error::{CaptureError, Result};

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const MAX_DIMENSION: u32 = 8192;

/// Moving BGR gradient. Frame `n` is shifted `n` pixels to the right.
pub struct PatternDevice {
    width: u32,
    height: u32,
    fps: Option<f64>,
    sequence: u64,
    opened: bool,
}

impl PatternDevice {
    pub fn new() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: None,
            sequence: 0,
            opened: true,
        }
    }

    /// Pixel at `(x, y)` of frame `sequence`
    pub fn pixel(shape: FrameShape, sequence: u64, x: u32, y: u32) -> [u8; 3] {
        let shift = (sequence % u64::from(shape.width.max(1))) as u32;
        let xs = (x + shift) % shape.width.max(1);
        [
            (xs * 255 / shape.width.max(1)) as u8,
            (y * 255 / shape.height.max(1)) as u8,
            (sequence % 256) as u8,
        ]
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let shape = FrameShape::bgr(self.width, self.height);
        let mut data = Vec::with_capacity(shape.len());
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&Self::pixel(shape, sequence, x, y));
            }
        }
        data
    }
}

impl Default for PatternDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for PatternDevice {
    fn is_opened(&self) -> bool {
        self.opened
    }

    fn set(&mut self, property: &Property, value: f64) -> bool {
        let px = value.round().clamp(1.0, f64::from(MAX_DIMENSION)) as u32;
        match property {
            Property::Width => self.width = px,
            Property::Height => self.height = px,
            Property::TargetFps if value > 0.0 => self.fps = Some(value),
            _ => return false,
        }
        true
    }

    fn get(&self, property: &Property) -> Option<f64> {
        match property {
            Property::Width => Some(f64::from(self.width)),
            Property::Height => Some(f64::from(self.height)),
            Property::TargetFps => self.fps,
            Property::Other(_) => None,
        }
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(CaptureError::ReadFailure("pattern released".into()));
        }
        self.sequence += 1;
        Frame::new(
            self.render(self.sequence),
            FrameShape::bgr(self.width, self.height),
            self.sequence,
        )
    }

    fn release(&mut self) {
        self.opened = false;
    }
}

//! Scripted camera shared by the session tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use framegrab::capture::{CaptureDevice, DeviceProvider};
use framegrab::{CaptureError, DeviceId, Frame, FrameShape, Property, Result};

/// Knobs and counters shared by every camera a [`ScriptedProvider`] opens
#[derive(Debug)]
pub struct Control {
    /// Successful reads left; reads fail once this reaches zero
    pub budget: AtomicI64,
    /// Cameras report themselves open
    pub available: AtomicBool,
    /// The next read panics, taking the capture thread down with it
    pub crash: AtomicBool,
    /// Reads fail while the camera is set wider than this
    pub max_width: AtomicU32,
    pub opens: AtomicU32,
    /// Cameras currently open
    pub held: AtomicI64,
    pub sequence: AtomicU64,
}

impl Control {
    pub fn allow(&self, reads: i64) {
        self.budget.store(reads, Ordering::SeqCst);
    }

    pub fn held(&self) -> i64 {
        self.held.load(Ordering::SeqCst)
    }
}

pub struct ScriptedCamera {
    control: Arc<Control>,
    width: u32,
    height: u32,
    fps: Option<f64>,
    opened: bool,
}

impl CaptureDevice for ScriptedCamera {
    fn is_opened(&self) -> bool {
        self.opened && self.control.available.load(Ordering::SeqCst)
    }

    fn set(&mut self, property: &Property, value: f64) -> bool {
        match property {
            Property::Width => self.width = value as u32,
            Property::Height => self.height = value as u32,
            Property::TargetFps => self.fps = Some(value),
            Property::Other(_) => return false,
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
            return Err(CaptureError::ReadFailure("released".into()));
        }
        if self.control.crash.load(Ordering::SeqCst) {
            panic!("scripted camera crashed");
        }
        if self.width > self.control.max_width.load(Ordering::SeqCst) {
            return Err(CaptureError::ReadFailure("unsupported width".into()));
        }
        if self.control.budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            self.control.budget.fetch_add(1, Ordering::SeqCst);
            return Err(CaptureError::ReadFailure("scripted failure".into()));
        }
        let sequence = self.control.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let shape = FrameShape::bgr(self.width, self.height);
        Frame::new(vec![(sequence % 256) as u8; shape.len()], shape, sequence)
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.opened, false) {
            self.control.held.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
pub struct ScriptedProvider {
    pub control: Arc<Control>,
}

impl ScriptedProvider {
    /// Cameras that deliver `reads` frames before failing
    pub fn new(reads: i64) -> Self {
        Self {
            control: Arc::new(Control {
                budget: AtomicI64::new(reads),
                available: AtomicBool::new(true),
                crash: AtomicBool::new(false),
                max_width: AtomicU32::new(u32::MAX),
                opens: AtomicU32::new(0),
                held: AtomicI64::new(0),
                sequence: AtomicU64::new(0),
            }),
        }
    }
}

impl DeviceProvider for ScriptedProvider {
    fn open(&self, _: &DeviceId) -> Result<Box<dyn CaptureDevice>> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        self.control.held.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedCamera {
            control: Arc::clone(&self.control),
            width: 1280,
            height: 720,
            fps: None,
            opened: true,
        }))
    }
}

/// Poll `condition` for up to `timeout`
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

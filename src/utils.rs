use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::{DeviceId, PixelFormat};
use crate::error::{CaptureError, Result};

/// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn id(&self) -> DeviceId {
        DeviceId::V4l2(self.path.clone())
    }
}

/// Capture-capable V4L2 nodes among `/dev/video0..9`, with their preferred decodable format
pub fn list_devices() -> Vec<FoundDevice> {
    (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| probe(&path))
        .collect()
}

fn probe(path: &str) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        debug!("{} ({}) cannot capture", path, caps.card);
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    // Prefer devices with MJPEG support
    let format = if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
        PixelFormat::Mjpeg
    } else if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
        PixelFormat::Yuyv4
    } else {
        debug!("{} offers no decodable format", path);
        return None;
    };

    Some(FoundDevice {
        path: path.to_string(),
        card: caps.card,
        format,
    })
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let devices = list_devices();
    let best = devices
        .iter()
        .find(|d| d.format == PixelFormat::Mjpeg)
        .or_else(|| devices.first())
        .cloned();

    match best {
        Some(device) => {
            info!("Found {:?} device: {} - {}", device.format, device.path, device.card);
            Ok(device)
        }
        None => Err(CaptureError::unavailable(
            "auto",
            "no suitable capture device found",
        )),
    }
}

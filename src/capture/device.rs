//! Device abstraction shared by both worker tiers

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use super::pattern::PatternDevice;
use super::v4l2::V4l2Device;
use crate::error::{CaptureError, Result};

/// Identifies one capture source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// V4L2 device node
    V4l2(String),
    /// Built-in synthetic source; the label keeps independent patterns apart
    Pattern(String),
}

impl DeviceId {
    pub fn index(index: u32) -> Self {
        Self::V4l2(format!("/dev/video{}", index))
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "pattern" {
            return Ok(Self::Pattern(String::new()));
        }
        if let Some(label) = s.strip_prefix("pattern:") {
            return Ok(Self::Pattern(label.to_string()));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(Self::index(index));
        }
        Ok(Self::V4l2(s.to_string()))
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4l2(path) => f.write_str(path),
            Self::Pattern(label) if label.is_empty() => f.write_str("pattern"),
            Self::Pattern(label) => write!(f, "pattern:{}", label),
        }
    }
}

/// A configurable device option
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Property {
    Width,
    Height,
    TargetFps,
    /// Passed through to the device, ignored if unsupported
    Other(String),
}

impl Property {
    pub fn name(&self) -> &str {
        match self {
            Self::Width => "width",
            Self::Height => "height",
            Self::TargetFps => "target_fps",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for Property {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "width" => Self::Width,
            "height" => Self::Height,
            "target_fps" | "targetFps" | "fps" => Self::TargetFps,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested (or effective) configuration of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureProperties {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub target_fps: Option<f64>,
    pub extra: BTreeMap<String, f64>,
}

impl CaptureProperties {
    pub fn new(width: u32, height: u32, target_fps: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            target_fps: Some(target_fps),
            extra: BTreeMap::new(),
        }
    }

    pub fn get(&self, property: &Property) -> Option<f64> {
        match property {
            Property::Width => self.width.map(f64::from),
            Property::Height => self.height.map(f64::from),
            Property::TargetFps => self.target_fps,
            Property::Other(name) => self.extra.get(name).copied(),
        }
    }

    pub fn insert(&mut self, property: Property, value: f64) {
        match property {
            Property::Width => self.width = Some(value.round() as u32),
            Property::Height => self.height = Some(value.round() as u32),
            Property::TargetFps => self.target_fps = Some(value),
            Property::Other(name) => {
                self.extra.insert(name, value);
            }
        }
    }

    /// Every set value, recognized properties first
    pub fn iter(&self) -> impl Iterator<Item = (Property, f64)> + '_ {
        [Property::Width, Property::Height, Property::TargetFps]
            .into_iter()
            .filter_map(|p| self.get(&p).map(|v| (p, v)))
            .chain(
                self.extra
                    .iter()
                    .map(|(k, v)| (Property::Other(k.clone()), *v)),
            )
    }

    /// `other`'s values overlaid on `self`
    pub fn merge(&self, other: &CaptureProperties) -> CaptureProperties {
        let mut merged = self.clone();
        for (property, value) in other.iter() {
            merged.insert(property, value);
        }
        merged
    }
}

/// An acquired capture device. Owned by exactly one worker while streaming.
pub trait CaptureDevice {
    fn is_opened(&self) -> bool;

    /// Apply one property; `false` when the device does not support it.
    fn set(&mut self, property: &Property, value: f64) -> bool;

    /// Effective value as the device reports it
    fn get(&self, property: &Property) -> Option<f64>;

    /// Read and decode one BGR frame. An `Err` is a transient failure.
    fn read(&mut self) -> Result<Frame>;

    /// Give the device back. Safe to call more than once.
    fn release(&mut self);
}

/// Opens devices by id
pub trait DeviceProvider: Send + Sync {
    fn open(&self, id: &DeviceId) -> Result<Box<dyn CaptureDevice>>;
}

/// Real V4L2 nodes plus the synthetic pattern source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn open(&self, id: &DeviceId) -> Result<Box<dyn CaptureDevice>> {
        match id {
            DeviceId::V4l2(path) => Ok(Box::new(V4l2Device::open(path)?)),
            DeviceId::Pattern(_) => Ok(Box::new(PatternDevice::new())),
        }
    }
}

/// Apply every property, logging the ones the device refused.
pub fn apply_properties(device: &mut dyn CaptureDevice, properties: &CaptureProperties) {
    for (property, value) in properties.iter() {
        if !device.set(&property, value) {
            tracing::debug!("Device ignored property {}={}", property, value);
        }
    }
}

/// Guard that releases a device when dropped
pub(crate) struct DeviceGuard(pub Box<dyn CaptureDevice>);

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Open `id` and make sure the device reports itself open.
pub(crate) fn acquire(provider: &dyn DeviceProvider, id: &DeviceId) -> Result<DeviceGuard> {
    let device = DeviceGuard(provider.open(id)?);
    if !device.0.is_opened() {
        return Err(CaptureError::unavailable(id, "device does not report open"));
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_ids() {
        assert_eq!(DeviceId::from("2"), DeviceId::V4l2("/dev/video2".into()));
        assert_eq!(
            DeviceId::from("/dev/v4l/by-id/usb-cam"),
            DeviceId::V4l2("/dev/v4l/by-id/usb-cam".into())
        );
        assert_eq!(DeviceId::from("pattern"), DeviceId::Pattern(String::new()));
        assert_eq!(DeviceId::from("pattern:a"), DeviceId::Pattern("a".into()));
        assert_eq!(DeviceId::from("pattern:a").to_string(), "pattern:a");
        assert_eq!(DeviceId::from("pattern").to_string(), "pattern");
    }

    #[test]
    fn test_merge_overlays_values() {
        let mut base = CaptureProperties::new(1280, 720, 30.0);
        base.insert(Property::Other("exposure".into()), 10.0);

        let mut update = CaptureProperties::default();
        update.insert(Property::Width, 640.0);
        update.insert(Property::Other("gain".into()), 2.0);

        let merged = base.merge(&update);
        assert_eq!(merged.width, Some(640));
        assert_eq!(merged.height, Some(720));
        assert_eq!(merged.target_fps, Some(30.0));
        assert_eq!(merged.get(&Property::Other("exposure".into())), Some(10.0));
        assert_eq!(merged.get(&Property::Other("gain".into())), Some(2.0));
    }

    #[test]
    fn test_property_names_round_trip() {
        for name in ["width", "height", "target_fps", "zoom"] {
            let property: Property = name.parse().unwrap();
            assert_eq!(property.name(), name);
        }
        assert_eq!("targetFps".parse::<Property>().unwrap(), Property::TargetFps);
    }
}

pub mod decoder;
pub mod device;
pub mod frame;
pub mod pattern;
pub mod v4l2;
pub mod worker;

pub use device::{
    CaptureDevice, CaptureProperties, DeviceId, DeviceProvider, Property, SystemDevices,
};
pub use frame::{Frame, FrameCopy, FrameShape, PixelFormat};
pub use pattern::PatternDevice;
pub use v4l2::V4l2Device;
pub use worker::{FrameSink, Worker, WorkerState};

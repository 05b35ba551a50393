pub mod shm;
pub mod signal;
pub mod slot;

pub use shm::{FrameReader, SharedFrameBuffer};
pub use signal::Signals;
pub use slot::{LatestFrameSlot, SlotStats};

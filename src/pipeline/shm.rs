//! Named shared-memory frame buffer for the cross-process tier
//!
//! Layout: one page-aligned [`Header`] followed by two frame slots. The writer
//! always fills the slot readers are not pointed at, then flips `active`.
//! Each slot carries a sequence counter (odd while being written) so a reader
//! that raced two consecutive writes detects it and copies again.

use std::fs::File;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::Backoff;
use memmap2::MmapRaw;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};

use super::signal::Signals;
use crate::capture::{FrameCopy, FrameShape};
use crate::error::{AttachFailure, CaptureError, Result};

const MAGIC: u32 = u32::from_be_bytes(*b"FGRB");
const VERSION: u32 = 2;

#[repr(C)]
struct Header {
    magic: u32,
    version: u32,
    height: u32,
    width: u32,
    channels: u32,
    active: AtomicU32,
    frame_len: u64,
    /// Sequence of the newest frame, meaningful once `frames > 0`
    published: AtomicU64,
    frames: AtomicU64,
    slot_seq: [AtomicU64; 2],
    slot_frame: [AtomicU64; 2],
    signals: Signals,
}

impl Header {
    fn shape(&self) -> FrameShape {
        FrameShape {
            height: self.height,
            width: self.width,
            channels: self.channels,
        }
    }
}

fn data_offset() -> usize {
    let page = page_size::get();
    size_of::<Header>().div_ceil(page) * page
}

/// Bytes needed for a region holding frames of `shape`
pub fn region_len(shape: FrameShape) -> usize {
    data_offset() + 2 * shape.len()
}

/// Shared-memory names are a single `/`-prefixed component.
fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.len() > 250 {
        return Err(CaptureError::attach(name, AttachFailure::Os(Errno::EINVAL)));
    }
    Ok(format!("/{}", trimmed))
}

/// Handle to a mapped frame region.
///
/// The creator owns the OS object and unlinks it on release; attachments only unmap.
pub struct SharedFrameBuffer {
    name: String,
    map: Option<MmapRaw>,
    shape: FrameShape,
    owner: bool,
}

impl SharedFrameBuffer {
    /// `/framegrab-<pid>-<n>`, unique within this process
    pub fn unique_name() -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "/framegrab-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Allocate a region for frames of `shape` under `name`.
    pub fn create(name: &str, shape: FrameShape) -> Result<Self> {
        if shape.is_empty() {
            return Err(CaptureError::InvalidShape(format!("empty shape {}", shape)));
        }
        let name = normalize_name(name)?;
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => CaptureError::attach(&name, AttachFailure::AlreadyExists),
            other => CaptureError::attach(&name, AttachFailure::Os(other)),
        })?;
        let file = File::from(fd);

        let map = file
            .set_len(region_len(shape) as u64)
            .and_then(|_| MmapRaw::map_raw(&file));
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                let _ = shm_unlink(name.as_str());
                return Err(e.into());
            }
        };

        // SAFETY: the mapping is at least one page, page aligned, and nobody
        // else can have attached yet because O_EXCL just created it.
        unsafe {
            ptr::write(
                map.as_mut_ptr() as *mut Header,
                Header {
                    magic: MAGIC,
                    version: VERSION,
                    height: shape.height,
                    width: shape.width,
                    channels: shape.channels,
                    active: AtomicU32::new(0),
                    frame_len: shape.len() as u64,
                    published: AtomicU64::new(0),
                    frames: AtomicU64::new(0),
                    slot_seq: [AtomicU64::new(0), AtomicU64::new(0)],
                    slot_frame: [AtomicU64::new(0), AtomicU64::new(0)],
                    signals: Signals::new(),
                },
            );
        }

        info!("Created shared frame buffer {} ({})", name, shape);
        Ok(Self {
            name,
            map: Some(map),
            shape,
            owner: true,
        })
    }

    /// Map an existing region created for frames of `shape`.
    pub fn attach(name: &str, shape: FrameShape) -> Result<Self> {
        let name = normalize_name(name)?;
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            match errno {
                Errno::ENOENT => CaptureError::attach(&name, AttachFailure::NotFound),
                other => CaptureError::attach(&name, AttachFailure::Os(other)),
            }
        })?;
        let file = File::from(fd);

        let expected = region_len(shape);
        let actual = file.metadata()?.len() as usize;
        if actual != expected {
            return Err(CaptureError::attach(
                &name,
                AttachFailure::SizeMismatch { expected, actual },
            ));
        }

        let map = MmapRaw::map_raw(&file)?;
        let this = Self {
            name,
            map: Some(map),
            shape,
            owner: false,
        };

        let header = this.header()?;
        if header.magic != MAGIC || header.version != VERSION {
            return Err(CaptureError::attach(&this.name, AttachFailure::BadHeader));
        }
        if header.shape() != shape {
            return Err(CaptureError::attach(
                &this.name,
                AttachFailure::SizeMismatch {
                    expected: shape.len(),
                    actual: header.frame_len as usize,
                },
            ));
        }

        debug!("Attached shared frame buffer {}", this.name);
        Ok(this)
    }

    fn header(&self) -> Result<&Header> {
        let map = self.map.as_ref().ok_or(CaptureError::AlreadyReleased)?;
        // SAFETY: the header was initialised by `create` before the name was
        // visible to anyone else, and lives as long as the mapping.
        Ok(unsafe { &*(map.as_ptr() as *const Header) })
    }

    fn slot_ptr(&self, slot: usize) -> Result<*mut u8> {
        let map = self.map.as_ref().ok_or(CaptureError::AlreadyReleased)?;
        // SAFETY: `region_len` reserved two slots of `shape.len()` bytes past the header.
        Ok(unsafe { map.as_mut_ptr().add(data_offset() + slot * self.shape.len()) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }

    pub fn signals(&self) -> Result<&Signals> {
        Ok(&self.header()?.signals)
    }

    /// Sequence of the newest published frame, `None` before the first publish
    pub fn published(&self) -> Result<Option<u64>> {
        let header = self.header()?;
        if header.frames.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        Ok(Some(header.published.load(Ordering::Acquire)))
    }

    /// Writer side: copy `data` into the inactive slot and make it current.
    /// Only one writer may publish into a region.
    pub fn publish(&self, data: &[u8], sequence: u64) -> Result<()> {
        if data.len() != self.shape.len() {
            return Err(CaptureError::InvalidShape(format!(
                "{} bytes do not fill {}",
                data.len(),
                self.shape
            )));
        }
        let header = self.header()?;
        let slot = (header.active.load(Ordering::Relaxed) ^ 1) as usize;
        let seq = &header.slot_seq[slot];
        let start = seq.load(Ordering::Relaxed);

        header.signals.clear_ready();
        seq.store(start.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: the slot is in bounds and readers only ever copy out of it,
        // validating against `seq` afterwards.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.slot_ptr(slot)?, data.len());
        }
        header.slot_frame[slot].store(sequence, Ordering::Relaxed);

        seq.store(start.wrapping_add(2), Ordering::Release);
        header.active.store(slot as u32, Ordering::Release);
        header.published.store(sequence, Ordering::Release);
        header.frames.fetch_add(1, Ordering::Release);
        header.signals.set_ready();
        Ok(())
    }

    /// Reader side: private copy of the newest frame, `None` before the first publish.
    pub fn read(&self) -> Result<Option<FrameCopy>> {
        let header = self.header()?;
        let backoff = Backoff::new();
        let mut buf = vec![0u8; self.shape.len()];

        loop {
            if header.frames.load(Ordering::Acquire) == 0 {
                return Ok(None);
            }
            let slot = header.active.load(Ordering::Acquire) as usize;
            let seq = &header.slot_seq[slot];

            let before = seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                backoff.snooze();
                continue;
            }
            // SAFETY: in bounds. The writer may be filling this slot at the same
            // time, which makes this plain copy racy in the Rust memory model; the
            // bytes are only trusted after the slot sequence is re-checked below,
            // and a copy that overlapped a write is thrown away and retried.
            unsafe {
                ptr::copy_nonoverlapping(self.slot_ptr(slot)?, buf.as_mut_ptr(), buf.len());
            }
            let sequence = header.slot_frame[slot].load(Ordering::Relaxed);
            fence(Ordering::Acquire);

            if seq.load(Ordering::Relaxed) == before {
                return Ok(Some(FrameCopy::from_parts(buf, self.shape, sequence)));
            }
            metrics::counter!("framegrab_torn_reads_retried_total").increment(1);
            backoff.spin();
        }
    }

    /// Wait (bounded) for a frame, failing early when `alive` turns false.
    pub fn wait(&self, timeout: Duration, alive: impl Fn() -> bool) -> Result<FrameCopy> {
        self.signals()?.wait_ready(timeout, alive)?;
        self.read()?.ok_or_else(|| {
            CaptureError::WorkerUnavailable("ready set without a published frame".into())
        })
    }

    /// Unmap, and unlink if this handle created the region. Idempotent.
    pub fn release(&mut self) {
        if self.map.take().is_none() {
            return;
        }
        if self.owner {
            match shm_unlink(self.name.as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => warn!("Failed to unlink {}: {}", self.name, e),
            }
            debug!("Released shared frame buffer {}", self.name);
        }
    }
}

impl Drop for SharedFrameBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read-only attachment for participants that do not own the region
pub struct FrameReader {
    buffer: SharedFrameBuffer,
    timeout: Duration,
}

impl FrameReader {
    pub fn attach(name: &str, shape: FrameShape) -> Result<Self> {
        Ok(Self {
            buffer: SharedFrameBuffer::attach(name, shape)?,
            timeout: Duration::from_secs(2),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    pub fn shape(&self) -> FrameShape {
        self.buffer.shape()
    }

    /// Newest frame without waiting
    pub fn read(&self) -> Result<Option<FrameCopy>> {
        self.buffer.read()
    }

    /// Newest frame, waiting up to the reader timeout for the first one
    pub fn wait(&self) -> Result<FrameCopy> {
        let signals = self.buffer.signals()?;
        self.buffer.wait(self.timeout, || signals.worker_alive())
    }

    /// Whether the publishing worker is still running.
    ///
    /// Based on the header state and the worker pid, so a crashed worker is
    /// only seen as gone once the owning session has reaped it.
    pub fn worker_alive(&self) -> bool {
        self.buffer.signals().is_ok_and(Signals::worker_alive)
    }

    pub fn release(&mut self) {
        self.buffer.release();
    }
}

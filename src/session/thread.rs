//! In-process tier: capture thread publishing into a [`LatestFrameSlot`]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::Backend;
use crate::capture::{DeviceProvider, Frame, FrameCopy, FrameSink, Worker, WorkerState};
use crate::error::{CaptureError, Result};
use crate::pipeline::LatestFrameSlot;

const IDLE_POLL: Duration = Duration::from_millis(1);

struct SlotSink {
    slot: Arc<LatestFrameSlot>,
    cancel: Arc<AtomicBool>,
    status: Sender<WorkerState>,
}

impl FrameSink for SlotSink {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        self.slot.put(frame.clone());
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn report(&mut self, state: WorkerState) {
        // The session may have stopped listening; that is fine
        let _ = self.status.send(state);
    }
}

pub(crate) struct ThreadBackend {
    slot: Arc<LatestFrameSlot>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ThreadBackend {
    /// Spawn the capture thread and wait until it is running or has failed to open.
    pub(crate) fn start(
        worker: Worker,
        provider: Arc<dyn DeviceProvider>,
        open_timeout: Duration,
        core: Option<usize>,
    ) -> Result<Self> {
        let slot = Arc::new(LatestFrameSlot::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = flume::unbounded();

        let mut sink = SlotSink {
            slot: Arc::clone(&slot),
            cancel: Arc::clone(&cancel),
            status: status_tx,
        };
        let handle = thread::Builder::new()
            .name("framegrab-capture".into())
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!("Could not pin capture thread to core {}", id);
                    }
                }
                worker.run(provider.as_ref(), &mut sink)
            })?;

        let mut backend = Self {
            slot,
            cancel,
            handle: Some(handle),
        };
        backend.await_running(&status_rx, open_timeout)?;
        Ok(backend)
    }

    fn await_running(&mut self, status: &Receiver<WorkerState>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match status.recv_timeout(remaining) {
                Ok(WorkerState::Running) => {
                    info!("Capture thread running");
                    return Ok(());
                }
                Ok(state) => debug!("Capture thread {:?}", state),
                Err(RecvTimeoutError::Timeout) => {
                    self.shutdown();
                    return Err(CaptureError::unavailable(
                        "capture thread",
                        format!("not running after {:?}", timeout),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // The worker returned before running: surface its error
                    return match self.join() {
                        Some(Err(e)) => Err(e),
                        _ => Err(CaptureError::unavailable(
                            "capture thread",
                            "exited while opening",
                        )),
                    };
                }
            }
        }
    }

    fn join(&mut self) -> Option<Result<()>> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(result) => Some(result),
            Err(_) => {
                error!("Capture thread panicked");
                Some(Err(CaptureError::WorkerUnavailable(
                    "capture thread panicked".into(),
                )))
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(CaptureError::WorkerUnavailable(
                "capture thread has exited".into(),
            ))
        }
    }
}

impl Backend for ThreadBackend {
    fn read_frame(&self) -> Result<Option<FrameCopy>> {
        self.ensure_alive()?;
        Ok(self.slot.get().map(|frame| frame.to_copy()))
    }

    fn wait_frame(&self, timeout: Duration) -> Result<FrameCopy> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            self.ensure_alive()?;
            if let Some(frame) = self.slot.get() {
                return Ok(frame.to_copy());
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::WorkerUnavailable(format!(
                    "no frame within {:?}",
                    timeout
                )));
            }
            if backoff.is_completed() {
                thread::sleep(IDLE_POLL);
            } else {
                backoff.snooze();
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn buffer_name(&self) -> Option<&str> {
        None
    }

    fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(Err(e)) = self.join() {
            warn!("Capture thread ended with error: {}", e);
        }
        let stats = self.slot.stats();
        debug!(
            "Slot stats: {} written, {} read, {} coalesced",
            stats.written, stats.read, stats.coalesced
        );
    }
}

impl Drop for ThreadBackend {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

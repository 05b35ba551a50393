//! Cross-process hand-off flags living in the shared region header

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::capture::WorkerState;
use crate::error::{CaptureError, Result};

/// Longest sleep between polls once spinning has backed off
const MAX_POLL: Duration = Duration::from_millis(2);

/// `ready` / `cancel` handshake plus worker bookkeeping.
///
/// Laid out in shared memory, so only plain atomics and `repr(C)`.
#[repr(C)]
pub struct Signals {
    ready: AtomicU32,
    cancel: AtomicU32,
    state: AtomicU32,
    worker_pid: AtomicU32,
}

impl Signals {
    pub(crate) const fn new() -> Self {
        Self {
            ready: AtomicU32::new(0),
            cancel: AtomicU32::new(0),
            state: AtomicU32::new(0),
            worker_pid: AtomicU32::new(0),
        }
    }

    /// Cleared while a frame is being written
    pub fn clear_ready(&self) {
        self.ready.store(0, Ordering::Release);
    }

    /// Set once a complete frame has been published
    pub fn set_ready(&self) {
        self.ready.store(1, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Ask the worker to stop. Monotonic, never reset.
    pub fn cancel(&self) {
        self.cancel.store(1, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire) != 0
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn worker_pid(&self) -> Option<Pid> {
        match self.worker_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(Pid::from_raw(pid as i32)),
        }
    }

    pub fn set_worker_pid(&self, pid: u32) {
        self.worker_pid.store(pid, Ordering::Release);
    }

    /// The worker has not finished and its process still exists.
    /// A worker that never registered a pid counts as alive.
    ///
    /// A crashed worker stays visible as a zombie until its parent reaps it,
    /// and a recycled pid looks alive too. Only the owning session, which
    /// polls the child directly, notices a crash immediately.
    pub fn worker_alive(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        match self.worker_pid() {
            None => true,
            Some(pid) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
        }
    }

    /// Block until `ready` is set, bounded by `timeout` and `alive`.
    /// Fails as soon as `alive` turns false, even with a frame already published.
    pub fn wait_ready(&self, timeout: Duration, alive: impl Fn() -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            // A dead worker leaves `ready` set, so liveness goes first
            if !alive() {
                return Err(CaptureError::WorkerUnavailable(format!(
                    "worker exited in state {:?}",
                    self.state()
                )));
            }
            if self.is_ready() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::WorkerUnavailable(format!(
                    "no frame within {:?}",
                    timeout
                )));
            }
            if backoff.is_completed() {
                std::thread::sleep(MAX_POLL);
            } else {
                backoff.snooze();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_monotonic() {
        let signals = Signals::new();
        assert!(!signals.is_cancelled());
        signals.cancel();
        signals.cancel();
        assert!(signals.is_cancelled());
    }

    #[test]
    fn test_wait_ready_times_out() {
        let signals = Signals::new();
        let start = Instant::now();
        let err = signals
            .wait_ready(Duration::from_millis(50), || true)
            .unwrap_err();
        assert!(matches!(err, CaptureError::WorkerUnavailable(_)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_ready_notices_dead_worker() {
        let signals = Signals::new();
        signals.set_state(WorkerState::Failed);
        assert!(!signals.worker_alive());
        let err = signals
            .wait_ready(Duration::from_secs(60), || signals.worker_alive())
            .unwrap_err();
        assert!(matches!(err, CaptureError::WorkerUnavailable(_)));
    }

    #[test]
    fn test_own_pid_is_alive() {
        let signals = Signals::new();
        assert!(signals.worker_alive());
        signals.set_worker_pid(std::process::id());
        assert!(signals.worker_alive());
    }

    #[test]
    fn test_ready_does_not_hide_dead_worker() {
        let signals = Signals::new();
        signals.set_state(WorkerState::Running);
        signals.set_ready();
        // The worker died after publishing without ever reaching a terminal state
        let err = signals
            .wait_ready(Duration::from_secs(60), || false)
            .unwrap_err();
        assert!(matches!(err, CaptureError::WorkerUnavailable(_)));
        assert!(signals.is_ready());
    }

    #[test]
    fn test_ready_wakes_waiter() {
        let signals = Signals::new();
        signals.set_ready();
        signals.wait_ready(Duration::from_millis(1), || true).unwrap();
        signals.clear_ready();
        assert!(!signals.is_ready());
    }
}

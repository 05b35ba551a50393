//! Cross-process tier: worker process publishing into a [`SharedFrameBuffer`]

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{getppid, Pid};
use tracing::{debug, error, info, instrument, warn};

use super::Backend;
use crate::capture::{
    CaptureProperties, DeviceId, Frame, FrameCopy, FrameShape, FrameSink, Property,
    SystemDevices, Worker, WorkerState,
};
use crate::error::{CaptureError, Result};
use crate::pipeline::SharedFrameBuffer;

const POLL: Duration = Duration::from_millis(5);

/// Everything a worker process needs, as passed on its command line
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub buffer: String,
    pub device: DeviceId,
    pub shape: FrameShape,
    pub properties: CaptureProperties,
    /// Treat a change of parent as cancellation
    pub parent_pid: Option<i32>,
}

impl WorkerArgs {
    fn to_command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("worker")
            .arg("--buffer")
            .arg(&self.buffer)
            .arg("--device")
            .arg(self.device.to_string())
            .arg("--width")
            .arg(self.shape.width.to_string())
            .arg("--height")
            .arg(self.shape.height.to_string())
            .arg("--channels")
            .arg(self.shape.channels.to_string());
        if let Some(pid) = self.parent_pid {
            cmd.arg("--parent-pid").arg(pid.to_string());
        }
        for (property, value) in self.properties.iter() {
            cmd.arg("--prop").arg(format!("{}={}", property, value));
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Parse a `key=value` property argument.
pub fn parse_property(arg: &str) -> std::result::Result<(Property, f64), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", arg))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value for {}: {}", key, e))?;
    match key.trim().parse::<Property>() {
        Ok(property) => Ok((property, value)),
        Err(never) => match never {},
    }
}

struct SharedSink {
    buffer: SharedFrameBuffer,
    parent: Option<Pid>,
}

impl FrameSink for SharedSink {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        self.buffer.publish(&frame.data, frame.sequence())
    }

    fn is_cancelled(&self) -> bool {
        if self.parent.is_some_and(|parent| getppid() != parent) {
            warn!("Parent process went away, stopping");
            return true;
        }
        self.buffer.signals().map_or(true, |s| s.is_cancelled())
    }

    fn report(&mut self, state: WorkerState) {
        if let Ok(signals) = self.buffer.signals() {
            signals.set_state(state);
        }
    }
}

/// Body of `framegrab worker`: attach to the session's buffer and capture until cancelled.
#[instrument(skip_all, fields(buffer = %args.buffer, device = %args.device))]
pub fn run_worker_process(args: WorkerArgs) -> Result<()> {
    // Ctrl-C belongs to the owning session, which cancels us through the buffer
    // SAFETY: installs SIG_IGN, no handler code runs.
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) } {
        warn!("Could not ignore SIGINT: {}", e);
    }

    let buffer = SharedFrameBuffer::attach(&args.buffer, args.shape)?;
    buffer.signals()?.set_worker_pid(std::process::id());

    let mut sink = SharedSink {
        buffer,
        parent: args.parent_pid.map(Pid::from_raw),
    };
    Worker::new(args.device, args.properties, args.shape).run(&SystemDevices, &mut sink)
}

pub(crate) struct ProcessBackend {
    buffer: SharedFrameBuffer,
    child: Mutex<Option<Child>>,
    stop_timeout: Duration,
}

impl ProcessBackend {
    /// Create the region, spawn `<program> worker ...`, wait until it runs.
    pub(crate) fn start(
        program: &Path,
        buffer_name: &str,
        worker: WorkerArgs,
        open_timeout: Duration,
    ) -> Result<Self> {
        let buffer = SharedFrameBuffer::create(buffer_name, worker.shape)?;
        let args = WorkerArgs {
            buffer: buffer.name().to_string(),
            ..worker
        };

        let child = args.to_command(program).spawn().map_err(|e| {
            CaptureError::unavailable(
                &args.device,
                format!("cannot spawn worker {}: {}", program.display(), e),
            )
        })?;
        info!("Spawned worker process {} for {}", child.id(), args.device);

        let mut backend = Self {
            buffer,
            child: Mutex::new(Some(child)),
            stop_timeout: open_timeout,
        };
        if let Err(e) = backend.await_running(&args.device, open_timeout) {
            backend.shutdown();
            return Err(e);
        }
        Ok(backend)
    }

    fn await_running(&self, device: &DeviceId, timeout: Duration) -> Result<()> {
        let signals = self.buffer.signals()?;
        let deadline = Instant::now() + timeout;
        loop {
            match signals.state() {
                WorkerState::Running => return Ok(()),
                WorkerState::Failed => {
                    return Err(CaptureError::unavailable(device, "worker failed to open"))
                }
                _ => {}
            }
            if let Some(status) = self.exit_status() {
                return Err(CaptureError::unavailable(
                    device,
                    format!("worker exited while opening ({})", status),
                ));
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::unavailable(
                    device,
                    format!("worker not running after {:?}", timeout),
                ));
            }
            thread::sleep(POLL);
        }
    }

    /// Exit status if the child has terminated (reaping it)
    fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut()?.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Cannot poll worker process: {}", e);
                None
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.exit_status() {
            None if self.child_present() => Ok(()),
            None => Err(CaptureError::WorkerUnavailable("worker was stopped".into())),
            Some(status) => Err(CaptureError::WorkerUnavailable(format!(
                "worker process exited ({})",
                status
            ))),
        }
    }

    fn child_present(&self) -> bool {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Backend for ProcessBackend {
    fn read_frame(&self) -> Result<Option<FrameCopy>> {
        self.ensure_alive()?;
        self.buffer.read()
    }

    fn wait_frame(&self, timeout: Duration) -> Result<FrameCopy> {
        self.buffer.wait(timeout, || self.ensure_alive().is_ok())
    }

    fn is_alive(&self) -> bool {
        self.ensure_alive().is_ok()
    }

    fn buffer_name(&self) -> Option<&str> {
        Some(self.buffer.name())
    }

    fn shutdown(&mut self) {
        if let Ok(signals) = self.buffer.signals() {
            signals.cancel();
        }

        let child = self
            .child
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            let deadline = Instant::now() + self.stop_timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("Worker process exited: {}", status);
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(POLL),
                    Ok(None) => {
                        error!("Worker process ignored cancel, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Err(e) => {
                        error!("Cannot wait for worker process: {}", e);
                        let _ = child.kill();
                        break;
                    }
                }
            }
        }

        self.buffer.release();
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if !self.buffer.is_released() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("width=640").unwrap(), (Property::Width, 640.0));
        assert_eq!(
            parse_property("exposure = 1.5").unwrap(),
            (Property::Other("exposure".into()), 1.5)
        );
        assert!(parse_property("width").is_err());
        assert!(parse_property("width=wide").is_err());
    }

    #[test]
    fn test_worker_command_line() {
        let args = WorkerArgs {
            buffer: "/framegrab-1-0".into(),
            device: DeviceId::from("pattern:cli"),
            shape: FrameShape::bgr(640, 480),
            properties: CaptureProperties::new(640, 480, 15.0),
            parent_pid: Some(42),
        };
        let cmd = args.to_command(Path::new("/usr/bin/framegrab"));
        let argv: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv[0], "worker");
        assert!(argv.windows(2).any(|w| w == ["--device", "pattern:cli"]));
        assert!(argv.windows(2).any(|w| w == ["--parent-pid", "42"]));
        assert!(argv.windows(2).any(|w| w == ["--prop", "target_fps=15"]));
        assert!(argv.windows(2).any(|w| w == ["--width", "640"]));
    }
}

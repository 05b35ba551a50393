//! Session streaming through a worker process and named shared memory

use std::path::PathBuf;
use std::time::Duration;

use std::thread;
use std::time::Instant;

use framegrab::capture::PatternDevice;
use framegrab::{
    AttachFailure, CaptureError, CaptureProperties, CaptureSession, DeviceId, FrameReader,
    FrameShape, PipelineConfig, Property, SharedFrameBuffer, Transport,
};
use nix::sys::signal::{kill, Signal};

const SHAPE: FrameShape = FrameShape::bgr(320, 240);

fn config(buffer_name: Option<&str>) -> PipelineConfig {
    PipelineConfig {
        transport: Transport::SharedMemory,
        buffer_name: buffer_name.map(str::to_string),
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_framegrab"))),
        open_timeout_ms: 10_000,
        read_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn properties() -> CaptureProperties {
    CaptureProperties::new(SHAPE.width, SHAPE.height, 60.0)
}

fn is_not_found(err: &CaptureError) -> bool {
    matches!(
        err,
        CaptureError::BufferAttach {
            kind: AttachFailure::NotFound,
            ..
        }
    )
}

#[test]
fn test_worker_process_publishes_pattern() {
    let mut session = CaptureSession::new(config(None));
    session
        .open(DeviceId::from("pattern:shm-publish"), properties())
        .unwrap();
    assert!(session.is_opened());
    assert!(session.worker_alive());

    let frame = session.wait_frame().unwrap();
    assert_eq!(frame.shape(), SHAPE);
    assert_eq!(
        frame.pixel(5, 7).unwrap(),
        &PatternDevice::pixel(SHAPE, frame.sequence(), 5, 7)[..]
    );
    session.close();
}

#[test]
fn test_reader_attaches_by_name() {
    let name = format!("/framegrab-test-reader-{}", std::process::id());
    let mut session = CaptureSession::new(config(Some(&name)));
    session
        .open(DeviceId::from("pattern:shm-reader"), properties())
        .unwrap();
    assert_eq!(session.buffer_name(), Some(name.as_str()));

    let reader = FrameReader::attach(&name, SHAPE)
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    assert!(reader.worker_alive());
    let frame = reader.wait().unwrap();
    assert_eq!(frame.shape(), SHAPE);

    // The wrong shape is refused
    assert!(FrameReader::attach(&name, FrameShape::bgr(640, 480)).is_err());

    session.close();
    assert!(!reader.worker_alive());
    let err = FrameReader::attach(&name, SHAPE).err().unwrap();
    assert!(is_not_found(&err));
}

#[test]
fn test_close_unlinks_and_reopen_works() {
    let mut session = CaptureSession::new(config(None));
    let id = DeviceId::from("pattern:shm-reopen");

    session.open(id.clone(), properties()).unwrap();
    session.wait_frame().unwrap();
    let first = session.buffer_name().unwrap().to_string();
    session.close();

    assert!(session.buffer_name().is_none());
    assert!(matches!(
        session.read_frame(),
        Err(CaptureError::AlreadyReleased)
    ));
    assert!(is_not_found(&FrameReader::attach(&first, SHAPE).err().unwrap()));

    session.open(id, properties()).unwrap();
    assert_eq!(session.wait_frame().unwrap().shape(), SHAPE);
    session.close();
}

#[test]
fn test_set_restarts_worker_with_new_shape() {
    let mut session = CaptureSession::new(config(None));
    session
        .open(DeviceId::from("pattern:shm-set"), properties())
        .unwrap();
    let old = session.wait_frame().unwrap();

    assert!(session.set(Property::Height, 120.0).unwrap());
    let frame = session.wait_frame().unwrap();
    assert_eq!(frame.shape(), FrameShape::bgr(320, 120));
    assert_eq!(old.shape(), SHAPE);
    session.close();
}

#[test]
fn test_killed_worker_is_reported_by_every_read() {
    let mut session = CaptureSession::new(config(None));
    session
        .open(DeviceId::from("pattern:shm-killed"), properties())
        .unwrap();
    session.wait_frame().unwrap();
    let name = session.buffer_name().unwrap().to_string();

    let reader = FrameReader::attach(&name, SHAPE)
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    let pid = SharedFrameBuffer::attach(&name, SHAPE)
        .unwrap()
        .signals()
        .unwrap()
        .worker_pid()
        .unwrap();
    kill(pid, Signal::SIGKILL).unwrap();

    // The session reaps the child on its next read
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.worker_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!session.worker_alive());

    assert!(matches!(
        session.read_frame(),
        Err(CaptureError::WorkerUnavailable(_))
    ));
    assert!(matches!(
        session.wait_frame(),
        Err(CaptureError::WorkerUnavailable(_))
    ));
    // The stale frame is still in the region, but waiting must not serve it
    assert!(reader.read().unwrap().is_some());
    assert!(matches!(
        reader.wait(),
        Err(CaptureError::WorkerUnavailable(_))
    ));

    session.close();
}

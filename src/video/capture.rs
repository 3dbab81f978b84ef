//! Capture source: owns the single live camera stream
//!
//! Acquisition and frame reads run in a blocking worker. Every `open`/`close`
//! bumps a generation number; a worker whose generation is stale drops its
//! stream and exits without touching shared state.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{is_device_lost_error, CameraBackend, CameraStream};
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Default number of capture buffers
const DEFAULT_BUFFER_COUNT: u32 = 2;
/// Default blocking read timeout
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Default acquisition timeout
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum valid frame size (bytes)
const MIN_FRAME_SIZE: usize = 128;
/// Busy-device retry policy
const MAX_OPEN_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Receiver for the newest captured frame
pub type FrameReceiver = watch::Receiver<Option<VideoFrame>>;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Desired resolution
    pub resolution: Resolution,
    /// Desired pixel format
    pub format: PixelFormat,
    /// Desired frame rate (0 = driver default)
    pub fps: u32,
    /// Number of capture buffers
    pub buffer_count: u32,
    /// Blocking read timeout per frame
    pub read_timeout: Duration,
    /// Upper bound on acquisition; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::VGA,
            format: PixelFormat::Mjpeg,
            fps: 15,
            buffer_count: DEFAULT_BUFFER_COUNT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }
}

impl CaptureConfig {
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Capture source state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No stream
    Idle,
    /// Waiting for the device
    Acquiring,
    /// Frames are flowing
    Streaming,
    /// Acquisition failed
    Failed,
    /// Device disappeared while streaming
    DeviceLost,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Acquiring => "acquiring",
            CaptureState::Streaming => "streaming",
            CaptureState::Failed => "failed",
            CaptureState::DeviceLost => "device_lost",
        }
    }
}

/// State shared between the source and its worker
struct Shared {
    backend: Arc<dyn CameraBackend>,
    config: CaptureConfig,
    events: Arc<EventBus>,
    /// Current generation; transitions are applied under this lock
    generation: Mutex<u64>,
    /// Mirror of `generation` for waiters
    latest: watch::Sender<u64>,
    state: watch::Sender<CaptureState>,
    frames: watch::Sender<Option<VideoFrame>>,
    device: RwLock<Option<String>>,
    last_error: RwLock<Option<(String, String)>>,
}

impl Shared {
    /// Invalidate every earlier open and return the new generation
    fn next_generation(&self) -> u64 {
        let mut current = self.generation.lock();
        *current += 1;
        self.latest.send_replace(*current);
        *current
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.lock() == generation
    }

    /// Run `f` only if `generation` is still current
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let current = self.generation.lock();
        if *current != generation {
            return None;
        }
        Some(f())
    }

    /// Give up on `generation` after a timeout. False if it was already superseded.
    fn expire(&self, generation: u64, device: &str, reason: String) -> bool {
        let mut current = self.generation.lock();
        if *current != generation {
            return false;
        }
        *current += 1;
        self.latest.send_replace(*current);
        self.fail(CaptureState::Failed, device, reason);
        true
    }

    fn set_state(&self, state: CaptureState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == state {
                false
            } else {
                *s = state;
                true
            }
        });
        if changed {
            debug!("Capture state -> {}", state.as_str());
            self.events.publish(ClientEvent::CaptureStateChanged {
                device: self.device.read().clone(),
                state: state.as_str().to_string(),
            });
        }
    }

    fn fail(&self, state: CaptureState, device: &str, reason: String) {
        *self.last_error.write() = Some((device.to_string(), reason.clone()));
        self.frames.send_replace(None);
        self.set_state(state);
        self.events.publish(ClientEvent::CaptureFailed {
            device: device.to_string(),
            reason,
        });
    }
}

/// The single active camera stream of a client
pub struct CaptureSource {
    shared: Arc<Shared>,
    /// Worker of the latest generation
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CaptureConfig, events: Arc<EventBus>) -> Self {
        let (latest, _) = watch::channel(0);
        let (state, _) = watch::channel(CaptureState::Idle);
        let (frames, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                events,
                generation: Mutex::new(0),
                latest,
                state,
                frames,
                device: RwLock::new(None),
                last_error: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to the newest-frame channel
    pub fn subscribe_frames(&self) -> FrameReceiver {
        self.shared.frames.subscribe()
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.shared.frames.borrow().clone()
    }

    /// Device the current (or last attempted) stream is bound to
    pub fn device(&self) -> Option<String> {
        self.shared.device.read().clone()
    }

    /// Last failure as (device, reason)
    pub fn last_error(&self) -> Option<(String, String)> {
        self.shared.last_error.read().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == CaptureState::Streaming
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.shared.config
    }

    /// Acquire a stream on `device_id`, replacing any current stream.
    ///
    /// Returns once the stream is producing or acquisition failed. A later
    /// `open` or `close` supersedes a pending acquisition at once: this call
    /// then returns `Cancelled` and the late stream is dropped unused.
    /// Failures are also reflected in the state and published as
    /// `capture.failed`.
    pub async fn open(&self, device_id: &str) -> Result<()> {
        let generation = self.shared.next_generation();
        let cancelled = || AppError::Cancelled(format!("acquisition of {} superseded", device_id));

        let previous = self.worker.lock().take();
        self.release(previous).await;

        let claimed = self.shared.if_current(generation, || {
            info!("Acquiring camera {}", device_id);
            *self.shared.device.write() = Some(device_id.to_string());
            *self.shared.last_error.write() = None;
            self.shared.set_state(CaptureState::Acquiring);
        });
        if claimed.is_none() {
            return Err(cancelled());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let device = device_id.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            capture_worker(shared, generation, device, ready_tx);
        });
        // A superseded worker is left detached; it exits on its own
        self.shared.if_current(generation, || {
            *self.worker.lock() = Some(handle);
        });

        let mut latest = self.shared.latest.subscribe();
        let wait = async {
            tokio::select! {
                outcome = ready_rx => Some(outcome),
                _ = latest.wait_for(|g| *g != generation) => None,
            }
        };

        let outcome = match self.shared.config.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let reason = format!("acquisition timed out after {:?}", limit);
                    // The worker sees a stale generation and drops whatever it acquires
                    if !self.shared.expire(generation, device_id, reason.clone()) {
                        return Err(cancelled());
                    }
                    warn!("Camera {}: {}", device_id, reason);
                    return Err(AppError::Timeout(format!("camera {}: {}", device_id, reason)));
                }
            },
            None => wait.await,
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) if self.shared.is_current(generation) => Err(AppError::CaptureError(
                format!("capture worker for {} exited before reporting", device_id),
            )),
            _ => {
                debug!("Acquisition of {} superseded", device_id);
                Err(cancelled())
            }
        }
    }

    /// Release the current stream. Idempotent; never waits for a pending
    /// acquisition.
    pub async fn close(&self) {
        let generation = self.shared.next_generation();

        let previous = self.worker.lock().take();
        let had_worker = previous.is_some();
        self.release(previous).await;

        self.shared.if_current(generation, || {
            self.shared.frames.send_replace(None);
            self.shared.set_state(CaptureState::Idle);
        });
        if had_worker {
            info!("Camera released");
        }
    }

    /// Stop an invalidated worker. A streaming worker is joined so the
    /// hardware is free before the caller continues; one still blocked in
    /// acquisition is detached.
    async fn release(&self, handle: Option<JoinHandle<()>>) {
        let Some(handle) = handle else {
            return;
        };
        if self.state() == CaptureState::Streaming {
            if let Err(e) = handle.await {
                error!("Capture worker panicked: {}", e);
            }
        } else {
            debug!("Detaching capture worker still in acquisition");
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.shared.next_generation();
    }
}

/// Blocking worker: acquire, report readiness, then pump frames until stale
fn capture_worker(
    shared: Arc<Shared>,
    generation: u64,
    device_id: String,
    ready: oneshot::Sender<Result<()>>,
) {
    let stream = match acquire(&shared, generation, &device_id) {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            debug!("Discarding stale acquisition of {}", device_id);
            return;
        }
        Err(e) => {
            let reported = shared.if_current(generation, || {
                error!("Failed to acquire camera {}: {}", device_id, e);
                shared.fail(CaptureState::Failed, &device_id, e.to_string());
            });
            if reported.is_some() {
                let _ = ready.send(Err(e));
            }
            return;
        }
    };

    let started = shared.if_current(generation, || shared.set_state(CaptureState::Streaming));
    if started.is_none() {
        debug!("Discarding stale stream on {}", device_id);
        return;
    }
    info!(
        "Camera {} streaming at {} {}",
        device_id,
        stream.resolution(),
        stream.format()
    );
    let _ = ready.send(Ok(()));

    pump_frames(&shared, generation, &device_id, stream);
}

/// Open the device, retrying while it is busy. `Ok(None)` means the
/// generation went stale and nothing is held.
fn acquire(
    shared: &Shared,
    generation: u64,
    device_id: &str,
) -> Result<Option<Box<dyn CameraStream>>> {
    let mut last_error = None;

    for attempt in 0..MAX_OPEN_RETRIES {
        if shared.if_current(generation, || ()).is_none() {
            return Ok(None);
        }

        match shared.backend.open(device_id, &shared.config) {
            Ok(stream) => {
                if shared.if_current(generation, || ()).is_none() {
                    drop(stream);
                    return Ok(None);
                }
                return Ok(Some(stream));
            }
            Err(AppError::DeviceBusy(device)) => {
                warn!(
                    "Device busy on attempt {}/{}, retrying in {}ms...",
                    attempt + 1,
                    MAX_OPEN_RETRIES,
                    RETRY_DELAY.as_millis()
                );
                last_error = Some(AppError::DeviceBusy(device));
                std::thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| AppError::DeviceBusy(device_id.to_string())))
}

fn pump_frames(
    shared: &Shared,
    generation: u64,
    device_id: &str,
    mut stream: Box<dyn CameraStream>,
) {
    let throttler = LogThrottler::with_secs(5);
    let mut failing = false;

    loop {
        let frame = match stream.next_frame() {
            Ok(frame) => {
                if failing {
                    info!("Capture on {} recovered", device_id);
                    throttler.clear_all();
                    failing = false;
                }
                frame
            }
            Err(e) => {
                if is_device_lost_error(&e) {
                    drop(stream);
                    shared.if_current(generation, || {
                        error!("Video device lost: {} - {}", device_id, e);
                        shared.fail(CaptureState::DeviceLost, device_id, e.to_string());
                    });
                    return;
                }
                if shared.if_current(generation, || ()).is_none() {
                    break;
                }
                failing = true;
                if e.kind() == io::ErrorKind::TimedOut {
                    warn_throttled!(throttler, "capture_timeout", "Capture timeout on {} - no signal?", device_id);
                } else {
                    error_throttled!(throttler, "capture_error", "Capture error on {}: {}", device_id, e);
                }
                continue;
            }
        };

        if frame.len() < MIN_FRAME_SIZE {
            debug!("Dropping small frame: {} bytes", frame.len());
            continue;
        }

        let published = shared.if_current(generation, || {
            shared.frames.send_replace(Some(frame));
        });
        if published.is_none() {
            break;
        }
    }

    drop(stream);
    debug!("Capture worker for {} exited", device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::synthetic::SyntheticBackend;
    use crate::video::VideoDevice;

    fn source(backend: &SyntheticBackend, config: CaptureConfig) -> (CaptureSource, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let source = CaptureSource::new(Arc::new(backend.clone()), config, events.clone());
        (source, events)
    }

    async fn wait_for_frame(frames: &mut FrameReceiver) -> VideoFrame {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frame) = frames.borrow_and_update().clone() {
                    return frame;
                }
                frames.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_streams_frames() {
        let backend = SyntheticBackend::single();
        let (source, _events) = source(&backend, CaptureConfig::default());

        source.open("synthetic0").await.unwrap();
        assert_eq!(source.state(), CaptureState::Streaming);
        assert_eq!(source.device().as_deref(), Some("synthetic0"));

        let mut frames = source.subscribe_frames();
        let frame = wait_for_frame(&mut frames).await;
        assert_eq!(frame.format, PixelFormat::Rgb24);

        source.close().await;
        assert_eq!(source.state(), CaptureState::Idle);
        assert!(source.latest_frame().is_none());
        assert_eq!(backend.active_streams(), 0);

        source.close().await;
        assert_eq!(source.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_reopen_releases_previous_stream() {
        let backend = SyntheticBackend::new(vec![
            VideoDevice::new("cam0", "Front"),
            VideoDevice::new("cam1", "Back"),
        ]);
        let (source, _events) = source(&backend, CaptureConfig::default());

        source.open("cam0").await.unwrap();
        source.open("cam1").await.unwrap();
        assert_eq!(backend.active_streams(), 1);
        assert_eq!(backend.open_count(), 2);
        assert_eq!(source.device().as_deref(), Some("cam1"));

        source.close().await;
        assert_eq!(backend.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_busy_device_fails_after_retries() {
        let backend = SyntheticBackend::single();
        backend.set_busy("synthetic0", true);
        let (source, events) = source(&backend, CaptureConfig::default());
        let mut rx = events.subscribe();

        let err = source.open("synthetic0").await.unwrap_err();
        assert!(matches!(err, AppError::DeviceBusy(_)));
        assert_eq!(source.state(), CaptureState::Failed);
        assert!(source.last_error().is_some());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ClientEvent::CaptureFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_missing_device_fails() {
        let backend = SyntheticBackend::single();
        let (source, _events) = source(&backend, CaptureConfig::default());
        let err = source.open("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(source.state(), CaptureState::Failed);
    }

    #[tokio::test]
    async fn test_acquire_timeout_discards_late_stream() {
        let backend = SyntheticBackend::single();
        backend.set_open_delay(Duration::from_millis(300));
        let config = CaptureConfig::default().with_acquire_timeout(Some(Duration::from_millis(50)));
        let (source, _events) = source(&backend, config);

        let err = source.open("synthetic0").await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(source.state(), CaptureState::Failed);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.active_streams(), 0);
        assert_eq!(source.state(), CaptureState::Failed);
        assert!(source.latest_frame().is_none());
    }

    #[tokio::test]
    async fn test_newer_open_supersedes_pending_acquisition() {
        let backend = SyntheticBackend::new(vec![
            VideoDevice::new("cam0", "Front"),
            VideoDevice::new("cam1", "Back"),
        ]);
        backend.set_device_open_delay("cam0", Duration::from_millis(1500));
        let config = CaptureConfig::default().with_acquire_timeout(None);
        let (source, events) = source(&backend, config);
        let source = Arc::new(source);
        let mut rx = events.subscribe();

        let slow = tokio::spawn({
            let source = source.clone();
            async move { source.open("cam0").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        source.open("cam1").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(slow.await.unwrap(), Err(AppError::Cancelled(_))));

        // Let the stale acquisition of cam0 complete and be discarded
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(source.state(), CaptureState::Streaming);
        assert_eq!(source.device().as_deref(), Some("cam1"));
        assert_eq!(backend.active_streams(), 1);

        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::CaptureStateChanged { device, state } = event {
                assert!(
                    !(device.as_deref() == Some("cam0") && state == "streaming"),
                    "superseded device reached streaming"
                );
            }
        }

        source.close().await;
        assert_eq!(backend.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_acquisition() {
        let backend = SyntheticBackend::single();
        backend.set_open_delay(Duration::from_millis(1500));
        let config = CaptureConfig::default().with_acquire_timeout(None);
        let (source, _events) = source(&backend, config);
        let source = Arc::new(source);

        let pending = tokio::spawn({
            let source = source.clone();
            async move { source.open("synthetic0").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_millis(500), source.close())
            .await
            .unwrap();
        assert_eq!(source.state(), CaptureState::Idle);
        assert!(matches!(pending.await.unwrap(), Err(AppError::Cancelled(_))));

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(source.state(), CaptureState::Idle);
        assert_eq!(backend.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_unplug_moves_to_device_lost() {
        let backend = SyntheticBackend::single();
        let (source, _events) = source(&backend, CaptureConfig::default());
        source.open("synthetic0").await.unwrap();

        let mut state = source.state_watch();
        backend.set_devices(vec![]);
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == CaptureState::DeviceLost),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(source.latest_frame().is_none());
        assert_eq!(backend.active_streams(), 0);
    }
}

//! Frame sampler: fixed-cadence frame encoding into a [`FrameSink`]
//!
//! The sampler reads only the newest-frame channel of the capture source and
//! never touches the camera or the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::utils::LogThrottler;
use crate::video::capture::FrameReceiver;
use crate::video::encoder::{EncodedFrame, JpegEncoder, DEFAULT_JPEG_QUALITY};
use crate::warn_throttled;

/// Destination for encoded frames
pub trait FrameSink: Send + Sync {
    /// Hand over one frame without blocking. Returns false if the frame was
    /// dropped.
    fn send_frame(&self, frame: EncodedFrame) -> bool;
}

/// Sampler configuration
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Tick period
    pub interval: Duration,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Rotate frames by 180° before encoding
    pub rotate_180: bool,
    /// Frames older than this are not sent
    pub max_frame_age: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            rotate_180: true,
            max_frame_age: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct SamplerCounters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    ticks_skipped: AtomicU64,
}

/// Sampler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Frames accepted by the sink
    pub frames_emitted: u64,
    /// Frames rejected by the sink
    pub frames_dropped: u64,
    /// Ticks with no usable frame (none, stale or failed to encode)
    pub ticks_skipped: u64,
}

struct ActiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-rate frame sampler; at most one loop runs at a time
pub struct FrameSampler {
    config: SamplerConfig,
    counters: Arc<SamplerCounters>,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
}

impl FrameSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            counters: Arc::new(SamplerCounters::default()),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Start emitting frames to `sink`, replacing any running loop.
    ///
    /// The first frame goes out one full interval after this call.
    pub async fn start(&self, frames: FrameReceiver, sink: Arc<dyn FrameSink>) -> Result<()> {
        let encoder = JpegEncoder::new(self.config.jpeg_quality, self.config.rotate_180)?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Replacing running sampler loop");
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sample_loop(
            self.config.clone(),
            encoder,
            frames,
            sink,
            self.counters.clone(),
            cancel.clone(),
        ));
        *active = Some(ActiveLoop { cancel, handle });

        info!("Frame sampler started ({:?} interval)", self.config.interval);
        Ok(())
    }

    /// Stop the loop. No frame reaches the sink after this returns.
    /// Idempotent.
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.handle.await;
            info!("Frame sampler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| !a.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            frames_emitted: self.counters.emitted.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
        }
    }
}

async fn sample_loop(
    config: SamplerConfig,
    mut encoder: JpegEncoder,
    frames: FrameReceiver,
    sink: Arc<dyn FrameSink>,
    counters: Arc<SamplerCounters>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let throttler = LogThrottler::with_secs(5);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = frames.borrow().clone();
        let Some(frame) = frame else {
            counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        if !frame.is_fresh(config.max_frame_age) {
            counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            warn_throttled!(throttler, "stale_frame", "Skipping stale frame ({:?} old)", frame.age());
            continue;
        }

        // Decode, rotate and compress off the async workers
        let sequence = frame.sequence;
        let job = tokio::task::spawn_blocking(move || {
            let encoded = encoder.encode(&frame);
            (encoder, encoded)
        });
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            joined = job => joined,
        };
        let encoded = match joined {
            Ok((returned, encoded)) => {
                encoder = returned;
                encoded
            }
            Err(e) => {
                error!("Encoder task failed: {}", e);
                break;
            }
        };

        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(throttler, "encode", "Frame encode failed: {}", e);
                continue;
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        if sink.send_frame(encoded) {
            counters.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Sink dropped frame {}", sequence);
        }
    }

    debug!("Sampler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::frame::VideoFrame;
    use parking_lot::Mutex;
    use tokio::sync::watch;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<EncodedFrame>>,
        reject: bool,
    }

    impl FrameSink for CollectingSink {
        fn send_frame(&self, frame: EncodedFrame) -> bool {
            if self.reject {
                return false;
            }
            self.frames.lock().push(frame);
            true
        }
    }

    impl CollectingSink {
        fn count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    fn test_frame(sequence: u64) -> VideoFrame {
        let res = Resolution::new(16, 16);
        VideoFrame::from_vec(vec![128u8; 16 * 16 * 3], res, PixelFormat::Rgb24, 48, sequence)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    /// Encoding runs on the blocking pool; give it real time to finish
    /// without letting the paused clock move.
    async fn wait_for_count(sink: &CollectingSink, expected: usize) {
        for _ in 0..2000 {
            if sink.count() >= expected {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            tokio::task::yield_now().await;
        }
        settle().await;
    }

    fn setup() -> (FrameSampler, watch::Sender<Option<VideoFrame>>, Arc<CollectingSink>) {
        let (tx, _) = watch::channel(Some(test_frame(1)));
        (
            FrameSampler::new(SamplerConfig::default()),
            tx,
            Arc::new(CollectingSink::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_frame_after_one_interval() {
        let (sampler, tx, sink) = setup();
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        tokio::time::advance(Duration::from_millis(499)).await;
        settle().await;
        assert_eq!(sink.count(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        wait_for_count(&sink, 1).await;
        assert_eq!(sink.count(), 1);

        let frame = &sink.frames.lock()[0];
        assert!(frame.data_url.starts_with("data:image/jpeg;base64,"));
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_emits_nothing() {
        let (sampler, tx, sink) = setup();
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        sampler.stop().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.count(), 0);
        assert!(!sampler.is_running().await);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_cadence() {
        let (sampler, tx, sink) = setup();
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2250)).await;
        assert_eq!(sink.count(), 4);
        assert_eq!(sampler.stats().frames_emitted, 4);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ticks_not_bursted() {
        let (sampler, tx, sink) = setup();
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        tokio::time::advance(Duration::from_millis(1600)).await;
        wait_for_count(&sink, 1).await;
        std::thread::sleep(Duration::from_millis(50));
        settle().await;
        assert_eq!(sink.count(), 1);

        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frame_skips_tick() {
        let (sampler, tx, sink) = setup();
        tx.send_replace(None);
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(sampler.stats().ticks_skipped, 2);

        tx.send_replace(Some(test_frame(9)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.frames.lock()[0].sequence, 9);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_frames_counted() {
        let (sampler, tx, _) = setup();
        let sink = Arc::new(CollectingSink {
            reject: true,
            ..Default::default()
        });
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let stats = sampler.stats();
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.frames_emitted, 0);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_loop() {
        let (sampler, tx, sink) = setup();
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        sampler.start(tx.subscribe(), sink.clone()).await.unwrap();

        // Old loop would have fired at 500ms; the new one fires at 800ms
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.count(), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.count(), 1);
        sampler.stop().await;
    }
}

//! The client session object
//!
//! Owns every component and is the only place that sequences them. The
//! presentation layer talks to [`Client`] alone: it reads [`SessionState`]
//! and calls the intents `start`, `reset`, `restart`, `select_device` and
//! `dismiss_notification`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::session::{Meter, Reconciler, SessionPhase, SessionState};
use crate::stream::{CaptureMode, FrameSampler, SamplerStats, SocketSession};
use crate::video::{CameraBackend, CaptureSource, CaptureState, DeviceRegistry, VideoDevice};

pub struct Client {
    config: ClientConfig,
    events: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    capture: Arc<CaptureSource>,
    sampler: Arc<FrameSampler>,
    reconciler: Arc<Reconciler>,
    transport: SocketSession,
    shut_down: AtomicBool,
}

impl Client {
    /// Build a client from a validated configuration
    pub fn new(config: ClientConfig, backend: Arc<dyn CameraBackend>) -> Result<Arc<Self>> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new(backend.clone(), events.clone()));
        let capture = Arc::new(CaptureSource::new(
            backend,
            config.capture_config()?,
            events.clone(),
        ));
        let sampler = Arc::new(FrameSampler::new(config.sampler_config()));
        let reconciler = Arc::new(Reconciler::new(events.clone()));
        let transport = SocketSession::new(
            config.transport_config(),
            sampler.clone(),
            reconciler.clone(),
        );

        Ok(Arc::new(Self {
            config,
            events,
            registry,
            capture,
            sampler,
            reconciler,
            transport,
            shut_down: AtomicBool::new(false),
        }))
    }

    fn local_capture(&self) -> bool {
        self.config.transport.mode == CaptureMode::Local
    }

    /// Discover devices, open the preferred camera and start hot-plug
    /// tracking. Camera problems are reported through state and events,
    /// never as an error.
    pub async fn init(self: &Arc<Self>) {
        let devices = self
            .registry
            .list_devices(self.config.devices.probe_labels)
            .await;
        info!("Found {} video device(s)", devices.len());

        if let Some(preferred) = &self.config.capture.device {
            if let Err(e) = self.registry.select(preferred) {
                warn!("Configured device unavailable, using default: {}", e);
            }
        }

        if self.local_capture() {
            self.open_selected().await;
        }

        let client = Arc::downgrade(self);
        self.registry.on_device_change(move |devices| {
            let Some(client) = client.upgrade() else {
                return;
            };
            let devices = devices.to_vec();
            tokio::spawn(async move {
                client.on_devices_changed(devices).await;
            });
        });

        if let Some(interval) = self.config.hotplug_interval() {
            self.registry.start_watching(interval);
        }
    }

    /// Reopen capture after a hot-plug change if nothing is streaming
    async fn on_devices_changed(&self, devices: Vec<VideoDevice>) {
        if self.shut_down.load(Ordering::SeqCst) || !self.local_capture() {
            return;
        }
        if matches!(
            self.capture.state(),
            CaptureState::Streaming | CaptureState::Acquiring
        ) {
            return;
        }
        let Some(selected) = self.registry.selected() else {
            return;
        };
        if devices.iter().any(|d| d.id == selected) {
            info!("Device {} available, opening", selected);
            self.open_selected().await;
        }
    }

    async fn open_selected(&self) {
        let Some(device_id) = self.registry.selected() else {
            warn!("No video device available");
            return;
        };
        match self.capture.open(&device_id).await {
            Ok(()) => {}
            Err(AppError::Cancelled(_)) => debug!("Opening {} superseded", device_id),
            Err(e) => warn!("Camera {} unavailable: {}", device_id, e),
        }
    }

    /// Begin a new socket session (closing any previous one). Returns the
    /// session id.
    pub async fn start(&self) -> String {
        let frames = if self.local_capture() {
            if !self.capture.is_streaming() {
                if self.registry.selected().is_none() {
                    self.registry.list_devices(false).await;
                }
                self.open_selected().await;
            }
            Some(self.capture.subscribe_frames())
        } else {
            None
        };

        self.transport.start(frames).await
    }

    /// Stop sampling, close the socket and clear the counters. Does not
    /// reconnect.
    pub async fn reset(&self) {
        self.sampler.stop().await;
        self.transport.close().await;
        self.reconciler.reset();
    }

    /// `reset` followed by `start`
    pub async fn restart(&self) -> String {
        self.reset().await;
        self.start().await
    }

    /// Switch cameras. A running session keeps sending, now from the new
    /// device.
    pub async fn select_device(&self, device_id: &str) -> Result<()> {
        self.registry.select(device_id)?;
        if self.local_capture() {
            self.capture.open(device_id).await?;
        }
        Ok(())
    }

    pub fn dismiss_notification(&self) {
        self.reconciler.dismiss_notification();
    }

    /// Re-enumerate devices, optionally probing labels
    pub async fn refresh_devices(&self, probe_labels: bool) -> Vec<VideoDevice> {
        self.registry.list_devices(probe_labels).await
    }

    pub fn devices(&self) -> Vec<VideoDevice> {
        self.registry.devices()
    }

    pub fn selected_device(&self) -> Option<String> {
        self.registry.selected()
    }

    pub fn state(&self) -> SessionState {
        self.reconciler.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.reconciler.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn meters(&self) -> Vec<Meter> {
        self.reconciler.meters()
    }

    pub fn phase(&self) -> SessionPhase {
        self.transport.phase()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn sampler_stats(&self) -> SamplerStats {
        self.sampler.stats()
    }

    /// Frames dropped by the current session's outbound queue
    pub fn dropped_frames(&self) -> u64 {
        self.transport.dropped_frames()
    }

    /// Frames queued on the current session's socket
    pub fn sent_frames(&self) -> u64 {
        self.transport.sent_frames()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stop sampler, close socket, release camera, stop hot-plug
    /// tracking. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down client");
        self.sampler.stop().await;
        self.transport.close().await;
        self.capture.close().await;
        self.registry.stop_watching().await;
        info!("Client stopped");
    }
}

//! Device registry: enumeration, hot-plug tracking and selection

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{CameraBackend, VideoDevice};
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};

/// Callback invoked with the new device list after a hot-plug change
pub type DeviceChangeHandler = Arc<dyn Fn(&[VideoDevice]) + Send + Sync>;

/// Default hot-plug poll interval
pub const DEFAULT_HOTPLUG_INTERVAL: Duration = Duration::from_secs(2);

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks the available video inputs and the selected one
///
/// The registry never holds a camera stream. Enumeration may open a device
/// briefly to read its label, and always releases it before returning.
pub struct DeviceRegistry {
    backend: Arc<dyn CameraBackend>,
    devices: ArcSwap<Vec<VideoDevice>>,
    selected: RwLock<Option<String>>,
    handlers: RwLock<Vec<DeviceChangeHandler>>,
    events: Arc<EventBus>,
    watcher: parking_lot::Mutex<Option<Watcher>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CameraBackend>, events: Arc<EventBus>) -> Self {
        Self {
            backend,
            devices: ArcSwap::from_pointee(Vec::new()),
            selected: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            events,
            watcher: parking_lot::Mutex::new(None),
        }
    }

    /// Enumerate video inputs.
    ///
    /// Never fails: on backend errors the last known list is returned.
    /// Auto-selects the first device when nothing is selected.
    pub async fn list_devices(&self, prompt_for_permission: bool) -> Vec<VideoDevice> {
        self.enumerate(prompt_for_permission).await.0
    }

    /// Re-enumerate without probing and notify change handlers.
    ///
    /// Returns whether the device set changed.
    pub async fn refresh(&self) -> bool {
        let (devices, changed) = self.enumerate(false).await;
        if changed {
            let handlers = self.handlers.read().clone();
            for handler in handlers {
                handler(&devices);
            }
        }
        changed
    }

    async fn enumerate(&self, probe: bool) -> (Vec<VideoDevice>, bool) {
        let backend = self.backend.clone();
        let result = tokio::task::spawn_blocking(move || backend.enumerate(probe))
            .await
            .map_err(|e| AppError::CaptureError(format!("Enumeration task failed: {}", e)))
            .and_then(|r| r);

        let found = match result {
            Ok(found) => found,
            Err(e) => {
                warn!("Error enumerating devices: {}", e);
                return (self.devices(), false);
            }
        };

        let previous = self.devices.load_full();
        let devices = merge_labels(&previous, dedup_devices(found));
        let changed = ids(&previous) != ids(&devices);

        self.devices.store(Arc::new(devices.clone()));

        if changed {
            info!("Video devices changed: {} available", devices.len());
            self.events.publish(ClientEvent::DevicesChanged {
                devices: devices.clone(),
            });
        }

        let auto_select = {
            let mut selected = self.selected.write();
            match (selected.as_ref(), devices.first()) {
                (None, Some(first)) => {
                    *selected = Some(first.id.clone());
                    Some(first.id.clone())
                }
                _ => None,
            }
        };
        if let Some(device_id) = auto_select {
            info!("Auto-selected video device {}", device_id);
            self.events.publish(ClientEvent::DeviceSelected { device_id });
        }

        (devices, changed)
    }

    /// Last enumeration result
    pub fn devices(&self) -> Vec<VideoDevice> {
        self.devices.load().as_ref().clone()
    }

    /// Look up a device by id in the last enumeration result
    pub fn get(&self, device_id: &str) -> Option<VideoDevice> {
        self.devices.load().iter().find(|d| d.id == device_id).cloned()
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.read().clone()
    }

    /// Select a device from the current list
    pub fn select(&self, device_id: &str) -> Result<()> {
        if self.get(device_id).is_none() {
            return Err(AppError::NotFound(format!("video device {}", device_id)));
        }

        let changed = {
            let mut selected = self.selected.write();
            let changed = selected.as_deref() != Some(device_id);
            *selected = Some(device_id.to_string());
            changed
        };

        if changed {
            info!("Selected video device {}", device_id);
            self.events.publish(ClientEvent::DeviceSelected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    /// Register a hot-plug callback
    pub fn on_device_change<F>(&self, handler: F)
    where
        F: Fn(&[VideoDevice]) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Start polling for hot-plug changes. Restarts the watcher if running.
    pub fn start_watching(self: &Arc<Self>, interval: Duration) {
        let cancel = CancellationToken::new();
        let registry = Arc::downgrade(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.refresh().await;
            }
            debug!("Device watcher stopped");
        });

        if let Some(old) = self.watcher.lock().replace(Watcher { cancel, handle }) {
            old.cancel.cancel();
        }
        debug!("Device watcher started ({:?})", interval);
    }

    /// Stop the hot-plug watcher. Idempotent.
    pub async fn stop_watching(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            let _ = watcher.handle.await;
        }
    }
}

fn ids(devices: &[VideoDevice]) -> Vec<&str> {
    devices.iter().map(|d| d.id.as_str()).collect()
}

/// Drop repeated ids, keeping the first occurrence
fn dedup_devices(devices: Vec<VideoDevice>) -> Vec<VideoDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.id.clone()))
        .collect()
}

/// Keep labels learned from an earlier probe when a later
/// enumeration could not read them
fn merge_labels(previous: &[VideoDevice], devices: Vec<VideoDevice>) -> Vec<VideoDevice> {
    devices
        .into_iter()
        .map(|mut device| {
            if device.label.is_empty() {
                if let Some(known) = previous.iter().find(|p| p.id == device.id) {
                    device.label = known.label.clone();
                }
            }
            device
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::capture::CaptureConfig;
    use crate::video::synthetic::SyntheticBackend;
    use crate::video::CameraStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DuplicatingBackend;

    impl CameraBackend for DuplicatingBackend {
        fn name(&self) -> &str {
            "dup"
        }

        fn enumerate(&self, _probe: bool) -> Result<Vec<VideoDevice>> {
            Ok(vec![
                VideoDevice::new("a", "A"),
                VideoDevice::new("b", "B"),
                VideoDevice::new("a", "A again"),
            ])
        }

        fn open(&self, id: &str, _config: &CaptureConfig) -> Result<Box<dyn CameraStream>> {
            Err(AppError::NotFound(id.to_string()))
        }
    }

    struct FailingBackend;

    impl CameraBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn enumerate(&self, _probe: bool) -> Result<Vec<VideoDevice>> {
            Err(AppError::CaptureError("permission denied".to_string()))
        }

        fn open(&self, id: &str, _config: &CaptureConfig) -> Result<Box<dyn CameraStream>> {
            Err(AppError::NotFound(id.to_string()))
        }
    }

    fn registry(backend: impl CameraBackend) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(backend), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_no_duplicate_ids() {
        let registry = registry(DuplicatingBackend);
        let devices = registry.list_devices(true).await;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].label, "A");
        assert_eq!(devices[1].id, "b");
    }

    #[tokio::test]
    async fn test_first_device_auto_selected() {
        let backend = SyntheticBackend::new(vec![
            VideoDevice::new("cam0", "Front"),
            VideoDevice::new("cam1", "Back"),
        ]);
        let registry = registry(backend);
        assert_eq!(registry.selected(), None);

        registry.list_devices(true).await;
        assert_eq!(registry.selected().as_deref(), Some("cam0"));

        registry.select("cam1").unwrap();
        registry.list_devices(false).await;
        assert_eq!(registry.selected().as_deref(), Some("cam1"));
    }

    #[tokio::test]
    async fn test_select_unknown_device() {
        let registry = registry(SyntheticBackend::single());
        registry.list_devices(true).await;
        assert!(matches!(registry.select("missing"), Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_soft() {
        let registry = registry(FailingBackend);
        assert!(registry.list_devices(true).await.is_empty());
        assert_eq!(registry.selected(), None);
    }

    #[tokio::test]
    async fn test_labels_survive_unprobed_refresh() {
        let registry = registry(SyntheticBackend::single());
        registry.list_devices(true).await;
        let devices = registry.list_devices(false).await;
        assert_eq!(devices[0].label, "Synthetic Camera");
    }

    #[tokio::test]
    async fn test_refresh_fires_handlers_on_change_only() {
        let backend = SyntheticBackend::single();
        let registry = registry(backend.clone());
        registry.list_devices(true).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        registry.on_device_change(move |devices| {
            assert_eq!(devices.len(), 2);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registry.refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        backend.set_devices(vec![
            VideoDevice::new("synthetic0", "Synthetic Camera"),
            VideoDevice::new("synthetic1", "USB Camera"),
        ]);
        assert!(registry.refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watcher_picks_up_hotplug() {
        let backend = SyntheticBackend::new(vec![]);
        let registry = Arc::new(registry(backend.clone()));
        registry.list_devices(true).await;
        assert!(registry.selected().is_none());

        registry.start_watching(Duration::from_millis(20));
        backend.set_devices(vec![VideoDevice::new("usb0", "USB")]);

        let mut found = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if registry.selected().as_deref() == Some("usb0") {
                found = true;
                break;
            }
        }
        registry.stop_watching().await;
        registry.stop_watching().await;
        assert!(found);
    }
}

//! Collaborators the reconciler drives: subscriptions, event fan-out, durable storage
//!
//! The traits are the only surface the reconciler sees. In-process
//! implementations are provided for embedding and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use dockwatch_core::{Device, DeviceSn, ModelKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CollabError {
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Sub-device half of a gateway reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDeviceRef {
    pub sn: DeviceSn,
    pub model_key: ModelKey,
}

/// What the subscription manager needs to know about a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRef {
    pub sn: DeviceSn,
    pub model_key: ModelKey,
    pub thing_version: Option<String>,
    pub sub_device: Option<SubDeviceRef>,
}

impl GatewayRef {
    pub fn new(gateway: &Device, sub_device: Option<&Device>) -> Self {
        Self {
            sn: gateway.sn.clone(),
            model_key: gateway.model_key(),
            thing_version: gateway.thing_version.clone(),
            sub_device: sub_device.map(|sub| SubDeviceRef {
                sn: sub.sn.clone(),
                model_key: sub.model_key(),
            }),
        }
    }
}

/// Kind of event fanned out to a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DeviceOnline,
    DeviceOffline,
    TelemetryUpdate,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceOnline => "DEVICE_ONLINE",
            Self::DeviceOffline => "DEVICE_OFFLINE",
            Self::TelemetryUpdate => "TELEMETRY_UPDATE",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscribes and unsubscribes wire topics for devices
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    /// Subscribe a gateway and its current sub-device
    async fn subscribe(&self, gateway: &GatewayRef) -> Result<(), CollabError>;

    /// Drop the topics of a sub-device
    async fn unsubscribe(&self, sn: &DeviceSn) -> Result<(), CollabError>;
}

/// Fans events out to a workspace
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        workspace_id: &str,
        kind: EventKind,
        sn: &DeviceSn,
        payload: Value,
    ) -> Result<(), CollabError>;
}

/// Durable device storage, decoupled from the in-memory presence state
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn upsert(&self, device: &Device) -> Result<(), PersistenceError>;

    async fn load(&self, sn: &DeviceSn) -> Result<Option<Device>, PersistenceError>;
}

/// An event as delivered to broadcast receivers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedEvent {
    pub workspace_id: String,
    pub kind: EventKind,
    pub sn: DeviceSn,
    pub payload: Value,
}

/// Publisher backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    event_tx: broadcast::Sender<PublishedEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to published events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(
        &self,
        workspace_id: &str,
        kind: EventKind,
        sn: &DeviceSn,
        payload: Value,
    ) -> Result<(), CollabError> {
        // No receivers is not an error
        let _ = self.event_tx.send(PublishedEvent {
            workspace_id: workspace_id.to_string(),
            kind,
            sn: sn.clone(),
            payload,
        });
        Ok(())
    }
}

/// Persistence kept in memory
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    devices: DashMap<DeviceSn, Device>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sn: &DeviceSn) -> Option<Device> {
        self.devices.get(sn).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl PersistenceStore for MemoryPersistence {
    async fn upsert(&self, device: &Device) -> Result<(), PersistenceError> {
        self.devices.insert(device.sn.clone(), device.clone());
        Ok(())
    }

    async fn load(&self, sn: &DeviceSn) -> Result<Option<Device>, PersistenceError> {
        Ok(self.get(sn))
    }
}

/// On-disk layout of [`JsonFilePersistence`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    devices: BTreeMap<DeviceSn, Device>,
}

/// Persistence in a single pretty-printed JSON file, rewritten on every upsert
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
    file: Mutex<DeviceFile>,
}

impl JsonFilePersistence {
    /// Open the file, or start empty if it does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let file = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: DeviceFile = serde_json::from_str(&content)?;
            info!(path = %path.display(), devices = file.devices.len(), "Loaded device file");
            file
        } else {
            debug!(path = %path.display(), "Device file not found, starting empty");
            DeviceFile::default()
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.file.lock().await.devices.len()
    }
}

#[async_trait]
impl PersistenceStore for JsonFilePersistence {
    async fn upsert(&self, device: &Device) -> Result<(), PersistenceError> {
        let mut file = self.file.lock().await;
        file.devices.insert(device.sn.clone(), device.clone());
        let content = serde_json::to_string_pretty(&*file)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn load(&self, sn: &DeviceSn) -> Result<Option<Device>, PersistenceError> {
        Ok(self.file.lock().await.devices.get(sn).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dockwatch_core::DeviceDomain;
    use tempfile::TempDir;

    fn dock(sn: &str) -> Device {
        Device::new(DeviceSn::from(sn), ModelKey::new(DeviceDomain::Dock, 3, 0), Utc::now())
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(serde_json::to_string(&EventKind::DeviceOnline).unwrap(), "\"DEVICE_ONLINE\"");
        assert_eq!(EventKind::TelemetryUpdate.to_string(), "TELEMETRY_UPDATE");
    }

    #[tokio::test]
    async fn test_broadcast_publisher_delivers() {
        let publisher = BroadcastPublisher::default();
        let mut rx = publisher.subscribe();
        publisher
            .publish("ws-1", EventKind::DeviceOffline, &DeviceSn::from("dock-1"), Value::Null)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.workspace_id, "ws-1");
        assert_eq!(event.kind, EventKind::DeviceOffline);

        // Publishing with nobody listening still succeeds
        drop(rx);
        assert!(publisher
            .publish("ws-1", EventKind::DeviceOnline, &DeviceSn::from("dock-1"), Value::Null)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_json_file_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("devices.json");

        let store = JsonFilePersistence::open(&path).await.unwrap();
        assert_eq!(store.len().await, 0);
        let mut device = dock("dock-1");
        device.bind("ws-9");
        store.upsert(&device).await.unwrap();
        assert!(path.exists());

        let reopened = JsonFilePersistence::open(&path).await.unwrap();
        let loaded = reopened.load(&DeviceSn::from("dock-1")).await.unwrap().unwrap();
        assert_eq!(loaded.workspace(), Some("ws-9"));
        assert!(reopened.load(&DeviceSn::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_persistence_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFilePersistence::open(&path).await,
            Err(PersistenceError::Json(_))
        ));
    }
}

//! Device registry: in-memory map mirrored into the local store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use buddy_common::{ConnectionState, DeviceInfo, Error, Result};
use buddy_storage::LocalStore;

/// Known devices, keyed by device id.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceInfo>>,
    store: Arc<dyn LocalStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Reload persisted devices. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize> {
        let loaded = self.store.load_devices().await?;
        let count = loaded.len();
        let mut devices = self.devices.write().await;
        for info in loaded {
            devices.insert(info.device_id.clone(), info);
        }
        Ok(count)
    }

    /// Insert or replace a device and persist it.
    pub async fn register(&self, info: DeviceInfo) -> Result<()> {
        self.store.persist_device_info(&info).await?;
        debug!("Registered device {} ({})", info.device_id, info.device_type);
        self.devices.write().await.insert(info.device_id.clone(), info);
        Ok(())
    }

    /// Update presence. Returns `true` when the state actually changed.
    pub async fn set_online(&self, device_id: &str, online: bool) -> Result<bool> {
        let state = if online {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        };
        self.update(device_id, |info| {
            let changed = info.connection_state != state;
            info.connection_state = state;
            changed
        })
        .await
    }

    /// Stamp a successful sync.
    pub async fn touch_last_sync(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(device_id, |info| {
            info.last_sync = Some(at);
        })
        .await
    }

    /// Soft-delete a device.
    pub async fn deactivate(&self, device_id: &str) -> Result<()> {
        self.update(device_id, |info| {
            info.is_active = false;
            info.connection_state = ConnectionState::Offline;
        })
        .await
    }

    /// Active devices of a user, ordered by device id.
    pub async fn get(&self, user_id: &str) -> Vec<DeviceInfo> {
        let devices = self.devices.read().await;
        let mut found: Vec<DeviceInfo> = devices
            .values()
            .filter(|d| d.user_id == user_id && d.is_active)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        found
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Number of active devices.
    pub async fn count(&self) -> usize {
        self.devices.read().await.values().filter(|d| d.is_active).count()
    }

    async fn update<T>(&self, device_id: &str, f: impl FnOnce(&mut DeviceInfo) -> T) -> Result<T> {
        let mut devices = self.devices.write().await;
        let info = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::NotFound(format!("Device {}", device_id)))?;
        let out = f(info);
        self.store.persist_device_info(info).await?;
        Ok(out)
    }
}

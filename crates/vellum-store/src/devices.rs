//! Device registry — per-replica sync cursors and liveness.
//!
//! Feeds two decisions: causal catch-up (each device pulls from its own
//! cursor) and log garbage collection (the watermark is the minimum cursor
//! across devices that are still fresh). A device silent past the freshness
//! window stops holding the watermark back and is flagged for a forced full
//! resync on its next reconnect.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use vellum_core::types::{unix_now, DeviceEntry};

/// Registry of replicas enrolled against this vault.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    db_path: PathBuf,
    devices: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    /// Load the registry from a JSON file (empty registry if absent).
    pub fn open(db_path: &Path) -> Result<Self> {
        let devices = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)
                .with_context(|| format!("reading device registry: {}", db_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing device registry: {}", db_path.display()))?
        } else {
            Vec::new()
        };

        Ok(DeviceRegistry {
            db_path: db_path.to_path_buf(),
            devices,
        })
    }

    /// Atomic save: temp file, then rename.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.devices)
            .context("serializing device registry")?;
        let tmp = self.db_path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("writing device registry temp: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.db_path)
            .with_context(|| format!("renaming device registry: {}", self.db_path.display()))?;
        Ok(())
    }

    /// Register a device under a fresh UUID. Re-registering an existing name
    /// returns the already-assigned id.
    pub fn register(&mut self, name: &str) -> Result<String> {
        if let Some(existing) = self.devices.iter().find(|d| d.name == name && !d.revoked) {
            return Ok(existing.device_id.clone());
        }

        let device_id = uuid::Uuid::new_v4().to_string();
        self.devices.push(DeviceEntry {
            device_id: device_id.clone(),
            name: name.to_string(),
            last_cursor: 0,
            last_sync_at: unix_now(),
            pending_count: 0,
            enrolled_at: unix_now(),
            revoked: false,
            needs_full_resync: false,
        });
        self.save()?;

        tracing::info!(device = name, id = %device_id, "device registered");
        Ok(device_id)
    }

    /// Record a heartbeat: the cursor only moves forward, liveness is
    /// refreshed, and the current pending count is snapshotted.
    pub fn heartbeat(&mut self, device_id: &str, cursor: u64, pending_count: u64) -> Result<()> {
        self.heartbeat_at(device_id, cursor, pending_count, unix_now())
    }

    pub fn heartbeat_at(
        &mut self,
        device_id: &str,
        cursor: u64,
        pending_count: u64,
        now: u64,
    ) -> Result<()> {
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .with_context(|| format!("heartbeat from unknown device {device_id}"))?;

        device.last_cursor = device.last_cursor.max(cursor);
        device.last_sync_at = now;
        device.pending_count = pending_count;
        self.save()
    }

    /// Remove a device entirely; it no longer factors into the watermark.
    pub fn deregister(&mut self, device_id: &str) -> Result<bool> {
        let before = self.devices.len();
        self.devices.retain(|d| d.device_id != device_id);
        let removed = self.devices.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Revoke a device by name, keeping the record for audit.
    pub fn revoke(&mut self, name: &str) -> Result<bool> {
        let Some(device) = self.devices.iter_mut().find(|d| d.name == name) else {
            return Ok(false);
        };
        device.revoked = true;
        self.save()?;
        Ok(true)
    }

    /// Flag devices silent past the freshness window for a full resync.
    /// Returns how many were newly flagged. Run before computing the
    /// watermark so stale devices never block GC.
    pub fn sweep_stale(&mut self, freshness_window_secs: u64) -> Result<usize> {
        self.sweep_stale_at(freshness_window_secs, unix_now())
    }

    pub fn sweep_stale_at(&mut self, freshness_window_secs: u64, now: u64) -> Result<usize> {
        let mut flagged = 0;
        for device in &mut self.devices {
            if !device.revoked
                && !device.needs_full_resync
                && now.saturating_sub(device.last_sync_at) > freshness_window_secs
            {
                device.needs_full_resync = true;
                flagged += 1;
                tracing::warn!(
                    device = %device.name,
                    id = %device.device_id,
                    silent_secs = now.saturating_sub(device.last_sync_at),
                    "device stale, flagged for full resync"
                );
            }
        }
        if flagged > 0 {
            self.save()?;
        }
        Ok(flagged)
    }

    /// Cleared once the device has completed its forced full resync.
    pub fn clear_full_resync(&mut self, device_id: &str) -> Result<()> {
        if let Some(device) = self.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.needs_full_resync = false;
            self.save()?;
        }
        Ok(())
    }

    /// Minimum acknowledged cursor across fresh, active devices. Operations
    /// fully applied at or below this may be compacted out of the log.
    /// `None` when no device qualifies (nothing may be discarded).
    pub fn gc_watermark(&self) -> Option<u64> {
        self.devices
            .iter()
            .filter(|d| !d.revoked && !d.needs_full_resync)
            .map(|d| d.last_cursor)
            .min()
    }

    pub fn find_by_id(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn find(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Active (non-revoked) devices.
    pub fn active_devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.iter().filter(|d| !d.revoked)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: u64 = 24 * 3600;
    const WINDOW: u64 = 30 * DAY;

    fn registry(dir: &TempDir) -> DeviceRegistry {
        DeviceRegistry::open(&dir.path().join("devices.json")).unwrap()
    }

    #[test]
    fn register_is_idempotent_by_name() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);

        let a = reg.register("laptop").unwrap();
        let b = reg.register("laptop").unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn heartbeat_moves_cursor_forward_only() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let id = reg.register("laptop").unwrap();

        reg.heartbeat_at(&id, 10, 2, 1_000).unwrap();
        reg.heartbeat_at(&id, 7, 0, 2_000).unwrap();

        let device = reg.find_by_id(&id).unwrap();
        assert_eq!(device.last_cursor, 10, "cursor never regresses");
        assert_eq!(device.last_sync_at, 2_000);
        assert!(reg.heartbeat("ghost", 1, 0).is_err());
    }

    #[test]
    fn watermark_is_min_cursor_of_fresh_devices() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);

        let a = reg.register("laptop").unwrap();
        let b = reg.register("phone").unwrap();
        reg.heartbeat_at(&a, 40, 0, 1_000).unwrap();
        reg.heartbeat_at(&b, 25, 0, 1_000).unwrap();

        assert_eq!(reg.gc_watermark(), Some(25));
    }

    #[test]
    fn stale_device_is_excluded_and_flagged() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);

        let fresh = reg.register("laptop").unwrap();
        let stale = reg.register("old-phone").unwrap();

        let now = 100 * DAY;
        reg.heartbeat_at(&fresh, 40, 0, now).unwrap();
        // 45 days of silence
        reg.heartbeat_at(&stale, 5, 0, now - 45 * DAY).unwrap();

        let flagged = reg.sweep_stale_at(WINDOW, now).unwrap();
        assert_eq!(flagged, 1);
        assert!(reg.find_by_id(&stale).unwrap().needs_full_resync);

        // The silent device no longer blocks GC
        assert_eq!(reg.gc_watermark(), Some(40));

        // Reconnect: still flagged until the full resync completes
        reg.heartbeat_at(&stale, 5, 0, now).unwrap();
        assert!(reg.find_by_id(&stale).unwrap().needs_full_resync);
        reg.clear_full_resync(&stale).unwrap();
        assert!(!reg.find_by_id(&stale).unwrap().needs_full_resync);
        assert_eq!(reg.gc_watermark(), Some(5));
    }

    #[test]
    fn revoked_devices_do_not_hold_the_watermark() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);

        let a = reg.register("laptop").unwrap();
        reg.register("lost-tablet").unwrap();
        reg.heartbeat_at(&a, 30, 0, 1_000).unwrap();

        assert_eq!(reg.gc_watermark(), Some(0));
        assert!(reg.revoke("lost-tablet").unwrap());
        assert_eq!(reg.gc_watermark(), Some(30));
        assert_eq!(reg.active_devices().count(), 1);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("devices.json");

        let id = {
            let mut reg = DeviceRegistry::open(&db).unwrap();
            let id = reg.register("laptop").unwrap();
            reg.heartbeat_at(&id, 12, 3, 5_000).unwrap();
            id
        };

        let reg = DeviceRegistry::open(&db).unwrap();
        let device = reg.find("laptop").unwrap();
        assert_eq!(device.device_id, id);
        assert_eq!(device.last_cursor, 12);
        assert_eq!(device.pending_count, 3);
    }

    #[test]
    fn deregister_removes_entirely() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);

        let id = reg.register("laptop").unwrap();
        assert!(reg.deregister(&id).unwrap());
        assert!(!reg.deregister(&id).unwrap());
        assert!(reg.is_empty());
        assert_eq!(reg.gc_watermark(), None);
    }
}

//! Persisted auto-mount configuration.
//!
//! The original device kept one record per drive slot in EEPROM: a mount
//! state byte (0 unmounted, 1 writable, 2 read-only), an 8-bit checksum of
//! the path buffer, and the path itself. The same layout is kept here,
//! serialized to a JSON file on the host. Restoring skips records with a bad
//! checksum or a path no longer present on the medium, and dismisses mount
//! errors; a machine should come up even with a stale store.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::drives::DriveSlots;
use crate::error::Pmd32Result;
use crate::fs::{ImageFile, Storage};
use crate::geometry::DRIVE_COUNT;

/// Image mounted to drive A on a first run when nothing else claimed it.
pub const SYSTEM_IMAGE: &str = "/system.p32";

/// One drive slot's persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotRecord {
    /// 0 = unmounted, 1 = mounted writable, 2 = mounted read-only.
    pub state: u8,
    /// Wrapping byte sum of the path; the record's validity check.
    pub checksum: u8,
    pub path: String,
}

impl SlotRecord {
    fn for_path(path: &str, read_only: bool) -> Self {
        Self {
            state: if read_only { 2 } else { 1 },
            checksum: path_checksum(path),
            path: path.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state >= 1 && self.state <= 2 && self.checksum == path_checksum(&self.path)
    }
}

fn path_checksum(path: &str) -> u8 {
    path.bytes().fold(0u8, |sum, byte| sum.wrapping_add(byte))
}

/// The whole auto-mount store, one record per slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoMountStore {
    pub slots: [SlotRecord; DRIVE_COUNT],
}

impl AutoMountStore {
    /// Snapshot the current drive table.
    pub fn capture<F: ImageFile>(drives: &mut DriveSlots<F>) -> Self {
        let mut store = Self::default();
        for drive in 0..DRIVE_COUNT as u8 {
            if drives.is_mounted(drive) {
                let read_only = !drives.writable(drive);
                let path = drives.path(drive).unwrap_or("").to_string();
                store.slots[drive as usize] = SlotRecord::for_path(&path, read_only);
            }
        }
        store
    }

    pub fn load(path: &Path) -> Pmd32Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: &Path) -> Pmd32Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Remount what the store describes. Invalid records and vanished paths
    /// are skipped; mount errors are dismissed. Returns the number of drives
    /// actually mounted.
    pub fn restore<S: Storage>(&self, storage: &mut S, drives: &mut DriveSlots<S::File>) -> usize {
        let mut mounted = 0;
        for (index, record) in self.slots.iter().enumerate() {
            let drive = index as u8;
            if record.state == 0 {
                continue;
            }
            if !record.is_valid() || !storage.exists(&record.path) {
                debug!(drive, path = %record.path, "stale auto-mount record skipped");
                continue;
            }
            if drives.set_path(drive, &record.path).is_err() {
                continue;
            }
            if drives.mount(storage, drive, record.state == 2).is_ok() {
                mounted += 1;
            }
        }
        mounted
    }
}

/// First-run fallback: mount `/system.p32` read-only on drive A when the
/// slot is still empty and the image exists.
pub fn restore_system_image<S: Storage>(
    storage: &mut S,
    drives: &mut DriveSlots<S::File>,
) -> bool {
    if drives.is_mounted(0) || !storage.exists(SYSTEM_IMAGE) {
        return false;
    }
    if drives.set_path(0, SYSTEM_IMAGE).is_err() {
        return false;
    }
    drives.mount(storage, 0, true).is_ok()
}

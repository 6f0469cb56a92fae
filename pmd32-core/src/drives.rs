//! Drive slot table.
//!
//! Four virtual drives, A to D, each bound to at most one open image file.
//! Slot paths outlive unmounts so the host can remount the same image with a
//! different write flag. The engine never touches files directly; it resolves
//! handles through this table.

use tracing::debug;

use crate::error::{Pmd32Error, Pmd32Result};
use crate::fs::{ImageFile, Storage};
use crate::geometry::{DRIVE_COUNT, IMAGE_SIZE};
use crate::protocol::{truncate_str, MAX_SLOT_PATH};

struct DriveSlot<F> {
    file: Option<F>,
    path: String,
}

impl<F> DriveSlot<F> {
    fn new() -> Self {
        Self {
            file: None,
            path: String::new(),
        }
    }
}

/// The drive table.
pub struct DriveSlots<F: ImageFile> {
    slots: [DriveSlot<F>; DRIVE_COUNT],
}

impl<F: ImageFile> Default for DriveSlots<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ImageFile> DriveSlots<F> {
    pub fn new() -> Self {
        Self {
            slots: [
                DriveSlot::new(),
                DriveSlot::new(),
                DriveSlot::new(),
                DriveSlot::new(),
            ],
        }
    }

    pub fn is_mounted(&self, drive: u8) -> bool {
        self.slots
            .get(drive as usize)
            .map(|s| s.file.is_some())
            .unwrap_or(false)
    }

    pub fn mounted_count(&self) -> usize {
        self.slots.iter().filter(|s| s.file.is_some()).count()
    }

    /// Open handle of a mounted drive.
    pub fn file(&mut self, drive: u8) -> Option<&mut F> {
        self.slots.get_mut(drive as usize)?.file.as_mut()
    }

    /// Assigned path, which may refer to a currently unmounted image.
    pub fn path(&self, drive: u8) -> Option<&str> {
        self.slots.get(drive as usize).map(|s| s.path.as_str())
    }

    /// Assign a slot path, silently truncated to the on-device capacity.
    pub fn set_path(&mut self, drive: u8, path: &str) -> Pmd32Result<()> {
        let slot = self
            .slots
            .get_mut(drive as usize)
            .ok_or(Pmd32Error::InvalidDrive(drive))?;
        slot.path = truncate_str(path, MAX_SLOT_PATH).to_string();
        Ok(())
    }

    pub fn writable(&mut self, drive: u8) -> bool {
        self.file(drive).map(|f| f.writable()).unwrap_or(false)
    }

    /// True if another slot already has `path` mounted.
    pub fn path_in_use(&self, path: &str, except: u8) -> bool {
        self.slots.iter().enumerate().any(|(index, slot)| {
            index != except as usize && slot.file.is_some() && slot.path.eq_ignore_ascii_case(path)
        })
    }

    /// Mount the slot's assigned path. A no-op when already mounted.
    pub fn mount<S>(&mut self, storage: &mut S, drive: u8, read_only: bool) -> Pmd32Result<()>
    where
        S: Storage<File = F>,
    {
        if drive as usize >= DRIVE_COUNT {
            return Err(Pmd32Error::InvalidDrive(drive));
        }
        if self.is_mounted(drive) {
            return Ok(());
        }
        let path = self.slots[drive as usize].path.clone();
        if self.path_in_use(&path, drive) {
            return Err(Pmd32Error::AlreadyMounted(path));
        }
        let file = storage.open(&path, read_only)?;
        if file.len() != IMAGE_SIZE {
            return Err(Pmd32Error::ImageSize {
                path,
                size: file.len(),
            });
        }
        debug!(drive, path = %path, read_only, "image mounted");
        self.slots[drive as usize].file = Some(file);
        Ok(())
    }

    /// Flush and close a slot's image. The path assignment stays.
    pub fn unmount(&mut self, drive: u8) {
        if let Some(slot) = self.slots.get_mut(drive as usize) {
            if let Some(mut file) = slot.file.take() {
                let _ = file.flush();
                debug!(drive, path = %slot.path, "image unmounted");
            }
        }
    }

    pub fn unmount_all(&mut self) {
        for drive in 0..DRIVE_COUNT as u8 {
            self.unmount(drive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryStorage;

    fn storage_with_image(path: &str) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.add_image(path);
        storage
    }

    #[test]
    fn test_mount_and_unmount() {
        let mut storage = storage_with_image("/DISK.P32");
        let mut slots = DriveSlots::new();

        slots.set_path(0, "/DISK.P32").unwrap();
        slots.mount(&mut storage, 0, false).unwrap();
        assert!(slots.is_mounted(0));
        assert!(slots.writable(0));
        assert_eq!(slots.mounted_count(), 1);

        slots.unmount(0);
        assert!(!slots.is_mounted(0));
        // the path assignment survives for a 0xFF remount
        assert_eq!(slots.path(0), Some("/DISK.P32"));
    }

    #[test]
    fn test_mount_rejects_wrong_size() {
        let storage = MemoryStorage::new();
        storage.add_file("/SMALL.P32", vec![0u8; 1024]);
        let mut storage = storage;

        let mut slots = DriveSlots::new();
        slots.set_path(1, "/SMALL.P32").unwrap();
        assert!(matches!(
            slots.mount(&mut storage, 1, false),
            Err(Pmd32Error::ImageSize { .. })
        ));
        assert!(!slots.is_mounted(1));
    }

    #[test]
    fn test_mount_rejects_path_in_use() {
        let mut storage = storage_with_image("/DISK.P32");
        let mut slots = DriveSlots::new();

        slots.set_path(0, "/DISK.P32").unwrap();
        slots.mount(&mut storage, 0, false).unwrap();

        slots.set_path(1, "/disk.p32").unwrap();
        assert!(matches!(
            slots.mount(&mut storage, 1, false),
            Err(Pmd32Error::AlreadyMounted(_))
        ));
    }

    #[test]
    fn test_mount_missing_image() {
        let mut storage = MemoryStorage::new();
        let mut slots: DriveSlots<_> = DriveSlots::new();
        slots.set_path(2, "/GONE.P32").unwrap();
        assert!(matches!(
            slots.mount(&mut storage, 2, false),
            Err(Pmd32Error::NotFound(_))
        ));
    }

    #[test]
    fn test_out_of_range_drive() {
        let mut storage = storage_with_image("/DISK.P32");
        let mut slots = DriveSlots::new();
        assert!(matches!(
            slots.mount(&mut storage, 4, false),
            Err(Pmd32Error::InvalidDrive(4))
        ));
        assert!(!slots.is_mounted(4));
        assert!(slots.file(4).is_none());
    }

    #[test]
    fn test_remount_is_noop() {
        let mut storage = storage_with_image("/DISK.P32");
        let mut slots = DriveSlots::new();
        slots.set_path(0, "/DISK.P32").unwrap();
        slots.mount(&mut storage, 0, true).unwrap();
        // second mount keeps the existing (read-only) handle
        slots.mount(&mut storage, 0, false).unwrap();
        assert!(!slots.writable(0));
    }
}

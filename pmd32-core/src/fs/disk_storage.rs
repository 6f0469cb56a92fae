//! Host-directory storage backend.
//!
//! Maps the virtual medium onto a directory of the host filesystem. Virtual
//! paths are resolved strictly inside that root; `.` and `..` components are
//! refused rather than normalized, so wire-supplied paths cannot escape the
//! jail. Name matching follows the host filesystem (the original medium was
//! FAT and case-insensitive; a case-sensitive host is stricter, not looser).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::storage::{trim_dir_path, DirEntry, ImageFile, Storage};
use crate::error::{Pmd32Error, Pmd32Result};

/// Storage rooted at a host directory.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual absolute path to a host path inside the root.
    fn resolve(&self, path: &str) -> Pmd32Result<PathBuf> {
        let mut resolved = self.root.clone();
        for part in path.split('/') {
            match part {
                "" => continue,
                "." | ".." => return Err(Pmd32Error::OutsideRoot(path.to_string())),
                _ => resolved.push(part),
            }
        }
        Ok(resolved)
    }
}

/// An image file on the host filesystem.
pub struct DiskFile {
    file: File,
    len: u64,
    writable: bool,
}

impl ImageFile for DiskFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Pmd32Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Pmd32Result<usize> {
        if !self.writable {
            return Err(Pmd32Error::ReadOnly);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(data.len())
    }

    fn flush(&mut self) -> Pmd32Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

impl Storage for DiskStorage {
    type File = DiskFile;

    fn open(&mut self, path: &str, read_only: bool) -> Pmd32Result<Self::File> {
        let host_path = self.resolve(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&host_path)?;
        let len = file.metadata()?.len();
        Ok(DiskFile {
            file,
            len,
            writable: !read_only,
        })
    }

    fn create(&mut self, path: &str) -> Pmd32Result<Self::File> {
        let host_path = self.resolve(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host_path)?;
        Ok(DiskFile {
            file,
            len: 0,
            writable: true,
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn chdir(&mut self, path: &str) -> bool {
        self.resolve(trim_dir_path(path))
            .map(|p| p.is_dir())
            .unwrap_or(false)
    }

    fn read_dir(&self, path: &str) -> Pmd32Result<Vec<DirEntry>> {
        let host_path = self.resolve(trim_dir_path(path))?;
        if !host_path.is_dir() {
            return Err(Pmd32Error::NotADirectory(path.to_string()));
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&host_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type()?.is_dir();
            let is_hidden = name.starts_with('.');
            entries.push(DirEntry {
                name,
                is_dir,
                is_hidden,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DiskStorage::new(dir.path());

        let mut file = storage.create("/TEST.P32").unwrap();
        assert_eq!(file.write_at(0, &[0xE5; 256]).unwrap(), 256);
        file.flush().unwrap();
        assert_eq!(file.len(), 256);

        let mut back = storage.open("/TEST.P32", true).unwrap();
        let mut buf = [0u8; 128];
        assert_eq!(back.read_at(128, &mut buf).unwrap(), 128);
        assert!(buf.iter().all(|&b| b == 0xE5));
        assert!(!back.writable());
    }

    #[test]
    fn test_short_read_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DiskStorage::new(dir.path());

        let mut file = storage.create("/SHORT.P32").unwrap();
        file.write_at(0, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(2, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[3, 4]);
    }

    #[test]
    fn test_read_only_handle_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DiskStorage::new(dir.path());
        storage.create("/RO.P32").unwrap();

        let mut file = storage.open("/RO.P32", true).unwrap();
        assert!(matches!(
            file.write_at(0, &[0]),
            Err(Pmd32Error::ReadOnly)
        ));
    }

    #[test]
    fn test_jail_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DiskStorage::new(dir.path());

        assert!(matches!(
            storage.open("/../outside.p32", true),
            Err(Pmd32Error::OutsideRoot(_))
        ));
        assert!(!storage.exists("/a/../../b"));
    }

    #[test]
    fn test_chdir_probe_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("GAMES")).unwrap();
        std::fs::write(dir.path().join("GAMES/DISK.P32"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();

        let mut storage = DiskStorage::new(dir.path());
        assert!(storage.chdir("/GAMES/"));
        assert!(!storage.chdir("/NOPE/"));

        let entries = storage.read_dir("/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"GAMES"));
        let hidden = entries.iter().find(|e| e.name == ".hidden").unwrap();
        assert!(hidden.is_hidden);

        let games = storage.read_dir("/GAMES/").unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].name, "DISK.P32");
        assert!(!games[0].is_dir);
    }
}

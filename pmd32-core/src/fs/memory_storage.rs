//! In-memory storage backend for tests.
//!
//! Behaves like the FAT medium of the original device: names are matched
//! case-insensitively but listed as stored. Handles share one tree through
//! `Rc`, so a test can inspect what the engine wrote while drive slots still
//! hold open files.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::storage::{trim_dir_path, DirEntry, ImageFile, Storage};
use crate::error::{Pmd32Error, Pmd32Result};
use crate::geometry::{FORMAT_FILL, IMAGE_SIZE};

#[derive(Default)]
struct MemTree {
    /// Directory key (uppercased, no trailing slash) to display name.
    dirs: HashMap<String, String>,
    /// File key to (display name, content).
    files: HashMap<String, (String, Vec<u8>)>,
}

/// Normalized lookup key for a virtual path.
fn key_of(path: &str) -> String {
    let trimmed = trim_dir_path(path);
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_uppercase()
    }
}

/// Last path segment, as given.
fn leaf_of(path: &str) -> String {
    trim_dir_path(path)
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

fn parent_of(key: &str) -> String {
    match key.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

/// Simple in-memory filesystem.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tree: Rc<RefCell<MemTree>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let storage = Self::default();
        storage
            .tree
            .borrow_mut()
            .dirs
            .insert("/".to_string(), "/".to_string());
        storage
    }

    /// Add a directory, creating parents as needed.
    pub fn add_dir(&self, path: &str) {
        let mut tree = self.tree.borrow_mut();
        let mut partial = String::new();
        for part in trim_dir_path(path).split('/').filter(|p| !p.is_empty()) {
            partial.push('/');
            partial.push_str(part);
            tree.dirs
                .entry(key_of(&partial))
                .or_insert_with(|| part.to_string());
        }
    }

    /// Add a file with the given content, creating parent directories.
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        if let Some((parent, _)) = trim_dir_path(path).rsplit_once('/') {
            if !parent.is_empty() {
                self.add_dir(parent);
            }
        }
        self.tree
            .borrow_mut()
            .files
            .insert(key_of(path), (leaf_of(path), data.into()));
    }

    /// Add a blank, freshly formatted image.
    pub fn add_image(&self, path: &str) {
        self.add_file(path, vec![FORMAT_FILL; IMAGE_SIZE as usize]);
    }

    /// Current content of a file, for assertions.
    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree
            .borrow()
            .files
            .get(&key_of(path))
            .map(|(_, data)| data.clone())
    }
}

/// Open handle into the shared tree.
pub struct MemFile {
    tree: Rc<RefCell<MemTree>>,
    key: String,
    writable: bool,
}

impl ImageFile for MemFile {
    fn len(&self) -> u64 {
        self.tree
            .borrow()
            .files
            .get(&self.key)
            .map(|(_, data)| data.len() as u64)
            .unwrap_or(0)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Pmd32Result<usize> {
        let tree = self.tree.borrow();
        let (_, data) = tree
            .files
            .get(&self.key)
            .ok_or_else(|| Pmd32Error::NotFound(self.key.clone()))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, payload: &[u8]) -> Pmd32Result<usize> {
        if !self.writable {
            return Err(Pmd32Error::ReadOnly);
        }
        let mut tree = self.tree.borrow_mut();
        let (_, data) = tree
            .files
            .get_mut(&self.key)
            .ok_or_else(|| Pmd32Error::NotFound(self.key.clone()))?;
        let offset = offset as usize;
        if data.len() < offset + payload.len() {
            data.resize(offset + payload.len(), 0);
        }
        data[offset..offset + payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    fn flush(&mut self) -> Pmd32Result<()> {
        Ok(())
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

impl Storage for MemoryStorage {
    type File = MemFile;

    fn open(&mut self, path: &str, read_only: bool) -> Pmd32Result<Self::File> {
        let key = key_of(path);
        if !self.tree.borrow().files.contains_key(&key) {
            return Err(Pmd32Error::NotFound(path.to_string()));
        }
        Ok(MemFile {
            tree: self.tree.clone(),
            key,
            writable: !read_only,
        })
    }

    fn create(&mut self, path: &str) -> Pmd32Result<Self::File> {
        let key = key_of(path);
        self.tree
            .borrow_mut()
            .files
            .insert(key.clone(), (leaf_of(path), Vec::new()));
        Ok(MemFile {
            tree: self.tree.clone(),
            key,
            writable: true,
        })
    }

    fn exists(&self, path: &str) -> bool {
        let key = key_of(path);
        let tree = self.tree.borrow();
        tree.files.contains_key(&key) || tree.dirs.contains_key(&key)
    }

    fn chdir(&mut self, path: &str) -> bool {
        self.tree.borrow().dirs.contains_key(&key_of(path))
    }

    fn read_dir(&self, path: &str) -> Pmd32Result<Vec<DirEntry>> {
        let key = key_of(path);
        let tree = self.tree.borrow();
        if !tree.dirs.contains_key(&key) {
            return Err(Pmd32Error::NotADirectory(path.to_string()));
        }
        let mut entries = Vec::new();
        for (dir_key, name) in &tree.dirs {
            if dir_key != "/" && parent_of(dir_key) == key {
                entries.push(DirEntry {
                    name: name.clone(),
                    is_dir: true,
                    is_hidden: name.starts_with('.'),
                });
            }
        }
        for (file_key, (name, _)) in &tree.files {
            if parent_of(file_key) == key {
                entries.push(DirEntry {
                    name: name.clone(),
                    is_dir: false,
                    is_hidden: name.starts_with('.'),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

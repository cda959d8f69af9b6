//! An in-memory [`FileSystem`] for tests and synthetic hosts.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::vfs::{FileMeta, FileSystem};
use crate::{FastMap8, FileId, Result};

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    content: Vec<u8>,
    is_directory: bool,
    parent: Option<FileId>,
}

/// File ids start at 1 so that 0 never resolves.
#[derive(Debug)]
pub struct MemoryFileSystem {
    entries: Mutex<FastMap8<FileId, Entry>>,
    next_id: AtomicU32,
}

impl Default for MemoryFileSystem {
    fn default() -> MemoryFileSystem {
        MemoryFileSystem::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> MemoryFileSystem {
        MemoryFileSystem { entries: Mutex::default(), next_id: AtomicU32::new(1) }
    }

    fn insert(&self, entry: Entry) -> FileId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, entry);
        id
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> FileId {
        self.insert(Entry {
            path: path.into(),
            content: content.into(),
            is_directory: false,
            parent: None,
        })
    }

    pub fn add_directory(&self, path: impl Into<PathBuf>) -> FileId {
        self.insert(Entry { path: path.into(), content: Vec::new(), is_directory: true, parent: None })
    }

    pub fn add_file_in(
        &self,
        directory: FileId,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
    ) -> FileId {
        self.insert(Entry {
            path: path.into(),
            content: content.into(),
            is_directory: false,
            parent: Some(directory),
        })
    }

    pub fn set_content(&self, id: FileId, content: impl Into<Vec<u8>>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.content = content.into();
        }
    }

    pub fn rename(&self, id: FileId, path: impl Into<PathBuf>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.path = path.into();
        }
    }

    pub fn remove(&self, id: FileId) {
        self.entries.lock().unwrap().remove(&id);
    }
}

impl FileSystem for MemoryFileSystem {
    fn file(&self, id: FileId) -> Option<FileMeta> {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|entry| FileMeta {
            id,
            path: entry.path.clone(),
            len: entry.content.len() as u64,
            is_directory: entry.is_directory,
        })
    }

    fn children(&self, directory: FileId) -> Vec<FileMeta> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| entry.parent == Some(directory))
            .map(|(id, entry)| FileMeta {
                id: *id,
                path: entry.path.clone(),
                len: entry.content.len() as u64,
                is_directory: entry.is_directory,
            })
            .collect()
    }

    fn read(&self, id: FileId) -> Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(entry) => Ok(entry.content.clone()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, format!("no file with id {id}"))
                .into()),
        }
    }
}

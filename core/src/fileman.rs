//! Bounded pool of output files.
//!
//! Sinks may address far more files than the kernel allows open at once
//! (rolling outputs, per-sensor splits). The manager keeps at most
//! `max(kernel limit - spare, MIN_OPEN)` descriptors open; when a new open
//! would exceed the cap, the least-recently-used file is transparently
//! closed with its write offset remembered, and reopened on the next access
//! without truncating what was written.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use hashlink::LinkedHashMap;

/// Descriptors left for the rest of the process.
const SPARE_DESCRIPTORS: usize = 32;
/// The cap never drops below this many open files.
const MIN_OPEN: usize = 16;

/// Stable handle to a managed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate on first open.
    Write,
    /// Append to an existing file.
    Append,
}

struct ManagedFile {
    path: PathBuf,
    handle: Option<File>,
    /// Write position preserved across transparent closes.
    offset: u64,
    /// Set after the first real open; reopens must not truncate.
    opened_once: bool,
}

pub struct FileManager {
    max_open: usize,
    files: HashMap<FileId, ManagedFile>,
    /// Open files, least recently used first.
    open_order: LinkedHashMap<FileId, ()>,
    next_id: u64,
}

impl FileManager {
    pub fn new() -> Self {
        FileManager::with_cap(descriptor_cap())
    }

    pub fn with_cap(max_open: usize) -> Self {
        FileManager {
            max_open: max_open.max(1),
            files: HashMap::new(),
            open_order: LinkedHashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `path` and opens it, evicting the least-recently-used
    /// descriptor if the cap is reached.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, mode: OpenMode) -> Result<FileId> {
        let id = FileId(self.next_id);
        self.next_id += 1;
        let mut managed = ManagedFile {
            path: path.as_ref().to_path_buf(),
            handle: None,
            offset: 0,
            opened_once: false,
        };
        if mode == OpenMode::Append {
            // appending resumes at the current end
            managed.offset = std::fs::metadata(&managed.path).map(|m| m.len()).unwrap_or(0);
            managed.opened_once = true;
        }
        self.files.insert(id, managed);
        self.ensure_open(id)?;
        Ok(id)
    }

    /// Writes `buf` at the file's current position.
    pub fn write(&mut self, id: FileId, buf: &[u8]) -> Result<()> {
        self.ensure_open(id)?;
        let managed = self.files.get_mut(&id).expect("open checked the id");
        let handle = managed.handle.as_mut().expect("ensure_open left a handle");
        handle.write_all(buf).with_context(|| format!("writing {}", managed.path.display()))?;
        managed.offset += buf.len() as u64;
        self.touch(id);
        Ok(())
    }

    pub fn write_str(&mut self, id: FileId, s: &str) -> Result<()> {
        self.write(id, s.as_bytes())
    }

    pub fn flush(&mut self, id: FileId) -> Result<()> {
        if let Some(managed) = self.files.get_mut(&id) {
            if let Some(handle) = managed.handle.as_mut() {
                handle.flush()?;
            }
        }
        Ok(())
    }

    /// Closes and forgets `id`.
    pub fn close(&mut self, id: FileId) {
        self.open_order.remove(&id);
        self.files.remove(&id);
    }

    /// Bytes written so far.
    pub fn offset(&self, id: FileId) -> u64 {
        self.files.get(&id).map(|f| f.offset).unwrap_or(0)
    }

    /// Number of descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.open_order.len()
    }

    /// Marks `id` as most recently used.
    fn touch(&mut self, id: FileId) {
        if self.open_order.remove(&id).is_some() {
            self.open_order.insert(id, ());
        }
    }

    fn ensure_open(&mut self, id: FileId) -> Result<()> {
        let needs_open = {
            let managed = self
                .files
                .get(&id)
                .ok_or_else(|| anyhow!("file handle is closed"))?;
            managed.handle.is_none()
        };
        if !needs_open {
            self.touch(id);
            return Ok(());
        }

        while self.open_order.len() >= self.max_open {
            // transparently close the least-recently-used file
            if let Some((victim, _)) = self.open_order.pop_front() {
                if let Some(file) = self.files.get_mut(&victim) {
                    file.handle = None;
                }
            } else {
                break;
            }
        }

        let managed = self.files.get_mut(&id).expect("checked above");
        let mut options = OpenOptions::new();
        if managed.opened_once {
            // a fresh "w" would truncate what we already wrote
            options.read(true).write(true).create(true);
        } else {
            options.write(true).create(true).truncate(true);
        }
        let mut handle = options
            .open(&managed.path)
            .with_context(|| format!("opening {}", managed.path.display()))?;
        if managed.opened_once {
            handle.seek(SeekFrom::Start(managed.offset))?;
        }
        managed.opened_once = true;
        managed.handle = Some(handle);
        self.open_order.insert(id, ());
        Ok(())
    }
}

impl Default for FileManager {
    fn default() -> Self {
        FileManager::new()
    }
}

fn descriptor_cap() -> usize {
    use nix::sys::resource::{getrlimit, Resource};
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => (soft as usize).saturating_sub(SPARE_DESCRIPTORS).max(MIN_OPEN),
        Err(_) => MIN_OPEN,
    }
}

lazy_static! {
    static ref GLOBAL: Mutex<FileManager> = Mutex::new(FileManager::new());
}

/// The process-wide file manager shared by the engine and the sinks.
pub fn global() -> &'static Mutex<FileManager> {
    &GLOBAL
}

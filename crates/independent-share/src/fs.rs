//! File system handles shared between a host build and its sub-builds.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Minimal file system surface a build engine reads and writes through.
pub trait FileSystem: Send + Sync + Debug {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Remove a directory tree; a missing directory is not an error.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The three handles a compilation uses. Cloning shares the handles.
#[derive(Debug, Clone)]
pub struct FileSystems {
    pub input: Arc<dyn FileSystem>,
    pub output: Arc<dyn FileSystem>,
    pub intermediate: Arc<dyn FileSystem>,
}

impl FileSystems {
    /// Use one handle for input, output and intermediate files.
    pub fn uniform(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            input: Arc::clone(&fs),
            output: Arc::clone(&fs),
            intermediate: fs,
        }
    }

    pub fn native() -> Self {
        Self::uniform(Arc::new(NativeFileSystem))
    }

    /// Whether both values refer to the very same handles.
    pub fn shares_handles_with(&self, other: &FileSystems) -> bool {
        Arc::ptr_eq(&self.input, &other.input)
            && Arc::ptr_eq(&self.output, &other.output)
            && Arc::ptr_eq(&self.intermediate, &other.intermediate)
    }
}

impl Default for FileSystems {
    fn default() -> Self {
        Self::native()
    }
}

/// `std::fs` backed file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFileSystem;

impl FileSystem for NativeFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// In-memory file system keyed by full path. Directories are implicit.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.lock().get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.lock().insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.lock();
        files.contains_key(path) || files.keys().any(|p| p.starts_with(path))
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.lock().retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}

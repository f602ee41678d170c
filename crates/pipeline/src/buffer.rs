//! Message body storage.
//!
//! Bodies are handed around as a [`Buffer`] that can be opened for
//! reading any number of times, so the same body can be streamed into a
//! signer and later deposited into storage.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Re-readable message body.
pub trait Buffer: Send + Sync {
    /// Opens a fresh reader positioned at the first body byte.
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;

    /// Returns the body length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBuffer {
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Buffer for MemoryBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Body spooled to a file on disk.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    path: PathBuf,
    len: usize,
}

impl FileBuffer {
    /// Wraps an existing file, its current size becomes the body length.
    pub fn open_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let len = fs::metadata(&path)?.len() as usize;
        Ok(Self { path, len })
    }

    /// Writes `data` to `path` and wraps the resulting file.
    pub fn create(path: impl Into<PathBuf>, data: &[u8]) -> io::Result<Self> {
        let path = path.into();
        fs::write(&path, data)?;
        Ok(Self {
            path,
            len: data.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the backing file.
    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(self.path)
    }
}

impl Buffer for FileBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Reads the whole buffer into memory.
pub fn read_all(buffer: &dyn Buffer) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(buffer.len());
    buffer.open()?.read_to_end(&mut data)?;
    Ok(data)
}

//! File-backed message store.
//!
//! The store is one flat file holding every message received since the
//! server started, in arrival order, each with its trailing newline.
//! The file is created by the first append and removed at shutdown.
//!
//! There is no locking: the accept loop serves one connection at a time,
//! so at most one `Appender` or `Chunks` is open at any moment.

use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::iter::FusedIterator;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

/// Errors raised while appending to the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("short write to message store ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },
}

/// Append-only message log at a fixed path
#[derive(Debug, Clone)]
pub struct MessageStore {
    path: PathBuf,
}

impl MessageStore {
    /// Create a handle for the store at `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write handle on the store. The file is opened (and created if
    /// needed) by the first `append`, so a conversation that never stores
    /// anything leaves no file behind.
    pub fn appender(&self) -> Appender {
        Appender {
            path: self.path.clone(),
            file: None,
            start_len: 0,
        }
    }

    /// Open the backing file read-only and stream it in `chunk_size` pieces.
    pub fn read_all(&self, chunk_size: usize) -> io::Result<Chunks> {
        let file = File::open(&self.path)?;

        Ok(Chunks {
            file,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            done: false,
        })
    }

    /// Remove the backing file.
    pub fn delete(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Write handle on the store, opened in append mode on first use
#[derive(Debug)]
pub struct Appender {
    path: PathBuf,
    file: Option<File>,
    /// File length when the file was opened
    start_len: u64,
}

impl Appender {
    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .mode(0o644)
                    .open(&self.path)?;
                self.start_len = file.metadata()?.len();
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// Append `bytes` with a single write. A short write is an error.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let written = self.file()?.write(bytes)?;
        if written != bytes.len() {
            return Err(StoreError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        trace!(len = written, "Appended to message store");
        Ok(())
    }

    /// Drop everything appended through this handle.
    pub fn rollback(&mut self) -> io::Result<()> {
        match self.file {
            Some(ref file) => file.set_len(self.start_len),
            None => Ok(()),
        }
    }
}

/// Lazy, one-shot sequence of store chunks in file order
#[derive(Debug)]
pub struct Chunks {
    file: File,
    buf: BytesMut,
    chunk_size: usize,
    done: bool,
}

impl Iterator for Chunks {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.buf.resize(self.chunk_size, 0);
        loop {
            match self.file.read(&mut self.buf[..]) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    self.buf.truncate(n);
                    return Some(Ok(self.buf.split().freeze()));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl FusedIterator for Chunks {}

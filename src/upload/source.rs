//! Sources the multipart engine reads parts from.
//!
//! Parallel part workers each need independent access to their slice of the
//! object, so the seam is positional: a [`PartSource`] hands out any
//! `(offset, len)` window on demand, with no shared cursor to contend on.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::ApiError;

/// Positional read access to an upload source.
#[async_trait]
pub trait PartSource: Send + Sync + std::fmt::Debug {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// The engine only asks for windows inside the size it was given; a
    /// short read is an error.
    async fn read_part(&self, offset: u64, len: usize) -> Result<Bytes, ApiError>;
}

/// Part source over a file on disk.
///
/// Each read opens its own handle, so concurrent workers never share file
/// position state.
#[derive(Debug)]
pub struct FilePartSource {
    path: PathBuf,
}

impl FilePartSource {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PartSource for FilePartSource {
    async fn read_part(&self, offset: u64, len: usize) -> Result<Bytes, ApiError> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| ApiError::io(&self.path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| ApiError::io(&self.path, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| ApiError::io(&self.path, e))?;
        Ok(Bytes::from(buf))
    }
}

/// Part source over bytes already in memory.
#[derive(Debug, Clone)]
pub struct BytesPartSource {
    data: Bytes,
}

impl BytesPartSource {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Total length of the source.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the source is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl PartSource for BytesPartSource {
    async fn read_part(&self, offset: u64, len: usize) -> Result<Bytes, ApiError> {
        let start = usize::try_from(offset)
            .map_err(|_| ApiError::invalid_input("part offset out of range"))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ApiError::invalid_input("part window exceeds source length"))?;
        Ok(self.data.slice(start..end))
    }
}

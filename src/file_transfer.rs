//! Chunked file push over a data channel.
//!
//! The sender reads the file in [CHUNK_SIZE] slices, one read at a time, and
//! pushes each slice into the channel before reading the next one. There is no
//! acknowledgement, reordering or retry: ordered reliable delivery of the data
//! channel is assumed.

use crate::error::Error;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const CHUNK_SIZE: usize = 8096;

/// File description announced with a file transfer offer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub last_modified: i64,
}

/// Byte addressable file contents.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn metadata(&self) -> &FileMetadata;

    /// Reads up to `len` bytes starting at `offset`.
    async fn read_slice(&self, offset: u64, len: usize) -> Result<Bytes, Error>;
}

#[derive(Debug, Clone)]
pub struct MemoryFile {
    metadata: FileMetadata,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: &str, mime_type: &str, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        MemoryFile {
            metadata: FileMetadata {
                name: name.to_owned(),
                size: data.len() as u64,
                mime_type: mime_type.to_owned(),
                last_modified: 0,
            },
            data,
        }
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    async fn read_slice(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

#[derive(Debug, Clone)]
pub struct DiskFile {
    path: PathBuf,
    metadata: FileMetadata,
}

impl DiskFile {
    pub async fn open(path: impl Into<PathBuf>, mime_type: &str) -> Result<Self, Error> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(DiskFile {
            metadata: FileMetadata {
                name,
                size: meta.len(),
                mime_type: mime_type.to_owned(),
                last_modified,
            },
            path,
        })
    }
}

#[async_trait]
impl FileSource for DiskFile {
    fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    async fn read_slice(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = BytesMut::with_capacity(len);
        let mut handle = file.take(len as u64);
        while handle.read_buf(&mut buf).await? > 0 {}
        Ok(buf.freeze())
    }
}

/// Pushes `file` into `sink` chunk by chunk. `progress` is called with the
/// cumulative number of bytes sent after every chunk (and once with `0` for an
/// empty file). Returns the total number of bytes sent.
pub async fn send_file<S, F>(
    sink: &mut S,
    file: &dyn FileSource,
    mut progress: F,
) -> Result<u64, Error>
where
    S: Sink<Bytes, Error = Error> + Unpin,
    F: FnMut(u64),
{
    let size = file.metadata().size;
    let mut sent = 0u64;
    if size == 0 {
        progress(0);
        return Ok(0);
    }
    while sent < size {
        let len = CHUNK_SIZE.min((size - sent) as usize);
        let chunk = file.read_slice(sent, len).await?;
        if chunk.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file '{}' ended after {} bytes", file.metadata().name, sent),
            )
            .into());
        }
        sent += chunk.len() as u64;
        sink.send(chunk).await?;
        progress(sent);
    }
    Ok(sent)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveProgress {
    /// Chunk accepted, carries cumulative received size.
    Progress(u64),
    /// Chunk accepted and the declared size was reached.
    Complete(u64),
    /// Transfer already completed, the chunk was dropped.
    Ignored,
}

/// Accumulates incoming chunks of one announced file.
#[derive(Debug)]
pub struct FileReceiver {
    metadata: FileMetadata,
    buf: BytesMut,
    complete: bool,
}

impl FileReceiver {
    pub fn new(metadata: FileMetadata) -> Self {
        let capacity = metadata.size.min(64 * CHUNK_SIZE as u64) as usize;
        FileReceiver {
            metadata,
            buf: BytesMut::with_capacity(capacity),
            complete: false,
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn received(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn push(&mut self, chunk: &[u8]) -> ReceiveProgress {
        if self.complete {
            return ReceiveProgress::Ignored;
        }
        self.buf.extend_from_slice(chunk);
        let received = self.received();
        if received >= self.metadata.size {
            self.complete = true;
            ReceiveProgress::Complete(received)
        } else {
            ReceiveProgress::Progress(received)
        }
    }

    /// Received bytes, available once the transfer completed.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.complete {
            Some(std::mem::take(&mut self.buf).freeze())
        } else {
            None
        }
    }
}

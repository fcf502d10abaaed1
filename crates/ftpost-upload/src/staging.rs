//! Memory-then-disk staging for in-flight uploads.
//!
//! FTP does not announce a file's size, and the relay needs a
//! Content-Length, so every byte is held here until the transfer ends.
//! Small uploads stay in memory; past `threshold` the buffer moves to an
//! unnamed temporary file that the OS removes when the handle is dropped.

use std::io::{self, SeekFrom};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

enum Store {
    Memory(Vec<u8>),
    Spilled(File),
}

pub struct StagingBuffer {
    threshold: usize,
    len: u64,
    store: Store,
}

impl StagingBuffer {
    pub fn new(threshold: usize) -> Self {
        StagingBuffer {
            threshold,
            len: 0,
            store: Store::Memory(Vec::new()),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Store::Memory(buf) = &self.store {
            if buf.len() + data.len() > self.threshold {
                self.spill().await?;
            }
        }
        match &mut self.store {
            Store::Memory(buf) => buf.extend_from_slice(data),
            Store::Spilled(file) => file.write_all(data).await?,
        }
        self.len += data.len() as u64;
        Ok(())
    }

    async fn spill(&mut self) -> io::Result<()> {
        let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(io::Error::other)??;
        let mut file = File::from_std(std_file);
        if let Store::Memory(buf) = &self.store {
            file.write_all(buf).await?;
        }
        debug!(bytes = self.len, "staging buffer spilled to disk");
        self.store = Store::Spilled(file);
        Ok(())
    }

    /// Bytes staged so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.store, Store::Spilled(_))
    }

    /// Freeze the buffer into a readable body positioned at its start.
    pub async fn into_body(self) -> io::Result<StagedBody> {
        match self.store {
            Store::Memory(buf) => Ok(StagedBody::Memory(Bytes::from(buf))),
            Store::Spilled(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(StagedBody::File {
                    file,
                    len: self.len,
                })
            }
        }
    }
}

/// A fully staged request body of known length.
pub enum StagedBody {
    Memory(Bytes),
    File { file: File, len: u64 },
}

impl StagedBody {
    pub fn len(&self) -> u64 {
        match self {
            StagedBody::Memory(bytes) => bytes.len() as u64,
            StagedBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the body in read-sized chunks.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            StagedBody::Memory(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            StagedBody::File { file, .. } => ReaderStream::new(file).boxed(),
        }
    }

    /// Read the whole body into memory.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            StagedBody::Memory(bytes) => Ok(bytes),
            StagedBody::File { mut file, len } => {
                let mut buf = Vec::with_capacity(len as usize);
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

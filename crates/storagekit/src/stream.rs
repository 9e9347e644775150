//! Byte stream handles.
//!
//! Read handles are plain boxed `AsyncRead`s. Write handles are a
//! [`WriteStream`]: an `AsyncWrite` plus an optional writeback hook that runs
//! on [`WriteStream::close`]. Backends without random-access writes (WebDAV,
//! adapters) stage into a temp file and upload from the hook.

use futures_util::future::BoxFuture;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::Result;

/// Readable byte stream.
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Hook run once after a write handle is closed.
pub type WriteBack = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Writable byte stream.
///
/// Must be finished with [`close`](WriteStream::close). Dropping a handle
/// with a pending writeback discards the staged content.
pub struct WriteStream {
    inner: Pin<Box<dyn AsyncWrite + Send>>,
    writeback: Option<WriteBack>,
    path: String,
}

impl WriteStream {
    /// Wrap a writer that needs no writeback.
    pub fn new(path: impl Into<String>, writer: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            inner: Box::pin(writer),
            writeback: None,
            path: path.into(),
        }
    }

    /// Wrap a staging writer whose content is flushed by `writeback` on close.
    pub fn with_writeback(
        path: impl Into<String>,
        writer: impl AsyncWrite + Send + 'static,
        writeback: WriteBack,
    ) -> Self {
        Self {
            inner: Box::pin(writer),
            writeback: Some(writeback),
            path: path.into(),
        }
    }

    /// Storage path this handle writes to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush the writer and run the writeback hook.
    pub async fn close(mut self) -> Result<()> {
        self.inner.shutdown().await?;
        if let Some(writeback) = self.writeback.take() {
            writeback().await?;
        }
        Ok(())
    }

    /// Give up on the write. Staged content is discarded without writeback.
    pub fn abort(mut self) {
        self.writeback.take();
    }
}

impl AsyncWrite for WriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_shutdown(cx)
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        if self.writeback.is_some() {
            tracing::warn!(path = %self.path, "write handle dropped without close, staged content discarded");
        }
    }
}

/// Create a temp file for write emulation, optionally seeded with existing content.
///
/// The returned [`TempPath`] deletes the file when dropped or closed, so the
/// writeback owns its cleanup.
pub async fn stage_temp_file(seed: Option<ReadStream>) -> Result<(tokio::fs::File, TempPath)> {
    let (file, temp_path) = NamedTempFile::new()?.into_parts();
    let mut file = tokio::fs::File::from_std(file);
    if let Some(mut seed) = seed {
        tokio::io::copy(&mut seed, &mut file).await?;
        file.flush().await?;
    }
    Ok((file, temp_path))
}

/// Read the staged content and delete the temp file.
pub async fn take_staged(temp_path: TempPath) -> Result<Vec<u8>> {
    let content = tokio::fs::read(&temp_path).await;
    if let Err(e) = temp_path.close() {
        tracing::warn!(error = %e, "failed to remove staging file");
    }
    Ok(content?)
}

/// Open the staged content for streaming. Returns the stream and its size;
/// the temp file is deleted when the stream is dropped.
pub async fn open_staged(temp_path: TempPath) -> Result<(ReadStream, u64)> {
    let file = tokio::fs::File::open(&temp_path).await?;
    let size = file.metadata().await?.len();
    Ok((
        Box::pin(StagedReader {
            file,
            _temp: temp_path,
        }),
        size,
    ))
}

struct StagedReader {
    file: tokio::fs::File,
    _temp: TempPath,
}

impl AsyncRead for StagedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

/// Wrap an in-memory buffer as a read stream.
pub fn read_stream_from(bytes: Vec<u8>) -> ReadStream {
    Box::pin(io::Cursor::new(bytes))
}

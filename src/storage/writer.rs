//! Buffered writer returned by [`Bucket`](super::Bucket) / 缓冲写入器
//!
//! Bytes are collected up to the chunk size before being handed to the
//! driver. The driver writer is only opened on the first flush so the
//! content type can be sniffed from the first bytes when none was given.

use std::fmt;

use bytes::BytesMut;

use super::bucket::OpGuard;
use super::{DriverWriter, Error, Result, WriterOptions};
use crate::context::Context;
use crate::utils::{detect_content_type, md5_etag};

/// Writer over one object; the object appears only after [`close`](Self::close)
/// succeeds / 对象写入器
pub struct Writer {
    key: String,
    opts: WriterOptions,
    chunk_size: usize,
    buf: BytesMut,
    hasher: md5::Context,
    written: u64,
    inner: Option<Box<dyn DriverWriter>>,
    ctx: Context,
    guard: Option<OpGuard>,
    closed: bool,
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("key", &self.key)
            .field("written", &self.written)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Writer {
    pub(crate) fn new(
        key: &str,
        opts: WriterOptions,
        chunk_size: usize,
        ctx: Context,
        guard: OpGuard,
    ) -> Self {
        Self {
            key: key.to_string(),
            opts,
            chunk_size,
            buf: BytesMut::with_capacity(chunk_size.min(1024 * 1024)),
            hasher: md5::Context::new(),
            written: 0,
            inner: None,
            ctx,
            guard: Some(guard),
            closed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes accepted so far / 已写入字节数
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data`; returns the number of bytes accepted / 写入数据
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::closed(format!("write {:?}: writer is closed", self.key)));
        }
        if let Err(e) = self.ctx.check() {
            self.fail().await;
            return Err(e.context(format!("write {:?}", self.key)));
        }

        self.hasher.consume(data);
        self.written += data.len() as u64;
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let chunk = self.buf.split_to(self.chunk_size);
            if let Err(e) = self.flush(chunk).await {
                self.fail().await;
                return Err(e);
            }
        }
        Ok(data.len())
    }

    /// Flush and commit. On any error nothing is committed; calling again
    /// afterwards fails with Closed / 提交写入
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::closed(format!("close {:?}: writer already closed", self.key)));
        }
        let result = self.finish().await;
        if result.is_err() {
            self.discard().await;
        }
        self.closed = true;
        self.guard = None;
        result
    }

    /// Give up on the write; nothing becomes visible / 放弃写入
    pub async fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.discard().await;
        self.closed = true;
        self.guard = None;
        tracing::debug!("Writer aborted: {}", self.key);
    }

    async fn finish(&mut self) -> Result<()> {
        self.ctx.check().map_err(|e| e.context(format!("close {:?}", self.key)))?;

        if let Some(expected) = self.opts.content_md5 {
            let actual = std::mem::replace(&mut self.hasher, md5::Context::new()).compute();
            if actual.0 != expected {
                return Err(Error::invalid_argument(format!(
                    "close {:?}: content md5 mismatch, expected {} got {}",
                    self.key,
                    md5_etag(&expected),
                    md5_etag(&actual.0)
                )));
            }
        }

        // Flushing the remainder also creates the object when nothing was written.
        let rest = self.buf.split();
        if !rest.is_empty() || self.inner.is_none() {
            self.flush(rest).await?;
        }

        self.ctx.check().map_err(|e| e.context(format!("close {:?}", self.key)))?;
        let (Some(inner), Some(guard)) = (self.inner.take(), self.guard.as_ref()) else {
            return Err(Error::internal(format!("close {:?}: writer was not opened", self.key)));
        };
        // Commit is not raced against the context so the object is either fully
        // visible or not at all.
        inner
            .commit()
            .await
            .map_err(|e| guard.wrap(e, "close writer", &self.key))?;
        tracing::debug!("Writer committed: {} ({} bytes)", self.key, self.written);
        Ok(())
    }

    async fn flush(&mut self, chunk: BytesMut) -> Result<()> {
        let guard = match self.guard.as_ref() {
            Some(guard) => guard,
            None => return Err(Error::closed(format!("write {:?}: writer is closed", self.key))),
        };

        if self.inner.is_none() {
            let content_type = match &self.opts.content_type {
                Some(ct) => ct.clone(),
                None => detect_content_type(&self.key, &chunk),
            };
            let opened = self
                .ctx
                .run(guard.driver().new_typed_writer(&self.key, &content_type, &self.opts))
                .await
                .map_err(|e| e.context(format!("new writer {:?}", self.key)))?
                .map_err(|e| guard.wrap(e, "new writer", &self.key))?;
            self.inner = Some(opened);
        }

        if chunk.is_empty() {
            return Ok(());
        }
        let inner = match self.inner.as_mut() {
            Some(inner) => inner,
            None => return Err(Error::internal(format!("write {:?}: writer was not opened", self.key))),
        };
        self.ctx
            .run(inner.write(chunk.freeze()))
            .await
            .map_err(|e| e.context(format!("write {:?}", self.key)))?
            .map_err(|e| guard.wrap(e, "write", &self.key))
    }

    /// A failed write leaves nothing behind; later calls report Closed.
    async fn fail(&mut self) {
        self.discard().await;
        self.closed = true;
        self.guard = None;
    }

    async fn discard(&mut self) {
        self.buf.clear();
        if let Some(inner) = self.inner.take() {
            if let Err(e) = inner.abort().await {
                tracing::warn!("Discarding partial write of {} failed: {:#}", self.key, e);
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.closed {
            // The driver writer discards on drop.
            tracing::warn!("Writer for {} dropped without close, discarding {} bytes", self.key, self.written);
        }
    }
}

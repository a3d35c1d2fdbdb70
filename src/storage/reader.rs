//! Sequential reader returned by [`Bucket`](super::Bucket) / 顺序读取器

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::bucket::OpGuard;
use super::error::{from_driver, io_error_kind};
use super::{DriverReader, Error, ErrorKind, ReaderAttributes, Result};
use crate::context::Context;

enum State {
    Open(Box<dyn AsyncRead + Unpin + Send>),
    /// Stream released after an error; remembers what went wrong
    Failed(ErrorKind),
    Closed,
}

/// Forward-only reader over one object (or a range of it) / 对象读取器
pub struct Reader {
    key: String,
    attributes: ReaderAttributes,
    state: State,
    ctx: Context,
    _guard: Option<OpGuard>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("key", &self.key)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

impl Reader {
    pub(crate) fn new(key: &str, reader: DriverReader, ctx: Context, guard: OpGuard) -> Self {
        Self {
            key: key.to_string(),
            attributes: reader.attributes,
            state: State::Open(reader.stream),
            ctx,
            _guard: Some(guard),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size of the whole object / 对象大小
    pub fn size(&self) -> u64 {
        self.attributes.size
    }

    pub fn content_type(&self) -> &str {
        &self.attributes.content_type
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.attributes.mod_time
    }

    /// Read into `buf`. `Some(n)` is data (`Some(0)` only for an empty
    /// `buf`), `None` is end of stream / 读取数据
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let stream = match &mut self.state {
            State::Open(stream) => stream,
            State::Failed(kind) => {
                return Err(Error::new(*kind, format!("read {:?}: reader failed earlier", self.key)))
            }
            State::Closed => return Err(Error::closed(format!("read {:?}: reader is closed", self.key))),
        };
        if buf.is_empty() {
            return Ok(Some(0));
        }

        match self.ctx.run(stream.read(buf)).await {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => {
                let kind = io_error_kind(&e);
                self.state = State::Failed(kind);
                Err(from_driver(e.into(), kind).context(format!("read {:?}", self.key)))
            }
            Err(e) => {
                // Drop the stream so a cancelled read does not keep the connection.
                self.state = State::Failed(e.kind());
                Err(e.context(format!("read {:?}", self.key)))
            }
        }
    }

    /// Read until end of stream, appending to `out`; returns bytes read / 读到结尾
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0u8; 32 * 1024];
        let mut total = 0;
        while let Some(n) = self.read(&mut buf).await? {
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
        Ok(total)
    }

    /// Release the stream. Safe after an error; a second call fails with Closed.
    /// 关闭读取器
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(Error::closed(format!("close {:?}: reader already closed", self.key)));
        }
        self.state = State::Closed;
        self._guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::drivers::memory::MemoryDriver;
    use crate::storage::{Bucket, ErrorKind, WriterOptions};

    async fn bucket_with(key: &str, data: &[u8]) -> Bucket {
        let b = Bucket::new(Box::new(MemoryDriver::new()));
        b.write_all(&Context::background(), key, data, WriterOptions::default())
            .await
            .unwrap();
        b
    }

    #[tokio::test]
    async fn test_partial_reads_then_eof() {
        let b = bucket_with("k", b"hello world").await;
        let mut r = b.new_reader(&Context::background(), "k").await.unwrap();
        assert_eq!(r.size(), 11);

        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).await.unwrap(), Some(4));
        assert_eq!(&buf, b"hell");
        assert_eq!(r.read(&mut []).await.unwrap(), Some(0));

        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"o world");
        assert_eq!(r.read(&mut buf).await.unwrap(), None);
        r.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_range_read() {
        let b = bucket_with("k", b"0123456789").await;
        let ctx = Context::background();
        let mut r = b.new_range_reader(&ctx, "k", 3, 4).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"3456");
        assert_eq!(r.size(), 10);
        r.close().await.unwrap();

        let mut r = b.new_range_reader(&ctx, "k", 10, -1).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        r.close().await.unwrap();

        let err = b.new_range_reader(&ctx, "k", 11, -1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let b = bucket_with("k", b"abc").await;
        let mut r = b.new_reader(&Context::background(), "k").await.unwrap();
        r.close().await.unwrap();
        assert_eq!(r.close().await.unwrap_err().kind(), ErrorKind::Closed);
        let mut buf = [0u8; 2];
        assert_eq!(r.read(&mut buf).await.unwrap_err().kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_cancel_releases_stream() {
        let b = bucket_with("k", b"abc").await;
        let ctx = Context::background().child();
        let mut r = b.new_reader(&ctx, "k").await.unwrap();
        ctx.cancel();
        let mut buf = [0u8; 2];
        assert_eq!(r.read(&mut buf).await.unwrap_err().kind(), ErrorKind::Canceled);
        assert_eq!(r.read(&mut buf).await.unwrap_err().kind(), ErrorKind::Canceled);
        // Closing after an error is fine.
        r.close().await.unwrap();
    }
}

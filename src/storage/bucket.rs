//! Provider-agnostic bucket facade / 存储桶门面
//!
//! A [`Bucket`] owns exactly one driver. It validates input before anything
//! reaches the driver, runs every driver call under the caller's
//! [`Context`], and converts driver errors into the shared taxonomy.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::from_driver;
use super::list::{ListIterator, DEFAULT_PAGE_SIZE};
use super::{
    Attributes, Capability, Error, ErrorKind, ListOptions, ListPage, PageRequest, Reader, Result,
    SignedUrlOptions, StorageDriver, Writer, WriterOptions,
};
use crate::context::Context;
use crate::utils::{normalize_metadata, validate_content_type, validate_key};

pub(crate) struct BucketInner {
    driver: Box<dyn StorageDriver>,
    state: Mutex<UseState>,
}

#[derive(Default)]
struct UseState {
    closed: bool,
    /// Operations in progress plus open readers and writers / 进行中的操作数
    in_flight: usize,
}

/// Keeps the bucket marked busy for as long as it lives / 操作占用守卫
pub(crate) struct OpGuard {
    inner: Arc<BucketInner>,
}

impl OpGuard {
    pub(crate) fn driver(&self) -> &dyn StorageDriver {
        self.inner.driver.as_ref()
    }

    /// Normalize a driver error, tagging it with the operation and key.
    pub(crate) fn wrap(&self, err: anyhow::Error, op: &str, key: &str) -> Error {
        let kind = self.inner.driver.error_kind(&err);
        tracing::debug!("{} {:?} failed on {}: {:#}", op, key, self.inner.driver.name(), err);
        from_driver(err, kind).context(format!("{} {:?}", op, key))
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight -= 1;
    }
}

/// Bucket handle; clones share the same driver / 存储桶
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("driver", &self.inner.driver.name())
            .field("closed", &self.inner.state.lock().closed)
            .finish()
    }
}

impl Bucket {
    /// Wrap a driver / 包装驱动
    pub fn new(driver: Box<dyn StorageDriver>) -> Self {
        Self {
            inner: Arc::new(BucketInner {
                driver,
                state: Mutex::new(UseState::default()),
            }),
        }
    }

    /// Name of the underlying driver / 驱动名称
    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    pub fn capabilities(&self) -> Capability {
        self.inner.driver.capabilities()
    }

    fn begin(&self) -> Result<OpGuard> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::closed("bucket is closed"));
        }
        state.in_flight += 1;
        Ok(OpGuard {
            inner: self.inner.clone(),
        })
    }

    /// Open a reader over `length` bytes from `offset`; `length == -1` reads
    /// to the end of the object / 打开范围读取器
    pub async fn new_range_reader(
        &self,
        ctx: &Context,
        key: &str,
        offset: i64,
        length: i64,
    ) -> Result<Reader> {
        validate_key(key)?;
        if offset < 0 {
            return Err(Error::invalid_argument(format!("negative offset {}", offset)));
        }
        if length < -1 {
            return Err(Error::invalid_argument(format!("invalid length {}", length)));
        }
        let length = if length == -1 { None } else { Some(length as u64) };

        let guard = self.begin()?;
        let reader = ctx
            .run(guard.driver().new_range_reader(key, offset as u64, length))
            .await
            .map_err(|e| e.context(format!("new reader {:?}", key)))?
            .map_err(|e| guard.wrap(e, "new reader", key))?;
        tracing::debug!("Reader opened: {} offset={} length={:?}", key, offset, length);
        Ok(Reader::new(key, reader, ctx.clone(), guard))
    }

    /// Reader over the whole object / 打开完整读取器
    pub async fn new_reader(&self, ctx: &Context, key: &str) -> Result<Reader> {
        self.new_range_reader(ctx, key, 0, -1).await
    }

    /// Read the whole object into memory / 读取全部内容
    pub async fn read_all(&self, ctx: &Context, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.new_reader(ctx, key).await?;
        let mut data = Vec::with_capacity(reader.size() as usize);
        let read = reader.read_to_end(&mut data).await;
        let closed = reader.close().await;
        read?;
        closed?;
        Ok(data)
    }

    /// Open a writer; nothing is visible until [`Writer::close`] succeeds.
    /// 打开写入器
    pub async fn new_writer(&self, ctx: &Context, key: &str, opts: WriterOptions) -> Result<Writer> {
        validate_key(key)?;
        let mut opts = opts;
        if opts.buffer_size == Some(0) {
            return Err(Error::invalid_argument("buffer_size must be positive"));
        }
        if let Some(ct) = &opts.content_type {
            validate_content_type(ct)?;
        }
        opts.metadata = normalize_metadata(&opts.metadata)?;
        ctx.check()?;

        let guard = self.begin()?;
        let chunk_size = opts
            .buffer_size
            .unwrap_or_else(|| guard.driver().capabilities().write_chunk_size)
            .max(1);
        Ok(Writer::new(key, opts, chunk_size, ctx.clone(), guard))
    }

    /// Write `data` as the whole object and commit it / 写入全部内容
    pub async fn write_all(
        &self,
        ctx: &Context,
        key: &str,
        data: &[u8],
        opts: WriterOptions,
    ) -> Result<()> {
        let mut writer = self.new_writer(ctx, key, opts).await?;
        if let Err(e) = writer.write(data).await {
            writer.abort().await;
            return Err(e);
        }
        writer.close().await
    }

    /// Delete an object / 删除对象
    pub async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        validate_key(key)?;
        let guard = self.begin()?;
        ctx.run(guard.driver().delete(key))
            .await
            .map_err(|e| e.context(format!("delete {:?}", key)))?
            .map_err(|e| guard.wrap(e, "delete", key))?;
        tracing::debug!("Deleted: {}", key);
        Ok(())
    }

    /// Attributes snapshot / 获取对象属性
    pub async fn attributes(&self, ctx: &Context, key: &str) -> Result<Attributes> {
        validate_key(key)?;
        let guard = self.begin()?;
        let attrs = ctx
            .run(guard.driver().attributes(key))
            .await
            .map_err(|e| e.context(format!("attributes {:?}", key)))?
            .map_err(|e| guard.wrap(e, "attributes", key))?;
        Ok(attrs)
    }

    /// Whether `key` exists / 对象是否存在
    pub async fn exists(&self, ctx: &Context, key: &str) -> Result<bool> {
        match self.attributes(ctx, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy `src` to `dst` / 复制对象
    pub async fn copy(&self, ctx: &Context, dst: &str, src: &str) -> Result<()> {
        validate_key(dst)?;
        validate_key(src)?;
        let guard = self.begin()?;
        ctx.run(guard.driver().copy(dst, src))
            .await
            .map_err(|e| e.context(format!("copy {:?}", src)))?
            .map_err(|e| guard.wrap(e, "copy", src))?;
        tracing::debug!("Copied: {} -> {}", src, dst);
        Ok(())
    }

    /// Fetch one page; pass the previous page's token to continue. A page size
    /// of 0 picks the default / 获取一页列表
    pub async fn list_page(
        &self,
        ctx: &Context,
        page_token: Option<&str>,
        page_size: usize,
        opts: &ListOptions,
    ) -> Result<ListPage> {
        let guard = self.begin()?;
        let max = guard.driver().capabilities().max_page_size.max(1);
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n,
        }
        .min(max);
        let req = PageRequest {
            prefix: opts.prefix.clone(),
            delimiter: opts.delimiter.clone(),
            page_size,
            page_token: page_token.map(str::to_string),
        };
        let page = ctx
            .run(guard.driver().list_paged(&req))
            .await
            .map_err(|e| e.context(format!("list {:?}", opts.prefix)))?
            .map_err(|e| guard.wrap(e, "list", &opts.prefix))?;
        Ok(page)
    }

    /// Lazily iterate over all matching objects / 列表迭代器
    pub fn list(&self, opts: ListOptions) -> ListIterator {
        ListIterator::new(self.clone(), opts, 0)
    }

    /// Same as [`list`](Self::list) with an explicit page size.
    pub fn list_with_page_size(&self, opts: ListOptions, page_size: usize) -> ListIterator {
        ListIterator::new(self.clone(), opts, page_size)
    }

    /// Time-limited URL for `key` / 生成签名URL
    pub async fn signed_url(&self, ctx: &Context, key: &str, opts: &SignedUrlOptions) -> Result<String> {
        validate_key(key)?;
        if opts.expiry.is_zero() {
            return Err(Error::invalid_argument("signed URL expiry must be positive"));
        }
        if let Some(ct) = &opts.content_type {
            if opts.method != super::HttpMethod::Put {
                return Err(Error::invalid_argument("content_type is only allowed for PUT signed URLs"));
            }
            validate_content_type(ct)?;
        }
        let guard = self.begin()?;
        let url = ctx
            .run(guard.driver().signed_url(key, opts))
            .await
            .map_err(|e| e.context(format!("signed url {:?}", key)))?
            .map_err(|e| guard.wrap(e, "signed url", key))?;
        Ok(url)
    }

    /// Whether the bucket can be listed with the configured credentials / 是否可访问
    pub async fn is_accessible(&self, ctx: &Context) -> Result<bool> {
        match self.list_page(ctx, None, 1, &ListOptions::default()).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the driver. Fails with Closed when already closed and with
    /// FailedPrecondition while operations, readers or writers are still open.
    /// 关闭存储桶
    pub async fn close(&self) -> Result<()> {
        {
            // Checked and flipped under one lock so no operation can start in between.
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::closed("bucket already closed"));
            }
            if state.in_flight > 0 {
                return Err(Error::new(
                    ErrorKind::FailedPrecondition,
                    format!("bucket in use: {} operations or streams still open", state.in_flight),
                ));
            }
            state.closed = true;
        }
        self.inner.driver.close().await.map_err(|e| {
            let kind = self.inner.driver.error_kind(&e);
            from_driver(e, kind).context("close bucket")
        })?;
        tracing::info!("Bucket closed: {}", self.inner.driver.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;

    fn bucket() -> Bucket {
        Bucket::new(Box::new(MemoryDriver::new()))
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_fast() {
        let b = bucket();
        let ctx = Context::background();
        assert_eq!(b.read_all(&ctx, "").await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            b.new_range_reader(&ctx, "k", -1, 10).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            b.new_range_reader(&ctx, "k", 0, -2).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let opts = WriterOptions {
            content_type: Some("not a type".to_string()),
            ..Default::default()
        };
        assert_eq!(b.new_writer(&ctx, "k", opts).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_close_twice_and_use_after_close() {
        let b = bucket();
        let ctx = Context::background();
        b.close().await.unwrap();
        assert_eq!(b.close().await.unwrap_err().kind(), ErrorKind::Closed);
        assert_eq!(b.read_all(&ctx, "k").await.unwrap_err().kind(), ErrorKind::Closed);
        assert_eq!(
            b.write_all(&ctx, "k", b"x", WriterOptions::default()).await.unwrap_err().kind(),
            ErrorKind::Closed
        );
    }

    #[tokio::test]
    async fn test_close_while_reader_open_is_refused() {
        let b = bucket();
        let ctx = Context::background();
        b.write_all(&ctx, "k", b"data", WriterOptions::default()).await.unwrap();

        let mut reader = b.new_reader(&ctx, "k").await.unwrap();
        let err = b.close().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        // Still usable after the refused close.
        assert_eq!(b.read_all(&ctx, "k").await.unwrap(), b"data");
        reader.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refused_close_never_fails_concurrent_operations() {
        let b = bucket();
        let ctx = Context::background();
        b.write_all(&ctx, "k", b"data", WriterOptions::default()).await.unwrap();
        let mut reader = b.new_reader(&ctx, "k").await.unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                tokio::spawn(async move {
                    let ctx = Context::background();
                    for _ in 0..200 {
                        assert_eq!(b.read_all(&ctx, "k").await.unwrap(), b"data");
                    }
                })
            })
            .collect();
        for _ in 0..500 {
            let err = b.close().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
            tokio::task::yield_now().await;
        }
        for task in readers {
            task.await.unwrap();
        }

        reader.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(b.read_all(&ctx, "k").await.unwrap_err().kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_exists_and_copy() {
        let b = bucket();
        let ctx = Context::background();
        assert!(!b.exists(&ctx, "src").await.unwrap());
        b.write_all(&ctx, "src", b"payload", WriterOptions::default()).await.unwrap();
        b.copy(&ctx, "dst", "src").await.unwrap();
        assert!(b.exists(&ctx, "dst").await.unwrap());
        assert_eq!(b.read_all(&ctx, "dst").await.unwrap(), b"payload");
        assert_eq!(
            b.copy(&ctx, "x", "missing").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_signed_url_option_checks() {
        let b = bucket();
        let ctx = Context::background();
        let opts = SignedUrlOptions {
            expiry: std::time::Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(b.signed_url(&ctx, "k", &opts).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        let opts = SignedUrlOptions {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        assert_eq!(b.signed_url(&ctx, "k", &opts).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            b.signed_url(&ctx, "k", &SignedUrlOptions::default()).await.unwrap_err().kind(),
            ErrorKind::Unimplemented
        );
    }

    #[tokio::test]
    async fn test_cancelled_context_is_reported() {
        let b = bucket();
        let ctx = Context::background();
        ctx.cancel();
        assert_eq!(b.read_all(&ctx, "k").await.unwrap_err().kind(), ErrorKind::Canceled);
        assert_eq!(b.delete(&ctx, "k").await.unwrap_err().kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_is_accessible() {
        let b = bucket();
        assert!(b.is_accessible(&Context::background()).await.unwrap());
    }
}

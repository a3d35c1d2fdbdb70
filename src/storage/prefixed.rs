//! Driver wrapper that confines a bucket to one key prefix / 前缀视图驱动

use async_trait::async_trait;

use super::list::{decode_page_token, encode_page_token};
use super::{
    Attributes, Capability, DriverReader, DriverWriter, ErrorKind, ListPage, PageRequest,
    SignedUrlOptions, StorageDriver, WriterOptions,
};

/// Every key is implicitly `prefix + key`; listings strip the prefix again.
pub struct PrefixedDriver {
    prefix: String,
    name: String,
    inner: Box<dyn StorageDriver>,
}

impl PrefixedDriver {
    pub fn new(prefix: impl Into<String>, inner: Box<dyn StorageDriver>) -> Self {
        let prefix = prefix.into();
        let name = inner.name().to_string();
        Self { prefix, name, inner }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl StorageDriver for PrefixedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capability {
        self.inner.capabilities()
    }

    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> anyhow::Result<DriverReader> {
        self.inner.new_range_reader(&self.full_key(key), offset, length).await
    }

    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> anyhow::Result<Box<dyn DriverWriter>> {
        self.inner
            .new_typed_writer(&self.full_key(key), content_type, opts)
            .await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(&self.full_key(key)).await
    }

    async fn list_paged(&self, req: &PageRequest) -> anyhow::Result<ListPage> {
        // Tokens the caller sees are relative to the prefix as well.
        let page_token = match req.page_token.as_deref() {
            Some(token) => Some(encode_page_token(&self.full_key(&decode_page_token(token)?))),
            None => None,
        };
        let inner_req = PageRequest {
            prefix: self.full_key(&req.prefix),
            delimiter: req.delimiter.clone(),
            page_size: req.page_size,
            page_token,
        };
        let mut page = self.inner.list_paged(&inner_req).await?;
        for obj in page.objects.iter_mut() {
            if let Some(stripped) = obj.key.strip_prefix(&self.prefix) {
                obj.key = stripped.to_string();
            }
        }
        page.next_page_token = match page.next_page_token {
            Some(token) => {
                let last = decode_page_token(&token)?;
                let relative = last.strip_prefix(&self.prefix).unwrap_or(&last);
                Some(encode_page_token(relative))
            }
            None => None,
        };
        Ok(page)
    }

    async fn attributes(&self, key: &str) -> anyhow::Result<Attributes> {
        self.inner.attributes(&self.full_key(key)).await
    }

    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<String> {
        self.inner.signed_url(&self.full_key(key), opts).await
    }

    async fn copy(&self, dst: &str, src: &str) -> anyhow::Result<()> {
        self.inner.copy(&self.full_key(dst), &self.full_key(src)).await
    }

    fn error_kind(&self, err: &anyhow::Error) -> ErrorKind {
        self.inner.error_kind(err)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::drivers::memory::MemoryDriver;
    use crate::storage::{Bucket, ListOptions};

    #[tokio::test]
    async fn test_keys_are_confined_to_prefix() {
        let shared = MemoryDriver::new();
        let ctx = Context::background();
        let outer = Bucket::new(Box::new(shared.clone()));
        let inner = Bucket::new(Box::new(PrefixedDriver::new("tenant/", Box::new(shared))));

        inner.write_all(&ctx, "a.txt", b"A", Default::default()).await.unwrap();
        inner.write_all(&ctx, "b/c.txt", b"C", Default::default()).await.unwrap();
        outer.write_all(&ctx, "other.txt", b"O", Default::default()).await.unwrap();

        assert_eq!(outer.read_all(&ctx, "tenant/a.txt").await.unwrap(), b"A");
        assert!(!inner.exists(&ctx, "other.txt").await.unwrap());

        let keys: Vec<String> = inner
            .list_with_page_size(ListOptions::default(), 1)
            .collect_all(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a.txt", "b/c.txt"]);

        let opts = ListOptions {
            delimiter: "/".to_string(),
            ..Default::default()
        };
        let entries = inner.list(opts).collect_all(&ctx).await.unwrap();
        assert_eq!(entries[1].key, "b/");
        assert!(entries[1].is_dir);
    }
}

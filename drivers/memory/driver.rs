use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::RwLock;

use crate::storage::list::paginate;
use crate::storage::{
    Attributes, Capability, DriverReader, DriverWriter, Error, ErrorKind, ListObject, ListPage,
    PageRequest, ReaderAttributes, SignedUrlOptions, StorageDriver, WriterOptions,
};
use crate::utils::md5_etag;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    attrs: Attributes,
}

type Store = Arc<RwLock<BTreeMap<String, StoredObject>>>;

/// Memory driver / 内存驱动
#[derive(Clone, Default)]
pub struct MemoryDriver {
    objects: Store,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects / 对象数量
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn get(&self, key: &str) -> Result<StoredObject> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object {:?} not found", key)).into())
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &str {
        "mem"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_server_side_copy: true,
            ..Default::default()
        }
    }

    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DriverReader> {
        let obj = self.get(key)?;
        let size = obj.data.len() as u64;
        if offset > size {
            return Err(Error::invalid_argument(format!(
                "offset {} is past the end of {:?} ({} bytes)",
                offset, key, size
            ))
            .into());
        }
        let end = match length {
            Some(len) => offset.saturating_add(len).min(size),
            None => size,
        };
        let data = obj.data.slice(offset as usize..end as usize);
        Ok(DriverReader {
            stream: Box::new(std::io::Cursor::new(data)),
            attributes: ReaderAttributes {
                content_type: obj.attrs.content_type.clone(),
                mod_time: obj.attrs.mod_time,
                size,
            },
        })
    }

    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>> {
        Ok(Box::new(MemoryWriter {
            objects: self.objects.clone(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            opts: opts.clone(),
            buf: BytesMut::new(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.objects.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("object {:?} not found", key)).into()),
        }
    }

    async fn list_paged(&self, req: &PageRequest) -> Result<ListPage> {
        let objects: Vec<ListObject> = {
            let map = self.objects.read();
            map.range(req.prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&req.prefix))
                .map(|(k, obj)| ListObject {
                    key: k.clone(),
                    mod_time: Some(obj.attrs.mod_time),
                    size: obj.attrs.size,
                    md5: obj.attrs.md5,
                    is_dir: false,
                })
                .collect()
        };
        paginate(objects, req)
    }

    async fn attributes(&self, key: &str) -> Result<Attributes> {
        Ok(self.get(key)?.attrs)
    }

    async fn signed_url(&self, _key: &str, _opts: &SignedUrlOptions) -> Result<String> {
        Err(Error::unimplemented("mem buckets do not support signed URLs").into())
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        let mut map = self.objects.write();
        let mut obj = map
            .get(src)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object {:?} not found", src)))?;
        obj.attrs.mod_time = Utc::now();
        map.insert(dst.to_string(), obj);
        Ok(())
    }
}

/// Buffers everything and inserts on commit / 内存写入器
struct MemoryWriter {
    objects: Store,
    key: String,
    content_type: String,
    opts: WriterOptions,
    buf: BytesMut,
}

#[async_trait]
impl DriverWriter for MemoryWriter {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let data = self.buf.freeze();
        let md5 = md5::compute(&data).0;
        let attrs = Attributes {
            cache_control: self.opts.cache_control.clone(),
            content_disposition: self.opts.content_disposition.clone(),
            content_encoding: self.opts.content_encoding.clone(),
            content_language: self.opts.content_language.clone(),
            content_type: self.content_type.clone(),
            metadata: self.opts.metadata.clone(),
            mod_time: Utc::now(),
            size: data.len() as u64,
            md5: Some(md5),
            etag: md5_etag(&md5),
        };

        let mut map = self.objects.write();
        if self.opts.if_not_exist && map.contains_key(&self.key) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("object {:?} already exists", self.key),
            )
            .into());
        }
        map.insert(self.key.clone(), StoredObject { data, attrs });
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::classify;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_clones_share_objects() {
        let a = MemoryDriver::new();
        let b = a.clone();
        let mut w = a
            .new_typed_writer("k", "text/plain", &WriterOptions::default())
            .await
            .unwrap();
        w.write(Bytes::from_static(b"hello")).await.unwrap();
        assert!(b.is_empty());
        w.commit().await.unwrap();
        assert_eq!(b.len(), 1);

        let mut r = b.new_range_reader("k", 1, Some(3)).await.unwrap();
        let mut out = String::new();
        r.stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ell");
        assert_eq!(r.attributes.size, 5);
    }

    #[tokio::test]
    async fn test_errors() {
        let d = MemoryDriver::new();
        assert_eq!(classify(&d.attributes("nope").await.unwrap_err()), ErrorKind::NotFound);
        assert_eq!(classify(&d.delete("nope").await.unwrap_err()), ErrorKind::NotFound);
        let err = d.signed_url("k", &SignedUrlOptions::default()).await.unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Unimplemented);
    }
}

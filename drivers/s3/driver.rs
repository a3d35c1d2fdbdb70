//! S3 driver core / S3驱动核心实现
//!
//! - Reads: HEAD for attributes, then a ranged GET
//! - Writes: one PUT for small objects; multipart otherwise, 8MB parts, at
//!   most two parts buffered and two uploading / 分片上传
//! - Signed URLs through presigning / 预签名URL

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::Region;
use tokio::sync::{mpsc, oneshot};

use super::config::S3Config;
use crate::storage::error::classify;
use crate::storage::list::{decode_page_token, encode_page_token};
use crate::storage::{
    Attributes, Capability, Credential, DriverReader, DriverWriter, Error, ErrorKind, HttpMethod,
    ListObject, ListPage, PageRequest, ReaderAttributes, SignedUrlOptions, StorageDriver,
    WriterOptions,
};

const CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8MB per part (S3 minimum is 5MB)
const MAX_BUFFER_CHUNKS: usize = 2; // channel capacity
const CONCURRENT_UPLOADS: usize = 2;
/// Longest presigned URL lifetime S3 accepts (7 days)
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;
/// Largest page S3 returns for one ListObjectsV2 call
const MAX_KEYS: usize = 1000;

/// Map an S3 status code onto the shared taxonomy / 状态码分类
pub fn status_kind(code: u16) -> ErrorKind {
    match code {
        400 => ErrorKind::InvalidArgument,
        401 | 403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        409 | 412 => ErrorKind::AlreadyExists,
        416 => ErrorKind::InvalidArgument,
        501 => ErrorKind::Unimplemented,
        _ => ErrorKind::Internal,
    }
}

fn status_error(code: u16, what: &str) -> anyhow::Error {
    Error::new(status_kind(code), format!("{}: S3 returned status {}", what, code)).into()
}

fn is_success(code: u16) -> bool {
    (200..300).contains(&code)
}

/// Parse a plain (non-multipart) ETag as an MD5 digest
fn etag_md5(etag: &str) -> Option<[u8; 16]> {
    let raw = hex::decode(etag.trim_matches('"')).ok()?;
    raw.try_into().ok()
}

/// S3 driver / S3驱动
pub struct S3Driver {
    config: S3Config,
    bucket: Box<Bucket>,
    can_sign: bool,
}

impl S3Driver {
    /// Create a driver with an already resolved credential / 创建S3驱动实例
    pub fn new(config: S3Config, credential: Credential) -> Result<Self> {
        let credentials = match &credential {
            Credential::SharedKey {
                account_name,
                account_key,
            } => Credentials::new(
                Some(account_name),
                Some(account_key),
                if config.session_token.is_empty() { None } else { Some(&config.session_token) },
                None,
                None,
            )
            .map_err(|e| anyhow!("failed to build S3 credentials: {}", e))?,
            Credential::Token { .. } => {
                return Err(Error::invalid_argument("s3blob does not accept token credentials").into())
            }
            Credential::Anonymous => {
                Credentials::anonymous().map_err(|e| anyhow!("failed to build S3 credentials: {}", e))?
            }
        };
        let bucket = Self::create_bucket(&config, credentials)?;
        Ok(Self {
            config,
            bucket,
            can_sign: credential.can_sign(),
        })
    }

    /// Create S3 Bucket client / 创建S3 Bucket客户端
    fn create_bucket(config: &S3Config, credentials: Credentials) -> Result<Box<Bucket>> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.effective_endpoint(),
        };
        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| anyhow!("failed to create S3 bucket client: {}", e))?;
        Ok(if config.force_path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Client that sends `headers` on every request / 附加请求头的客户端
    fn bucket_with_headers(&self, headers: &[(String, String)]) -> Box<Bucket> {
        let mut bucket = self.bucket.clone();
        for (name, value) in headers {
            bucket.add_header(name, value);
        }
        bucket
    }

    async fn head(&self, key: &str) -> Result<s3::serde_types::HeadObjectResult> {
        let (head, code) = self.bucket.head_object(key).await?;
        if !is_success(code) {
            return Err(status_error(code, &format!("head {:?}", key)));
        }
        Ok(head)
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> &str {
        "s3blob"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_range_read: true,
            can_signed_url: self.can_sign,
            can_server_side_copy: true,
            write_chunk_size: CHUNK_SIZE,
            max_page_size: MAX_KEYS,
        }
    }

    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DriverReader> {
        let attrs = self.attributes(key).await?;
        if offset > attrs.size {
            return Err(Error::invalid_argument(format!(
                "offset {} is past the end of {:?} ({} bytes)",
                offset, key, attrs.size
            ))
            .into());
        }
        let end = match length {
            Some(len) => offset.saturating_add(len).min(attrs.size),
            None => attrs.size,
        };

        // rust-s3 hands back the whole response body; wrap it as AsyncRead.
        let data = if end == offset {
            Bytes::new()
        } else {
            let response = self.bucket.get_object_range(key, offset, Some(end - 1)).await?;
            let code = response.status_code();
            if !is_success(code) {
                return Err(status_error(code, &format!("get {:?}", key)));
            }
            response.bytes().clone()
        };
        Ok(DriverReader {
            stream: Box::new(std::io::Cursor::new(data)),
            attributes: ReaderAttributes {
                content_type: attrs.content_type,
                mod_time: attrs.mod_time,
                size: attrs.size,
            },
        })
    }

    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>> {
        let mut headers = Vec::new();
        for (name, value) in [
            ("Cache-Control", &opts.cache_control),
            ("Content-Disposition", &opts.content_disposition),
            ("Content-Encoding", &opts.content_encoding),
            ("Content-Language", &opts.content_language),
        ] {
            if let Some(value) = value {
                headers.push((name.to_string(), value.clone()));
            }
        }
        for (name, value) in &opts.metadata {
            headers.push((format!("x-amz-meta-{}", name), value.clone()));
        }
        let conditional = if opts.if_not_exist {
            vec![("If-None-Match".to_string(), "*".to_string())]
        } else {
            Vec::new()
        };
        let put_headers: Vec<_> = headers.iter().chain(conditional.iter()).cloned().collect();

        Ok(Box::new(S3Writer {
            key: key.to_string(),
            content_type: content_type.to_string(),
            parts_bucket: self.bucket.clone(),
            initiate_bucket: self.bucket_with_headers(&headers),
            put_bucket: self.bucket_with_headers(&put_headers),
            complete_bucket: self.bucket_with_headers(&conditional),
            buffer: BytesMut::new(),
            part_number: 1,
            upload: None,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // S3 deletes are idempotent; HEAD first so a missing key is NotFound.
        self.head(key).await?;
        let response = self.bucket.delete_object(key).await?;
        let code = response.status_code();
        if !is_success(code) {
            return Err(status_error(code, &format!("delete {:?}", key)));
        }
        Ok(())
    }

    async fn list_paged(&self, req: &PageRequest) -> Result<ListPage> {
        let after = match req.page_token.as_deref() {
            Some(token) => Some(decode_page_token(token)?),
            None => None,
        };
        let delimiter = if req.delimiter.is_empty() { None } else { Some(req.delimiter.clone()) };
        let start_after = after.as_deref().map(|after| list_start_after(after, &req.delimiter));
        let (result, code) = self
            .bucket
            .list_page(
                req.prefix.clone(),
                delimiter,
                None,
                start_after.clone(),
                Some(req.page_size.min(MAX_KEYS)),
            )
            .await?;
        if !is_success(code) {
            return Err(status_error(code, &format!("list {:?}", req.prefix)));
        }

        let mut objects: Vec<ListObject> = result
            .contents
            .into_iter()
            .map(|obj| ListObject {
                md5: obj.e_tag.as_deref().and_then(etag_md5),
                mod_time: DateTime::parse_from_rfc3339(&obj.last_modified)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
                size: obj.size,
                key: obj.key,
                is_dir: false,
            })
            .chain(result.common_prefixes.unwrap_or_default().into_iter().map(|cp| ListObject {
                key: cp.prefix,
                mod_time: None,
                size: 0,
                md5: None,
                is_dir: true,
            }))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        if let Some(after) = &after {
            objects.retain(|o| o.key.as_str() > after.as_str());
        }
        let next_page_token = if result.is_truncated {
            let last = objects.last().map(|o| o.key.as_str());
            Some(encode_page_token(&next_page_key(last, start_after.as_deref(), after.as_deref())))
        } else {
            None
        };
        Ok(ListPage {
            objects,
            next_page_token,
        })
    }

    async fn attributes(&self, key: &str) -> Result<Attributes> {
        let head = self.head(key).await?;
        let etag = head.e_tag.clone().unwrap_or_default();
        let mod_time = head
            .last_modified
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc2822(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let metadata: HashMap<String, String> = head
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Ok(Attributes {
            cache_control: head.cache_control,
            content_disposition: head.content_disposition,
            content_encoding: head.content_encoding,
            content_language: head.content_language,
            content_type: head
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            metadata,
            mod_time,
            size: head.content_length.unwrap_or(0).max(0) as u64,
            md5: etag_md5(&etag),
            etag,
        })
    }

    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> Result<String> {
        if !self.can_sign {
            return Err(Error::unimplemented("anonymous S3 credentials cannot presign URLs").into());
        }
        let secs = opts.expiry.as_secs().max(1);
        if secs > MAX_PRESIGN_SECS {
            return Err(Error::invalid_argument(format!(
                "S3 presigned URLs expire after at most {} seconds",
                MAX_PRESIGN_SECS
            ))
            .into());
        }
        let secs = secs as u32;
        let url = match opts.method {
            HttpMethod::Get => self.bucket.presign_get(key, secs, None).await?,
            HttpMethod::Put => {
                if opts.content_type.is_some() {
                    return Err(Error::unimplemented(
                        "s3blob cannot bind a content type into presigned PUT URLs",
                    )
                    .into());
                }
                self.bucket.presign_put(key, secs, None, None).await?
            }
            HttpMethod::Delete => self.bucket.presign_delete(key, secs).await?,
        };
        Ok(url)
    }

    /// S3 CopyObject / 服务端复制
    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        self.head(src).await?;
        // The source of copy_object_internal must be URL-encoded (non-ASCII keys).
        let encoded_src = urlencoding::encode(src);
        tracing::debug!("S3 CopyObject: src={}, encoded={}, dst={}", src, encoded_src, dst);
        let code = self.bucket.copy_object_internal(&encoded_src, dst).await?;
        if !is_success(code) {
            return Err(status_error(code, &format!("copy {:?}", src)));
        }
        Ok(())
    }

    fn error_kind(&self, err: &anyhow::Error) -> ErrorKind {
        for cause in err.chain() {
            if let Some(S3Error::HttpFailWithBody(code, _)) = cause.downcast_ref::<S3Error>() {
                return status_kind(*code);
            }
        }
        classify(err)
    }
}

/// Part message sent to the upload task / 分片数据
enum ChunkData {
    Part { part_number: u32, data: Bytes },
    Complete,
}

/// Background multipart upload started on the first full part
struct MultipartUpload {
    tx: mpsc::Sender<ChunkData>,
    result_rx: oneshot::Receiver<Result<()>>,
}

impl MultipartUpload {
    /// Result of the background task once it has stopped / 等待后台任务结果
    async fn finish(self) -> Result<()> {
        drop(self.tx);
        self.result_rx
            .await
            .unwrap_or_else(|_| Err(anyhow!("S3 upload task terminated unexpectedly")))
    }
}

/// S3 writer / S3写入器
struct S3Writer {
    key: String,
    content_type: String,
    parts_bucket: Box<Bucket>,
    initiate_bucket: Box<Bucket>,
    put_bucket: Box<Bucket>,
    complete_bucket: Box<Bucket>,
    buffer: BytesMut,
    part_number: u32,
    upload: Option<MultipartUpload>,
}

impl S3Writer {
    async fn send_part(&mut self, data: Bytes) -> Result<()> {
        if self.upload.is_none() {
            // Bounded channel: at most MAX_BUFFER_CHUNKS parts wait in memory.
            let (tx, rx) = mpsc::channel::<ChunkData>(MAX_BUFFER_CHUNKS);
            let (result_tx, result_rx) = oneshot::channel();
            let task = UploadTask {
                parts_bucket: Arc::new(self.parts_bucket.clone()),
                initiate_bucket: self.initiate_bucket.clone(),
                complete_bucket: self.complete_bucket.clone(),
                key: self.key.clone(),
                content_type: self.content_type.clone(),
            };
            tokio::spawn(async move {
                let _ = result_tx.send(task.run(rx).await);
            });
            self.upload = Some(MultipartUpload { tx, result_rx });
        }

        let part_number = self.part_number;
        self.part_number += 1;
        let sent = match &self.upload {
            Some(upload) => upload.tx.send(ChunkData::Part { part_number, data }).await.is_ok(),
            None => false,
        };
        if !sent {
            // The task stopped early; its result says why.
            return match self.upload.take() {
                Some(upload) => upload.finish().await.and(Err(anyhow!("S3 upload channel closed"))),
                None => Err(anyhow!("S3 upload channel closed")),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl DriverWriter for S3Writer {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() >= CHUNK_SIZE {
            let part = self.buffer.split_to(CHUNK_SIZE).freeze();
            self.send_part(part).await?;
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.upload.is_none() {
            let response = self
                .put_bucket
                .put_object_with_content_type(&self.key, &self.buffer, &self.content_type)
                .await?;
            let code = response.status_code();
            if !is_success(code) {
                return Err(status_error(code, &format!("put {:?}", self.key)));
            }
            tracing::debug!("S3 put done: key={}, size={}", self.key, self.buffer.len());
            return Ok(());
        }

        if !self.buffer.is_empty() {
            let rest = self.buffer.split().freeze();
            self.send_part(rest).await?;
        }
        let upload = self
            .upload
            .take()
            .ok_or_else(|| anyhow!("S3 multipart upload missing"))?;
        if upload.tx.send(ChunkData::Complete).await.is_err() {
            return upload.finish().await.and(Err(anyhow!("S3 upload channel closed")));
        }
        upload.finish().await
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        // Closing the channel without Complete makes the task abort the upload.
        match self.upload.take() {
            Some(upload) => match upload.finish().await {
                Err(e) if classify(&e) == ErrorKind::Canceled => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

/// Result of uploading a single part / 上传单个分片的结果
struct PartResult {
    part_number: u32,
    etag: String,
}

/// Multipart upload background task / 分片上传后台任务
struct UploadTask {
    parts_bucket: Arc<Box<Bucket>>,
    initiate_bucket: Box<Bucket>,
    complete_bucket: Box<Bucket>,
    key: String,
    content_type: String,
}

impl UploadTask {
    async fn run(self, rx: mpsc::Receiver<ChunkData>) -> Result<()> {
        let init = self
            .initiate_bucket
            .initiate_multipart_upload(&self.key, &self.content_type)
            .await
            .map_err(|e| anyhow!("failed to initiate multipart upload: {}", e))?;
        let upload_id = init.upload_id;
        tracing::debug!("S3 multipart upload started: key={}, upload_id={}", self.key, upload_id);

        match self.upload_parts(&upload_id, rx).await {
            Ok(parts) => self.complete(&upload_id, parts).await,
            Err(e) => {
                if let Err(abort_err) = self.parts_bucket.abort_upload(&self.key, &upload_id).await {
                    tracing::warn!("S3 abort of upload {} failed: {}", upload_id, abort_err);
                }
                tracing::debug!("S3 multipart upload aborted: key={}", self.key);
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, upload_id: &str, mut rx: mpsc::Receiver<ChunkData>) -> Result<Vec<Part>> {
        let mut completed: Vec<Part> = Vec::new();
        let mut pending = FuturesUnordered::new();

        loop {
            // Keep memory bounded: wait for a slot before taking the next part.
            while pending.len() >= CONCURRENT_UPLOADS {
                if let Some(joined) = pending.next().await {
                    completed.push(part_from(joined)?);
                }
            }
            match rx.recv().await {
                Some(ChunkData::Part { part_number, data }) => {
                    let bucket = self.parts_bucket.clone();
                    let key = self.key.clone();
                    let upload_id = upload_id.to_string();
                    let content_type = self.content_type.clone();
                    pending.push(tokio::spawn(async move {
                        tracing::debug!("S3 upload part: key={}, part={}, size={}", key, part_number, data.len());
                        let part = bucket
                            .put_multipart_chunk(data.to_vec(), &key, part_number, &upload_id, &content_type)
                            .await
                            .map_err(|e| anyhow!("failed to upload part {}: {}", part_number, e))?;
                        Ok::<_, anyhow::Error>(PartResult {
                            part_number,
                            etag: part.etag,
                        })
                    }));
                }
                Some(ChunkData::Complete) => break,
                None => return Err(Error::canceled("S3 upload abandoned before commit").into()),
            }
        }
        while let Some(joined) = pending.next().await {
            completed.push(part_from(joined)?);
        }
        completed.sort_by_key(|p| p.part_number);
        Ok(completed)
    }

    async fn complete(&self, upload_id: &str, parts: Vec<Part>) -> Result<()> {
        let response = self
            .complete_bucket
            .complete_multipart_upload(&self.key, upload_id, parts)
            .await?;
        let code = response.status_code();
        if !is_success(code) {
            return Err(status_error(code, &format!("complete upload {:?}", self.key)));
        }
        tracing::debug!("S3 multipart upload done: key={}", self.key);
        Ok(())
    }
}

fn part_from(joined: std::result::Result<Result<PartResult>, tokio::task::JoinError>) -> Result<Part> {
    let result = joined.map_err(|e| anyhow!("part upload task failed: {}", e))??;
    Ok(Part {
        part_number: result.part_number,
        etag: result.etag,
    })
}

/// `start-after` value for resuming behind `after`. A collapsed directory
/// resumes past every key underneath it, so its entries are not fetched again.
fn list_start_after(after: &str, delimiter: &str) -> String {
    if !delimiter.is_empty() && after.ends_with(delimiter) {
        format!("{}{}", after, char::MAX)
    } else {
        after.to_string()
    }
}

/// Key the next page resumes after. It always sorts past `after`, so a
/// truncated page whose entries were all dropped still makes progress.
fn next_page_key(last: Option<&str>, start_after: Option<&str>, after: Option<&str>) -> String {
    let key = last.or(start_after).unwrap_or_default();
    match after {
        Some(after) if key <= after => format!("{}{}", after, char::MAX),
        _ => key.to_string(),
    }
}

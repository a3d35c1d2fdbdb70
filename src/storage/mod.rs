use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Configuration item definition (one recognized URL query parameter) / 配置项定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    pub name: String,
    /// Display title (friendly name) / 显示标题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl ConfigItem {
    pub fn new(name: &str, item_type: &str) -> Self {
        Self {
            name: name.to_string(),
            title: None,
            item_type: item_type.to_string(),
            default: None,
            options: None,
            required: false,
            help: None,
        }
    }

    pub fn title(mut self, val: &str) -> Self {
        self.title = Some(val.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, val: &str) -> Self {
        self.default = Some(val.to_string());
        self
    }

    pub fn help(mut self, val: &str) -> Self {
        self.help = Some(val.to_string());
        self
    }

    pub fn options(mut self, val: &str) -> Self {
        self.options = Some(val.to_string());
        self
    }
}

/// Driver configuration information / 驱动配置信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whether the bucket part of the URL (host) is required / 是否需要存储桶名称
    #[serde(default)]
    pub requires_bucket: bool,
}

/// Complete driver information / 驱动完整信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    /// URL scheme the driver is registered under / URL协议
    pub scheme: String,
    /// Query parameters understood for every scheme / 通用配置项
    pub common: Vec<ConfigItem>,
    /// Driver-specific query parameters / 驱动特有配置项
    pub additional: Vec<ConfigItem>,
    /// Basic driver configuration / 驱动基本配置
    pub config: DriverConfig,
}

impl DriverInfo {
    /// Whether `name` is a query parameter this driver accepts / 是否为可识别参数
    pub fn accepts_param(&self, name: &str) -> bool {
        self.common.iter().chain(self.additional.iter()).any(|item| item.name == name)
    }
}

/// Query parameters handled by the registry itself, shared by all drivers / 通用配置项
pub fn get_common_items() -> Vec<ConfigItem> {
    vec![ConfigItem::new("prefix", "string")
        .help("Restrict the bucket to keys under this prefix")]
}

/// Driver capability declaration / 驱动能力声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Support range reading / 支持范围读取
    pub can_range_read: bool,
    /// Support signed URLs with the configured credential / 支持签名URL
    pub can_signed_url: bool,
    /// Support server-side copy (no download needed) / 支持服务端复制
    pub can_server_side_copy: bool,
    /// Bytes buffered by a writer before each flush to the driver / 写入分片大小
    pub write_chunk_size: usize,
    /// Largest page a single list call returns / 单页最大条目数
    pub max_page_size: usize,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            can_range_read: true,
            can_signed_url: false,
            can_server_side_copy: false,
            write_chunk_size: 1024 * 1024,
            max_page_size: 1000,
        }
    }
}

/// Attributes of a stored object / 对象属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: String,
    /// User metadata, keys lowercased / 用户元数据
    pub metadata: HashMap<String, String>,
    pub mod_time: DateTime<Utc>,
    pub size: u64,
    /// MD5 of the content, when the backend knows it
    pub md5: Option<[u8; 16]>,
    /// Opaque backend version tag / 版本标识
    pub etag: String,
}

/// One entry produced by listing / 列表条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListObject {
    pub key: String,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: u64,
    pub md5: Option<[u8; 16]>,
    /// Collapsed "directory" produced by the delimiter / 由分隔符折叠的目录
    pub is_dir: bool,
}

/// Listing options / 列表选项
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix / 前缀过滤
    pub prefix: String,
    /// Collapse keys sharing a segment up to this delimiter; empty disables
    pub delimiter: String,
}

/// Request for one page, as seen by drivers / 分页请求
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub prefix: String,
    pub delimiter: String,
    pub page_size: usize,
    pub page_token: Option<String>,
}

/// One page of listing results / 一页列表结果
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ListObject>,
    /// Token for the following page; `None` on the last page
    pub next_page_token: Option<String>,
}

/// Options for new writers / 写入选项
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Bytes buffered before each flush; defaults to the driver chunk size
    pub buffer_size: Option<usize>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// Detected from the key and first bytes when absent / 为空时自动检测
    pub content_type: Option<String>,
    /// Expected MD5; a mismatch fails the commit / 期望的MD5
    pub content_md5: Option<[u8; 16]>,
    pub metadata: HashMap<String, String>,
    /// Fail with AlreadyExists instead of overwriting / 仅在不存在时写入
    pub if_not_exist: bool,
}

/// HTTP method a signed URL grants / 签名URL方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(HttpMethod::Get),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

/// Options for signed URLs / 签名URL选项
#[derive(Debug, Clone)]
pub struct SignedUrlOptions {
    pub expiry: Duration,
    pub method: HttpMethod,
    /// Content type the uploader must send; PUT only
    pub content_type: Option<String>,
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(3600),
            method: HttpMethod::Get,
            content_type: None,
        }
    }
}

/// Attributes known when a reader is opened / 读取器属性
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderAttributes {
    pub content_type: String,
    pub mod_time: DateTime<Utc>,
    /// Size of the whole object, not of the requested range
    pub size: u64,
}

/// Reader handed out by a driver: the byte stream of the requested range.
pub struct DriverReader {
    pub stream: Box<dyn AsyncRead + Unpin + Send>,
    pub attributes: ReaderAttributes,
}

/// Writer handed out by a driver / 驱动写入器
///
/// Nothing written becomes visible until `commit` returns Ok. Dropping the
/// writer without committing must discard everything written.
#[async_trait]
pub trait DriverWriter: Send {
    /// Append a chunk / 追加数据
    async fn write(&mut self, data: Bytes) -> anyhow::Result<()>;

    /// Make the object visible atomically / 提交
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    /// Discard everything written / 放弃写入
    async fn abort(self: Box<Self>) -> anyhow::Result<()>;
}

/// Storage driver interface (provides only primitive operations) / 存储驱动接口
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver name / 驱动名称
    fn name(&self) -> &str;

    /// Driver capabilities / 驱动能力
    fn capabilities(&self) -> Capability;

    /// Open a reader over `length` bytes starting at `offset`; `None` reads to
    /// the end. Offset past the end of the object is InvalidArgument.
    /// 打开范围读取器
    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> anyhow::Result<DriverReader>;

    /// Open a writer for `key` / 打开写入器
    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> anyhow::Result<Box<dyn DriverWriter>>;

    /// Delete an object; NotFound if absent / 删除对象
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Return one page of results / 分页列出对象
    async fn list_paged(&self, req: &PageRequest) -> anyhow::Result<ListPage>;

    /// Attributes snapshot; NotFound if absent / 获取对象属性
    async fn attributes(&self, key: &str) -> anyhow::Result<Attributes>;

    /// Time-limited URL for `key`; Unimplemented when the backend or the
    /// credential cannot sign / 生成签名URL
    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<String>;

    /// Copy `src` to `dst` (default implementation: read then write) / 复制对象
    async fn copy(&self, dst: &str, src: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncReadExt;

        let attrs = self.attributes(src).await?;
        let mut reader = self.new_range_reader(src, 0, None).await?;
        let opts = WriterOptions {
            cache_control: attrs.cache_control.clone(),
            content_disposition: attrs.content_disposition.clone(),
            content_encoding: attrs.content_encoding.clone(),
            content_language: attrs.content_language.clone(),
            metadata: attrs.metadata.clone(),
            ..Default::default()
        };
        let mut writer = self.new_typed_writer(dst, &attrs.content_type, &opts).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.write(Bytes::copy_from_slice(&buf[..n])).await {
                let _ = writer.abort().await;
                return Err(e);
            }
        }
        writer.commit().await
    }

    /// Classify a backend error into the shared taxonomy / 错误分类
    fn error_kind(&self, err: &anyhow::Error) -> ErrorKind {
        error::classify(err)
    }

    /// Release backend resources / 释放资源
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub mod error;
pub mod credential;
pub mod signer;
pub mod list;
pub mod reader;
pub mod writer;
pub mod bucket;
pub mod prefixed;
pub mod registry;

pub use error::{Error, ErrorKind, Result};
pub use credential::{Credential, CredentialEnv};
pub use signer::UrlSigner;
pub use list::ListIterator;
pub use reader::Reader;
pub use writer::Writer;
pub use bucket::Bucket;
pub use prefixed::PrefixedDriver;
pub use registry::{UrlOpenerRegistry, RegistryBuilder, DriverFactory, DriverBox};

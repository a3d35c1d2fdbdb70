use std::collections::HashMap;
use std::io::Seek;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::storage::list::paginate;
use crate::storage::signer::SignedRequest;
use crate::storage::{
    Attributes, Capability, DriverReader, DriverWriter, Error, ErrorKind, ListObject, ListPage,
    PageRequest, ReaderAttributes, SignedUrlOptions, StorageDriver, UrlSigner, WriterOptions,
};
use crate::utils::{detect_content_type, md5_etag, validate_path_key};

/// Suffix of the JSON file holding an object's attributes / 属性文件后缀
pub const ATTRS_SUFFIX: &str = ".attrs";
/// Suffix of in-progress writes; never listed / 临时文件后缀
pub const TEMP_SUFFIX: &str = ".tmpwrite";

/// Attributes persisted next to each object / 对象属性（sidecar）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_language: Option<String>,
    content_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    /// Hex-encoded MD5 of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
}

impl FileAttrs {
    fn md5_bytes(&self) -> Option<[u8; 16]> {
        let raw = hex::decode(self.md5.as_deref()?).ok()?;
        raw.try_into().ok()
    }
}

/// Local filesystem driver / 本地文件系统驱动
pub struct LocalDriver {
    root: PathBuf,
    skip_metadata: bool,
    signer: Option<UrlSigner>,
}

impl LocalDriver {
    /// `root` must be an existing, canonical directory / 根目录须已存在
    pub fn new(root: PathBuf, skip_metadata: bool, signer: Option<UrlSigner>) -> Self {
        Self {
            root,
            skip_metadata,
            signer,
        }
    }

    /// Get root directory / 获取根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check a URL produced by `signed_url` and return what it grants.
    /// 校验签名URL
    pub fn verify_signed_url(&self, url: &str) -> crate::storage::Result<SignedRequest> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::unimplemented("file bucket has no signing credential"))?;
        let url = Url::parse(url).map_err(|e| Error::invalid_argument(format!("invalid URL: {}", e)))?;
        if url.origin() != signer.base_url().origin() || url.path() != signer.base_url().path() {
            return Err(Error::new(ErrorKind::PermissionDenied, "URL was not issued for this bucket"));
        }
        signer.verify(&url, Utc::now())
    }

    /// Map a key onto a path under the root, rejecting traversal / 键到路径映射
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_path_key(key)?;
        if key.ends_with(ATTRS_SUFFIX) || key.ends_with(TEMP_SUFFIX) {
            return Err(Error::invalid_argument(format!(
                "key {:?} uses a reserved suffix ({} or {})",
                key, ATTRS_SUFFIX, TEMP_SUFFIX
            ))
            .into());
        }
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

fn attrs_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ATTRS_SUFFIX);
    PathBuf::from(name)
}

fn not_found(key: &str) -> anyhow::Error {
    Error::not_found(format!("object {:?} not found", key)).into()
}

fn read_attrs(path: &Path) -> Result<Option<FileAttrs>> {
    match std::fs::read(attrs_path(path)) {
        Ok(raw) => {
            let attrs = serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt attributes file for {:?}", path))?;
            Ok(Some(attrs))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn system_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

/// Attributes of the file at `path`, NotFound unless it is a regular file
fn stat_object(key: &str, path: &Path, skip_metadata: bool) -> Result<Attributes> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(not_found(key)),
    };
    let stored = if skip_metadata { None } else { read_attrs(path)? };
    let stored = stored.unwrap_or_else(|| FileAttrs {
        content_type: detect_content_type(key, &[]),
        ..Default::default()
    });
    let mod_time = system_time(&meta);
    let md5 = stored.md5_bytes();
    let etag = match &md5 {
        Some(md5) => md5_etag(md5),
        None => format!(
            "\"{:x}-{:x}\"",
            mod_time.timestamp_nanos_opt().unwrap_or_default(),
            meta.len()
        ),
    };
    Ok(Attributes {
        cache_control: stored.cache_control,
        content_disposition: stored.content_disposition,
        content_encoding: stored.content_encoding,
        content_language: stored.content_language,
        content_type: stored.content_type,
        metadata: stored.metadata,
        mod_time,
        size: meta.len(),
        md5,
        etag,
    })
}

/// Create the parent directory of `path`; a file in the way is FailedPrecondition
fn ensure_parent(key: &str, path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("object path {:?} has no parent", path))?
        .to_path_buf();
    if let Err(e) = std::fs::create_dir_all(&parent) {
        return Err(Error::new(
            ErrorKind::FailedPrecondition,
            format!("cannot create directory for {:?}: {}", key, e),
        )
        .with_source(e)
        .into());
    }
    Ok(parent)
}

fn new_temp_in(dir: &Path) -> Result<tempfile::NamedTempFile> {
    Ok(tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?)
}

/// Sidecar content written and synced to a temp file, ready to be renamed
fn stage_attrs(dir: &Path, attrs: &FileAttrs) -> Result<tempfile::NamedTempFile> {
    let mut tmp = new_temp_in(dir)?;
    serde_json::to_writer(tmp.as_file_mut(), attrs)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn write_attrs(dir: &Path, path: &Path, attrs: &FileAttrs) -> Result<()> {
    stage_attrs(dir, attrs)?
        .persist(attrs_path(path))
        .map_err(|e| e.error)?;
    Ok(())
}

/// Hard link to the current content of `path`, removed again when dropped
fn backup_object(dir: &Path, path: &Path) -> Result<TempPath> {
    let link = tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .make_in(dir, |tmp| std::fs::hard_link(path, tmp))?;
    Ok(link.into_temp_path())
}

/// Put the previous content back after a failed commit, or remove the new
/// object when there was none.
fn restore_object(key: &str, path: &Path, backup: Option<TempPath>) {
    let restored = match backup {
        Some(backup) => backup.persist(path).map_err(|e| e.error),
        None => std::fs::remove_file(path),
    };
    if let Err(e) = restored {
        tracing::error!("Rolling back failed write of {} failed: {}", key, e);
    }
}

/// Walk `dir` recursively collecting regular files as keys relative to `root`
fn walk(root: &Path, dir: &Path, prefix: &str, out: &mut Vec<ListObject>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        // A prefix naming a file rather than a directory matches nothing below it.
        Err(_) if !dir.is_dir() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(ATTRS_SUFFIX) || name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            // Only descend into directories that can still hold matching keys.
            let dir_key = format!("{}/", key);
            if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                walk(root, &path, prefix, out)?;
            }
        } else if file_type.is_file() && key.starts_with(prefix) {
            let meta = entry.metadata()?;
            let md5 = read_attrs(&path).ok().flatten().and_then(|a| a.md5_bytes());
            out.push(ListObject {
                key,
                mod_time: Some(system_time(&meta)),
                size: meta.len(),
                md5,
                is_dir: false,
            });
        }
    }
    Ok(())
}

/// Remove now-empty directories between `path` and the root
fn prune_empty_dirs(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &str {
        "file"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_signed_url: self.signer.is_some(),
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
        let path = self.object_path(key)?;
        let key = key.to_string();
        let skip_metadata = self.skip_metadata;

        // Use sync IO for open and seek, as for every blocking filesystem call / 使用同步IO
        let (file, attrs) = tokio::task::spawn_blocking(move || {
            let attrs = stat_object(&key, &path, skip_metadata)?;
            if offset > attrs.size {
                return Err(Error::invalid_argument(format!(
                    "offset {} is past the end of {:?} ({} bytes)",
                    offset, key, attrs.size
                ))
                .into());
            }
            let mut file = std::fs::File::open(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => not_found(&key),
                _ => e.into(),
            })?;
            file.seek(std::io::SeekFrom::Start(offset))?;
            Ok::<_, anyhow::Error>((file, attrs))
        })
        .await??;

        let file = tokio::fs::File::from_std(file);
        let remaining = attrs.size - offset;
        let limit = length.map_or(remaining, |len| len.min(remaining));
        Ok(DriverReader {
            stream: Box::new(file.take(limit)),
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
        let path = self.object_path(key)?;
        let owned_key = key.to_string();
        let target = path.clone();
        let (dir, file, temp_path) = tokio::task::spawn_blocking(move || {
            let dir = ensure_parent(&owned_key, &target)?;
            let (file, temp_path) = new_temp_in(&dir)?.into_parts();
            Ok::<_, anyhow::Error>((dir, file, temp_path))
        })
        .await??;

        let attrs = if self.skip_metadata {
            None
        } else {
            Some(FileAttrs {
                cache_control: opts.cache_control.clone(),
                content_disposition: opts.content_disposition.clone(),
                content_encoding: opts.content_encoding.clone(),
                content_language: opts.content_language.clone(),
                content_type: content_type.to_string(),
                metadata: opts.metadata.clone(),
                md5: None,
            })
        };
        tracing::debug!("File writer opened: {:?}", temp_path);
        Ok(Box::new(LocalWriter {
            key: key.to_string(),
            path,
            dir,
            file: tokio::fs::File::from_std(file),
            temp_path,
            attrs,
            hasher: md5::Context::new(),
            if_not_exist: opts.if_not_exist,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            if !path.is_file() {
                return Err(not_found(&key));
            }
            std::fs::remove_file(&path)?;
            match std::fs::remove_file(attrs_path(&path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Removing attributes of {} failed: {}", key, e),
            }
            prune_empty_dirs(&root, &path);
            Ok(())
        })
        .await?
    }

    async fn list_paged(&self, req: &PageRequest) -> Result<ListPage> {
        let root = self.root.clone();
        let req = req.clone();
        tokio::task::spawn_blocking(move || {
            // Start from the deepest directory the prefix names.
            let start = match req.prefix.rfind('/') {
                Some(_) if req.prefix.split('/').any(|s| s == "..") => root.clone(),
                Some(idx) => req.prefix[..idx]
                    .split('/')
                    .fold(root.clone(), |path, segment| path.join(segment)),
                None => root.clone(),
            };
            let mut objects = Vec::new();
            walk(&root, &start, &req.prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            paginate(objects, &req)
        })
        .await?
    }

    async fn attributes(&self, key: &str) -> Result<Attributes> {
        let path = self.object_path(key)?;
        let key = key.to_string();
        let skip_metadata = self.skip_metadata;
        tokio::task::spawn_blocking(move || stat_object(&key, &path, skip_metadata)).await?
    }

    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> Result<String> {
        self.object_path(key)?;
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::unimplemented("file bucket needs base_url and a signing credential for signed URLs")
        })?;
        Ok(signer.sign(key, opts, Utc::now())?.to_string())
    }

    /// Server-side copy through a temp file in the destination directory / 服务端复制
    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        let src_path = self.object_path(src)?;
        let dst_path = self.object_path(dst)?;
        let (src, dst) = (src.to_string(), dst.to_string());
        tokio::task::spawn_blocking(move || {
            let mut input = match std::fs::File::open(&src_path) {
                Ok(file) if src_path.is_file() => file,
                _ => return Err(not_found(&src)),
            };
            let dir = ensure_parent(&dst, &dst_path)?;
            let mut tmp = new_temp_in(&dir)?;
            std::io::copy(&mut input, tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&dst_path).map_err(|e| e.error)?;

            match read_attrs(&src_path)? {
                Some(attrs) => write_attrs(&dir, &dst_path, &attrs)?,
                None => match std::fs::remove_file(attrs_path(&dst_path)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            Ok(())
        })
        .await?
    }
}

/// Writes into a temp file that is renamed over the target on commit / 本地写入器
struct LocalWriter {
    key: String,
    path: PathBuf,
    dir: PathBuf,
    file: tokio::fs::File,
    /// Deletes the temp file when dropped without commit
    temp_path: TempPath,
    attrs: Option<FileAttrs>,
    hasher: md5::Context,
    if_not_exist: bool,
}

#[async_trait]
impl DriverWriter for LocalWriter {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.hasher.consume(&data);
        self.file.write_all(&data).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let LocalWriter {
            key,
            path,
            dir,
            mut file,
            temp_path,
            attrs,
            hasher,
            if_not_exist,
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let attrs = attrs.map(|mut attrs| {
            attrs.md5 = Some(hex::encode(hasher.compute().0));
            attrs
        });
        tokio::task::spawn_blocking(move || {
            // Everything that can fail is done before the data is renamed into
            // place; after that only the sidecar rename remains, and a failure
            // there rolls the data back.
            let staged = match &attrs {
                Some(attrs) => Some(stage_attrs(&dir, attrs)?),
                None => None,
            };
            let backup = if !if_not_exist && path.is_file() {
                Some(backup_object(&dir, &path)?)
            } else {
                None
            };

            let persisted = if if_not_exist {
                temp_path.persist_noclobber(&path)
            } else {
                temp_path.persist(&path)
            };
            if let Err(e) = persisted {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    return Err(Error::new(
                        ErrorKind::AlreadyExists,
                        format!("object {:?} already exists", key),
                    )
                    .into());
                }
                return Err(anyhow::Error::new(e.error).context(format!("persist {:?}", key)));
            }
            let finished = match staged {
                Some(staged) => staged.persist(attrs_path(&path)).map(|_| ()).map_err(|e| e.error),
                // A stale sidecar from an earlier write must not describe the new content.
                None => match std::fs::remove_file(attrs_path(&path)) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = finished {
                restore_object(&key, &path, backup);
                return Err(anyhow::Error::new(e).context(format!("write attributes of {:?}", key)));
            }
            Ok(())
        })
        .await?
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let LocalWriter { file, temp_path, .. } = *self;
        drop(file);
        tokio::task::spawn_blocking(move || temp_path.close()).await??;
        Ok(())
    }
}

//! Application configuration module / 应用配置模块
//!
//! Named bucket URLs plus defaults, kept in a JSON file.
//! Creates a default config file on first load / 首次加载时创建默认配置文件

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::storage::{Bucket, SignedUrlOptions, UrlOpenerRegistry, WriterOptions};

/// Application configuration / 应用配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bucket name -> opener URL, e.g. `"assets": "file:///srv/assets"` / 存储桶URL
    #[serde(default)]
    pub buckets: BTreeMap<String, String>,
    /// Default lifetime of signed URLs in seconds / 签名URL默认有效期（秒）
    #[serde(default = "default_signed_url_expiry")]
    pub signed_url_expiry_secs: u64,
    /// Default writer buffer size in bytes; 0 uses the driver's chunk size
    /// 写入缓冲区大小
    #[serde(default)]
    pub write_buffer_size: usize,
}

fn default_signed_url_expiry() -> u64 {
    3600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            signed_url_expiry_secs: default_signed_url_expiry(),
            write_buffer_size: 0,
        }
    }
}

impl AppConfig {
    /// Signed URL options carrying the configured expiry / 签名URL默认选项
    pub fn signed_url_options(&self) -> SignedUrlOptions {
        SignedUrlOptions {
            expiry: Duration::from_secs(self.signed_url_expiry_secs),
            ..Default::default()
        }
    }

    /// Writer options carrying the configured buffer size / 写入默认选项
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            buffer_size: match self.write_buffer_size {
                0 => None,
                n => Some(n),
            },
            ..Default::default()
        }
    }

    /// Open every configured bucket. Buckets opened before a failure are
    /// closed again so nothing stays half-initialized / 打开全部存储桶
    pub async fn open_buckets(
        &self,
        registry: &UrlOpenerRegistry,
        ctx: &Context,
    ) -> Result<BTreeMap<String, Bucket>> {
        let mut opened = BTreeMap::new();
        for (name, url) in &self.buckets {
            match registry.open_bucket(ctx, url).await {
                Ok(bucket) => {
                    tracing::info!("Opened bucket {} ({})", name, bucket.driver_name());
                    opened.insert(name.clone(), bucket);
                }
                Err(e) => {
                    for bucket in opened.values() {
                        let _ = bucket.close().await;
                    }
                    return Err(anyhow::Error::new(e).context(format!("failed to open bucket {:?}", name)));
                }
            }
        }
        Ok(opened)
    }
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        // Load existing config / 加载现有配置
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        // Create default config / 创建默认配置
        let config = AppConfig::default();
        save_config(path, &config)?;
        tracing::info!("Created default configuration at {:?}", path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write config file {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::storage::ErrorKind;

    #[test]
    fn test_load_creates_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let config = load_config(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let mut config = config;
        config.buckets.insert("scratch".to_string(), "mem://".to_string());
        config.write_buffer_size = 4096;
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"buckets": {"a": "mem://"}}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.signed_url_expiry_secs, 3600);
        assert_eq!(config.writer_options().buffer_size, None);
        assert_eq!(config.signed_url_options().expiry, Duration::from_secs(3600));

        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_open_buckets() {
        let registry = crate::drivers::default_registry(Environment::empty());
        let ctx = Context::background();

        let mut config = AppConfig::default();
        config.buckets.insert("cache".to_string(), "mem://".to_string());
        config.buckets.insert("scratch".to_string(), "mem://?prefix=tmp/".to_string());
        let buckets = config.open_buckets(&registry, &ctx).await.unwrap();
        assert_eq!(buckets.keys().collect::<Vec<_>>(), vec!["cache", "scratch"]);

        config.buckets.insert("broken".to_string(), "ftp://nowhere".to_string());
        let err = config.open_buckets(&registry, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        let cause = err.downcast_ref::<crate::storage::Error>().unwrap();
        assert_eq!(cause.kind(), ErrorKind::InvalidArgument);
    }
}

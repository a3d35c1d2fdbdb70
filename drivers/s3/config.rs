//! S3 driver configuration / S3驱动配置

use serde::{Deserialize, Serialize};
use url::Url;

use crate::drivers::{parse_bool, query_param};
use crate::storage::Error;

/// S3 configuration / S3配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name, the host part of `s3blob://bucket` / 存储桶名称
    pub bucket: String,
    /// S3 endpoint; AWS is derived from the region when empty
    /// AWS: https://s3.{region}.amazonaws.com
    /// MinIO: http://localhost:9000
    #[serde(default)]
    pub endpoint: String,
    /// Region / 区域
    #[serde(default = "default_region")]
    pub region: String,
    /// Access Key ID; empty means "resolve from the environment"
    #[serde(default)]
    pub access_key_id: String,
    /// Secret Access Key
    #[serde(default, skip_serializing)]
    pub secret_access_key: String,
    /// Session token for temporary credentials / 临时凭证
    #[serde(default, skip_serializing)]
    pub session_token: String,
    /// Path-style addressing instead of virtual hosts; MinIO needs this
    /// 强制使用路径风格
    #[serde(default)]
    pub force_path_style: bool,
    /// Send unsigned requests (public buckets) / 匿名访问
    #[serde(default)]
    pub anonymous: bool,
}

pub(crate) fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            force_path_style: false,
            anonymous: false,
        }
    }
}

impl S3Config {
    /// Read `s3blob://bucket?region=..&endpoint=..&force_path_style=..&anonymous=..`
    /// 从URL解析配置
    pub fn from_url(url: &Url) -> anyhow::Result<Self> {
        let bucket = url.host_str().unwrap_or_default().to_string();
        if bucket.is_empty() {
            return Err(Error::invalid_argument("s3blob URL needs a bucket name").into());
        }
        let mut config = S3Config {
            bucket,
            ..Default::default()
        };
        if let Some(region) = query_param(url, "region") {
            config.region = region;
        }
        if let Some(endpoint) = query_param(url, "endpoint") {
            Url::parse(&endpoint)
                .map_err(|e| Error::invalid_argument(format!("invalid endpoint {:?}: {}", endpoint, e)))?;
            config.endpoint = endpoint;
        }
        if let Some(v) = query_param(url, "force_path_style") {
            config.force_path_style = parse_bool("force_path_style", &v)?;
        }
        if let Some(v) = query_param(url, "anonymous") {
            config.anonymous = parse_bool("anonymous", &v)?;
        }
        Ok(config)
    }

    /// Endpoint actually used for requests / 实际使用的端点
    pub fn effective_endpoint(&self) -> String {
        if self.endpoint.is_empty() {
            format!("https://s3.{}.amazonaws.com", self.region)
        } else {
            self.endpoint.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url() {
        let url = Url::parse("s3blob://photos?region=eu-west-1&force_path_style=true").unwrap();
        let config = S3Config::from_url(&url).unwrap();
        assert_eq!(config.bucket, "photos");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.force_path_style);
        assert!(!config.anonymous);
        assert_eq!(config.effective_endpoint(), "https://s3.eu-west-1.amazonaws.com");

        let url = Url::parse("s3blob://b?endpoint=http://localhost:9000").unwrap();
        let config = S3Config::from_url(&url).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.effective_endpoint(), "http://localhost:9000");
    }

    #[test]
    fn test_bad_values() {
        assert!(S3Config::from_url(&Url::parse("s3blob://b?anonymous=yes please").unwrap()).is_err());
        assert!(S3Config::from_url(&Url::parse("s3blob://b?endpoint=nope").unwrap()).is_err());
        assert!(S3Config::from_url(&Url::parse("s3blob:///key-only").unwrap()).is_err());
    }

    #[test]
    fn test_secrets_not_serialized() {
        let config = S3Config {
            bucket: "b".to_string(),
            access_key_id: "AKIA".to_string(),
            secret_access_key: "hidden".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("AKIA"));
        assert!(!json.contains("hidden"));
    }
}

//! S3 driver factory / S3驱动工厂

use anyhow::Result;
use url::Url;

use super::config::S3Config;
use super::driver::S3Driver;
use crate::environment::Environment;
use crate::storage::{ConfigItem, Credential, CredentialEnv, DriverBox, DriverConfig, DriverFactory};

/// AWS-style credential variables; S3 has no token credential / 凭证环境变量
pub const CREDENTIAL_ENV: CredentialEnv = CredentialEnv {
    account: "AWS_ACCESS_KEY_ID",
    key: "AWS_SECRET_ACCESS_KEY",
    token: None,
};

/// Passed along with the key pair for temporary credentials
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";

/// S3 driver factory / S3驱动工厂
pub struct S3DriverFactory;

impl S3DriverFactory {
    /// Build the concrete driver; `create_driver` boxes it / 创建S3驱动
    pub fn open(&self, url: &Url, env: &Environment) -> Result<S3Driver> {
        let mut config = S3Config::from_url(url)?;
        let explicit = if config.anonymous { Some(Credential::Anonymous) } else { None };
        let credential = CREDENTIAL_ENV.resolve(explicit, env, false)?;
        if let Credential::SharedKey {
            account_name,
            account_key,
        } = &credential
        {
            config.access_key_id = account_name.clone();
            config.secret_access_key = account_key.clone();
            config.session_token = env.get(SESSION_TOKEN_ENV).unwrap_or_default().to_string();
        }

        tracing::info!(
            "S3 driver initialized, bucket: {}, endpoint: {}, credential: {}",
            config.bucket,
            config.effective_endpoint(),
            credential.kind()
        );
        S3Driver::new(config, credential)
    }
}

impl DriverFactory for S3DriverFactory {
    fn driver_type(&self) -> &'static str {
        "s3blob"
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            name: "S3".to_string(),
            description: "Amazon S3 and S3-compatible object stores".to_string(),
            requires_bucket: true,
        }
    }

    fn additional_items(&self) -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("region", "string")
                .title("Region")
                .help("S3 region, e.g. us-east-1")
                .default("us-east-1"),
            ConfigItem::new("endpoint", "string")
                .title("Endpoint")
                .help("Custom endpoint URL (MinIO: http://localhost:9000)"),
            ConfigItem::new("force_path_style", "bool")
                .title("Force path style")
                .help("Required by MinIO and most self-hosted stores")
                .default("false"),
            ConfigItem::new("anonymous", "bool")
                .title("Anonymous")
                .help("Send unsigned requests, for public buckets")
                .default("false"),
        ]
    }

    fn create_driver(&self, url: &Url, env: &Environment) -> Result<DriverBox> {
        Ok(Box::new(self.open(url, env)?))
    }
}

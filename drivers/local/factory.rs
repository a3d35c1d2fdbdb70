use std::path::PathBuf;

use anyhow::Result;
use url::Url;

use super::driver::LocalDriver;
use crate::drivers::{parse_bool, query_param};
use crate::environment::Environment;
use crate::storage::{
    ConfigItem, Credential, CredentialEnv, DriverBox, DriverConfig, DriverFactory, Error, UrlSigner,
};

/// Environment variables the file driver reads credentials from / 凭证环境变量
pub const CREDENTIAL_ENV: CredentialEnv = CredentialEnv {
    account: "FILEBLOB_ACCOUNT",
    key: "FILEBLOB_KEY",
    token: Some("FILEBLOB_SAS_TOKEN"),
};

/// Account name used with a key read from `secret_key_path` when none is set
const DEFAULT_ACCOUNT: &str = "local";

/// Local driver factory / 本地驱动工厂
pub struct LocalDriverFactory;

impl LocalDriverFactory {
    /// Build the concrete driver; `create_driver` boxes it / 创建本地驱动
    pub fn open(&self, url: &Url, env: &Environment) -> Result<LocalDriver> {
        let root = url
            .to_file_path()
            .map_err(|_| Error::invalid_argument(format!("file URL {:?} has no usable path", url.as_str())))?;
        let create_dir = match query_param(url, "create_dir") {
            Some(v) => parse_bool("create_dir", &v)?,
            None => false,
        };
        let skip_metadata = match query_param(url, "metadata").as_deref() {
            None => false,
            Some("skip") => true,
            Some(other) => {
                return Err(Error::invalid_argument(format!(
                    "metadata must be \"skip\" when given, not {:?}",
                    other
                ))
                .into())
            }
        };

        let root = prepare_root(root, create_dir)?;
        let signer = match query_param(url, "base_url") {
            Some(base_url) => {
                let base_url = Url::parse(&base_url)
                    .map_err(|e| Error::invalid_argument(format!("invalid base_url {:?}: {}", base_url, e)))?;
                let explicit = match query_param(url, "secret_key_path") {
                    Some(path) => {
                        let key = std::fs::read_to_string(&path).map_err(|e| {
                            Error::invalid_argument(format!("cannot read secret_key_path {:?}: {}", path, e))
                        })?;
                        let account = env.get(CREDENTIAL_ENV.account).unwrap_or(DEFAULT_ACCOUNT);
                        Some(Credential::shared_key(account, key.trim()))
                    }
                    None => None,
                };
                let credential = CREDENTIAL_ENV.resolve(explicit, env, true)?;
                if credential.can_sign() {
                    Some(UrlSigner::new(base_url, credential)?)
                } else {
                    tracing::debug!("File bucket has base_url but no signing credential");
                    None
                }
            }
            None => None,
        };

        tracing::info!("Local driver initialized, root: {:?}", root);
        Ok(LocalDriver::new(root, skip_metadata, signer))
    }
}

fn prepare_root(root: PathBuf, create_dir: bool) -> Result<PathBuf> {
    if !root.exists() {
        if !create_dir {
            return Err(Error::not_found(format!(
                "directory {:?} does not exist (set create_dir=true to create it)",
                root
            ))
            .into());
        }
        std::fs::create_dir_all(&root)?;
    }
    if !root.is_dir() {
        return Err(Error::invalid_argument(format!("{:?} is not a directory", root)).into());
    }
    Ok(root.canonicalize()?)
}

impl DriverFactory for LocalDriverFactory {
    fn driver_type(&self) -> &'static str {
        "file"
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            name: "Local".to_string(),
            description: "Objects stored as files under a local directory".to_string(),
            requires_bucket: false,
        }
    }

    fn additional_items(&self) -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("create_dir", "bool")
                .title("Create directory")
                .default("false")
                .help("Create the root directory when it does not exist"),
            ConfigItem::new("metadata", "select")
                .title("Metadata")
                .options("skip")
                .help("skip: do not write .attrs sidecar files"),
            ConfigItem::new("base_url", "string")
                .title("Base URL")
                .help("URL that serves this directory; enables signed URLs"),
            ConfigItem::new("secret_key_path", "string")
                .title("Secret key path")
                .help("File holding the key used to sign URLs"),
        ]
    }

    fn create_driver(&self, url: &Url, env: &Environment) -> Result<DriverBox> {
        Ok(Box::new(self.open(url, env)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::classify;
    use crate::storage::{ErrorKind, HttpMethod, SignedUrlOptions, StorageDriver};

    fn url_for(dir: &std::path::Path, query: &str) -> Url {
        let mut url = Url::from_directory_path(dir).unwrap();
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        url
    }

    #[test]
    fn test_missing_root_needs_create_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested/root");

        let err = LocalDriverFactory.open(&url_for(&root, ""), &Environment::empty()).err().unwrap();
        assert_eq!(classify(&err), ErrorKind::NotFound);

        let driver = LocalDriverFactory
            .open(&url_for(&root, "create_dir=true"), &Environment::empty())
            .unwrap();
        assert!(driver.root().is_dir());
    }

    #[test]
    fn test_bad_params() {
        let tmp = tempfile::tempdir().unwrap();
        let err = LocalDriverFactory
            .open(&url_for(tmp.path(), "metadata=all"), &Environment::empty())
            .err()
            .unwrap();
        assert_eq!(classify(&err), ErrorKind::InvalidArgument);
        let err = LocalDriverFactory
            .open(&url_for(tmp.path(), "create_dir=maybe"), &Environment::empty())
            .err()
            .unwrap();
        assert_eq!(classify(&err), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_signed_url_with_secret_key_file() {
        let tmp = tempfile::tempdir().unwrap();
        let key_file = tmp.path().join("secret.key");
        std::fs::write(&key_file, "s3cr3t\n").unwrap();
        let data = tmp.path().join("data");
        let query = format!(
            "create_dir=true&base_url=https://files.example.com/dl&secret_key_path={}",
            key_file.display()
        );
        let driver = LocalDriverFactory.open(&url_for(&data, &query), &Environment::empty()).unwrap();
        assert!(driver.capabilities().can_signed_url);

        let opts = SignedUrlOptions {
            method: HttpMethod::Delete,
            ..Default::default()
        };
        let url = driver.signed_url("a/b.txt", &opts).await.unwrap();
        let granted = driver.verify_signed_url(&url).unwrap();
        assert_eq!(granted.key, "a/b.txt");
        assert_eq!(granted.method, HttpMethod::Delete);

        let forged = url.replace("https://files.example.com/dl", "https://evil.example.com/dl");
        assert_eq!(driver.verify_signed_url(&forged).unwrap_err().kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_credentials_from_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let url = url_for(tmp.path(), "base_url=https://files.example.com/");

        // Anonymous: the bucket opens but cannot sign.
        let driver = LocalDriverFactory.open(&url, &Environment::empty()).unwrap();
        let err = driver.signed_url("k", &SignedUrlOptions::default()).await.unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Unimplemented);

        let env = Environment::from_pairs([("FILEBLOB_ACCOUNT", "acct"), ("FILEBLOB_SAS_TOKEN", "sv=1")]);
        let driver = LocalDriverFactory.open(&url, &env).unwrap();
        let url = driver.signed_url("k", &SignedUrlOptions::default()).await.unwrap();
        assert!(url.contains("account=acct"));
        assert!(!url.contains("sv%3D1"));
        assert_eq!(driver.verify_signed_url(&url).unwrap().key, "k");
    }
}

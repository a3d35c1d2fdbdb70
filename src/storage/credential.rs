//! Credentials and their resolution order / 凭证与解析顺序
//!
//! Resolution is fixed for every driver:
//!
//! 1. an explicit credential (programmatic option or URL-supplied secret);
//! 2. shared key from the environment (account name + account key);
//! 3. token from the environment (account name + SAS/bearer token);
//! 4. anonymous, only for drivers that allow it.
//!
//! Anything else is a construction-time error naming the variables looked at.

use std::fmt;

use super::{Error, Result};
use crate::environment::Environment;

/// Credential variants / 凭证类型
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Account name plus secret key; can sign URLs / 共享密钥
    SharedKey {
        account_name: String,
        account_key: String,
    },
    /// Pre-issued bearer/SAS token over an anonymous transport / 令牌
    Token { account_name: String, token: String },
    /// No credential; signed URLs are unavailable / 匿名
    Anonymous,
}

impl Credential {
    pub fn shared_key(account_name: impl Into<String>, account_key: impl Into<String>) -> Self {
        Credential::SharedKey {
            account_name: account_name.into(),
            account_key: account_key.into(),
        }
    }

    pub fn token(account_name: impl Into<String>, token: impl Into<String>) -> Self {
        Credential::Token {
            account_name: account_name.into(),
            token: token.into(),
        }
    }

    /// Whether this credential can produce signed URLs / 是否可签名
    pub fn can_sign(&self) -> bool {
        !matches!(self, Credential::Anonymous)
    }

    pub fn account_name(&self) -> Option<&str> {
        match self {
            Credential::SharedKey { account_name, .. } | Credential::Token { account_name, .. } => {
                Some(account_name)
            }
            Credential::Anonymous => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SharedKey { .. } => "shared_key",
            Credential::Token { .. } => "token",
            Credential::Anonymous => "anonymous",
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey { account_name, .. } => f
                .debug_struct("SharedKey")
                .field("account_name", account_name)
                .field("account_key", &"<redacted>")
                .finish(),
            Credential::Token { account_name, .. } => f
                .debug_struct("Token")
                .field("account_name", account_name)
                .field("token", &"<redacted>")
                .finish(),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Environment variable names a driver reads credentials from / 凭证环境变量名
#[derive(Debug, Clone, Copy)]
pub struct CredentialEnv {
    pub account: &'static str,
    pub key: &'static str,
    /// `None` when the backend has no token credential
    pub token: Option<&'static str>,
}

impl CredentialEnv {
    /// Resolve a credential following the fixed precedence / 按优先级解析凭证
    pub fn resolve(
        &self,
        explicit: Option<Credential>,
        env: &Environment,
        allow_anonymous: bool,
    ) -> Result<Credential> {
        if let Some(credential) = explicit {
            tracing::debug!("Using explicit {} credential", credential.kind());
            return Ok(credential);
        }

        let account = env.get(self.account);
        let key = env.get(self.key);
        let token = self.token.and_then(|name| env.get(name));

        if let Some(key) = key {
            let account = account.ok_or_else(|| {
                Error::invalid_argument(format!("{} is set but {} is missing", self.key, self.account))
            })?;
            tracing::debug!("Using shared key credential from {}", self.key);
            return Ok(Credential::shared_key(account, key));
        }

        if let (Some(name), Some(token)) = (self.token, token) {
            let account = account.ok_or_else(|| {
                Error::invalid_argument(format!("{} is set but {} is missing", name, self.account))
            })?;
            tracing::debug!("Using token credential from {}", name);
            return Ok(Credential::token(account, token));
        }

        if allow_anonymous {
            return Ok(Credential::Anonymous);
        }

        let wanted = match self.token {
            Some(token) => format!("{} plus {} or {}", self.account, self.key, token),
            None => format!("{} and {}", self.account, self.key),
        };
        Err(Error::invalid_argument(format!("no credentials found; set {}", wanted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErrorKind;

    const NAMES: CredentialEnv = CredentialEnv {
        account: "TEST_ACCOUNT",
        key: "TEST_KEY",
        token: Some("TEST_SAS_TOKEN"),
    };

    #[test]
    fn test_explicit_wins_over_environment() {
        let env = Environment::from_pairs([("TEST_ACCOUNT", "env"), ("TEST_KEY", "k")]);
        let explicit = Credential::token("me", "sv=2020&sig=abc");
        let got = NAMES.resolve(Some(explicit.clone()), &env, false).unwrap();
        assert_eq!(got, explicit);
    }

    #[test]
    fn test_shared_key_preferred_over_token() {
        let env = Environment::from_pairs([
            ("TEST_ACCOUNT", "acct"),
            ("TEST_KEY", "secret"),
            ("TEST_SAS_TOKEN", "sig"),
        ]);
        let got = NAMES.resolve(None, &env, false).unwrap();
        assert_eq!(got, Credential::shared_key("acct", "secret"));
        assert!(got.can_sign());
    }

    #[test]
    fn test_token_from_environment() {
        let env = Environment::from_pairs([("TEST_ACCOUNT", "acct"), ("TEST_SAS_TOKEN", "sig")]);
        let got = NAMES.resolve(None, &env, false).unwrap();
        assert_eq!(got, Credential::token("acct", "sig"));
    }

    #[test]
    fn test_missing_credentials() {
        let err = NAMES.resolve(None, &Environment::empty(), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("TEST_ACCOUNT"));

        let got = NAMES.resolve(None, &Environment::empty(), true).unwrap();
        assert_eq!(got, Credential::Anonymous);
        assert!(!got.can_sign());
    }

    #[test]
    fn test_key_without_account_is_an_error() {
        let env = Environment::from_pairs([("TEST_KEY", "secret")]);
        let err = NAMES.resolve(None, &env, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let shown = format!("{:?}", Credential::shared_key("acct", "topsecret"));
        assert!(!shown.contains("topsecret"));
        assert!(shown.contains("acct"));
    }
}

//! Signed URL generation and verification / 签名URL生成与校验
//!
//! `method`, `key`, `expiry` and the optional content type are signed with
//! HMAC-SHA256, keyed by the account key of a shared-key credential or by the
//! token of a token credential. The secret itself never appears in the URL;
//! whoever serves the URL checks it with [`UrlSigner::verify`].

use chrono::{DateTime, Duration, Utc};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use super::{Credential, Error, ErrorKind, HttpMethod, Result, SignedUrlOptions};

type HmacSha256 = Hmac<Sha256>;

/// Request authorized by a verified signed URL / 校验通过的请求
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    pub key: String,
    pub method: HttpMethod,
    pub content_type: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// URL signer / 签名器
#[derive(Debug, Clone)]
pub struct UrlSigner {
    base_url: Url,
    credential: Credential,
}

impl UrlSigner {
    /// Create a signer; anonymous credentials cannot sign / 创建签名器
    pub fn new(base_url: Url, credential: Credential) -> Result<Self> {
        if !credential.can_sign() {
            return Err(Error::unimplemented("anonymous credentials cannot sign URLs"));
        }
        if base_url.cannot_be_a_base() {
            return Err(Error::invalid_argument(format!("invalid base_url {:?}", base_url.as_str())));
        }
        Ok(Self { base_url, credential })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// HMAC key of the credential / 签名密钥
    fn secret(&self) -> Result<&str> {
        match &self.credential {
            Credential::SharedKey { account_key, .. } => Ok(account_key),
            Credential::Token { token, .. } => Ok(token),
            Credential::Anonymous => Err(Error::unimplemented("anonymous credentials cannot sign URLs")),
        }
    }

    /// Generate a signed URL valid until `now + opts.expiry` / 生成签名URL
    pub fn sign(&self, key: &str, opts: &SignedUrlOptions, now: DateTime<Utc>) -> Result<Url> {
        let expiry = Duration::from_std(opts.expiry)
            .map_err(|_| Error::invalid_argument("signed URL expiry out of range"))?;
        let expires = now
            .checked_add_signed(expiry)
            .ok_or_else(|| Error::invalid_argument("signed URL expiry out of range"))?
            .timestamp();
        let secret = self.secret()?;

        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("obj", key);
            query.append_pair("expiry", &expires.to_string());
            query.append_pair("method", opts.method.as_str());
            if let Some(ct) = &opts.content_type {
                query.append_pair("content_type", ct);
            }
            if let Some(account) = self.credential.account_name() {
                query.append_pair("account", account);
            }
            let message = string_to_sign(opts.method, key, expires, opts.content_type.as_deref());
            query.append_pair("signature", &sign(secret, &message)?);
        }
        Ok(url)
    }

    /// Verify a URL produced by [`sign`](Self::sign) / 校验签名URL
    pub fn verify(&self, url: &Url, now: DateTime<Utc>) -> Result<SignedRequest> {
        let mut key = None;
        let mut expiry = None;
        let mut method = None;
        let mut content_type = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            let value = value.into_owned();
            match name.as_ref() {
                "obj" => key = Some(value),
                "expiry" => expiry = Some(value),
                "method" => method = Some(value),
                "content_type" => content_type = Some(value),
                "signature" => signature = Some(value),
                _ => {}
            }
        }

        let key = key.ok_or_else(|| Error::invalid_argument("signed URL missing obj"))?;
        let expires: i64 = expiry
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::invalid_argument("signed URL missing or bad expiry"))?;
        let method = method
            .as_deref()
            .and_then(HttpMethod::parse)
            .ok_or_else(|| Error::invalid_argument("signed URL missing or bad method"))?;
        let expires_at = DateTime::<Utc>::from_timestamp(expires, 0)
            .ok_or_else(|| Error::invalid_argument("signed URL expiry out of range"))?;

        if now.timestamp() > expires {
            return Err(Error::new(ErrorKind::PermissionDenied, "signed URL expired"));
        }

        let secret = self.secret()?;
        let signature = signature
            .ok_or_else(|| Error::new(ErrorKind::PermissionDenied, "signed URL missing signature"))?;
        let raw = URL_SAFE_NO_PAD
            .decode(signature.as_bytes())
            .map_err(|_| Error::new(ErrorKind::PermissionDenied, "invalid signature"))?;
        let message = string_to_sign(method, &key, expires, content_type.as_deref());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
        mac.update(message.as_bytes());
        mac.verify_slice(&raw)
            .map_err(|_| Error::new(ErrorKind::PermissionDenied, "invalid signature"))?;

        Ok(SignedRequest {
            key,
            method,
            content_type,
            expires_at,
        })
    }
}

fn string_to_sign(method: HttpMethod, key: &str, expires: i64, content_type: Option<&str>) -> String {
    format!("{}\n{}\n{}\n{}", method.as_str(), key, expires, content_type.unwrap_or(""))
}

fn sign(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::internal(format!("hmac key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

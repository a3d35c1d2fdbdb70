//! Key and content helpers shared by the facade and drivers / 键与内容工具函数

use std::collections::HashMap;

use crate::storage::{Error, Result};

/// Longest key accepted by the facade (bytes) / 最大键长度
pub const MAX_KEY_LEN: usize = 1024;

/// Validate a key before it reaches any driver / 校验对象键
/// 1. Must not be empty / 不能为空
/// 2. At most 1024 bytes / 不超过1024字节
/// 3. No NUL byte / 不含NUL
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "key is {} bytes, longer than {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.contains('\0') {
        return Err(Error::invalid_argument(format!("key {:?} contains a NUL byte", key)));
    }
    Ok(())
}

/// Stricter check for backends that map keys onto a directory tree / 路径型后端的键校验
/// Rejects leading `/`, backslashes, empty, `.` and `..` segments and a trailing `/`.
pub fn validate_path_key(key: &str) -> Result<()> {
    if key.starts_with('/') {
        return Err(Error::invalid_argument(format!("key {:?} must not start with '/'", key)));
    }
    if key.contains('\\') {
        return Err(Error::invalid_argument(format!("key {:?} must not contain '\\'", key)));
    }
    for segment in key.split('/') {
        match segment {
            "" => {
                return Err(Error::invalid_argument(format!("key {:?} has an empty path segment", key)))
            }
            "." | ".." => {
                return Err(Error::invalid_argument(format!("key {:?} escapes the bucket root", key)))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Lowercase metadata keys, rejecting empty and case-insensitive duplicates / 规范化元数据
pub fn normalize_metadata(metadata: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(metadata.len());
    for (k, v) in metadata {
        if k.is_empty() {
            return Err(Error::invalid_argument("metadata keys must not be empty"));
        }
        if out.insert(k.to_lowercase(), v.clone()).is_some() {
            return Err(Error::invalid_argument(format!("duplicate case-insensitive metadata key {:?}", k)));
        }
    }
    Ok(out)
}

/// Detect a content type from the key's extension, then from the first bytes
/// 根据扩展名和内容检测MIME类型
pub fn detect_content_type(key: &str, head: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(key).first() {
        return mime.essence_str().to_string();
    }
    if looks_like_text(head) {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

fn looks_like_text(head: &[u8]) -> bool {
    let head = &head[..head.len().min(512)];
    let text = match std::str::from_utf8(head) {
        Ok(s) => s,
        // A multi-byte character cut off by the 512 byte window is still text.
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&head[..e.valid_up_to()]) {
            Ok(s) => s,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    !text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

/// Validate a content type string / 校验MIME类型
pub fn validate_content_type(content_type: &str) -> Result<()> {
    content_type
        .parse::<mime_guess::mime::Mime>()
        .map(|_| ())
        .map_err(|e| Error::invalid_argument(format!("invalid content type {:?}: {}", content_type, e)))
}

/// Hex-encoded MD5 wrapped in quotes, the usual etag shape / 生成ETag
pub fn md5_etag(md5: &[u8; 16]) -> String {
    format!("\"{}\"", hex::encode(md5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErrorKind;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a/b.txt").is_ok());
        assert_eq!(validate_key("").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_path_key() {
        assert!(validate_path_key("a/b/c.txt").is_ok());
        assert!(validate_path_key("/a").is_err());
        assert!(validate_path_key("a/../b").is_err());
        assert!(validate_path_key("a//b").is_err());
        assert!(validate_path_key("a/").is_err());
        assert!(validate_path_key("a\\b").is_err());
        assert!(validate_path_key("./a").is_err());
    }

    #[test]
    fn test_normalize_metadata() {
        let mut md = HashMap::new();
        md.insert("Owner".to_string(), "alice".to_string());
        let out = normalize_metadata(&md).unwrap();
        assert_eq!(out.get("owner").map(String::as_str), Some("alice"));

        md.insert("OWNER".to_string(), "bob".to_string());
        assert!(normalize_metadata(&md).is_err());
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("a/b.json", b"{}"), "application/json");
        assert_eq!(detect_content_type("notes", b"hello world\n"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type("blob", &[0u8, 159, 146, 150]), "application/octet-stream");
    }

    #[test]
    fn test_md5_etag() {
        let digest = md5::compute(b"hello");
        assert_eq!(md5_etag(&digest.0), "\"5d41402abc4b2a76b9719d911017c592\"");
    }
}

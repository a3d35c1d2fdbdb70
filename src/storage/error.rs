//! Error taxonomy shared by every backend / 统一错误分类
//!
//! Drivers return `anyhow::Result` and keep whatever detail their SDK gives
//! them. The [`Bucket`](super::Bucket) facade converts those into [`Error`],
//! which exposes only an [`ErrorKind`] to application logic and keeps the
//! backend error as `source()` for logging.

use std::fmt;

/// Result alias used by the public API / 公共API结果类型
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error kind / 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key (or object) does not exist / 对象不存在
    NotFound,
    /// Bad key, bad range, bad URL or bad option / 参数无效
    InvalidArgument,
    /// Backend refused access / 无权限
    PermissionDenied,
    /// Conditional write found an existing object / 对象已存在
    AlreadyExists,
    /// Operation not allowed in the current state (e.g. bucket in use) / 前置条件不满足
    FailedPrecondition,
    /// Backend or transport failure / 内部错误
    Internal,
    /// Capability not supported by this backend or credential / 未实现
    Unimplemented,
    /// Context was cancelled or its deadline passed / 已取消
    Canceled,
    /// Bucket, reader or writer already closed / 已关闭
    Closed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::FailedPrecondition => "FailedPrecondition",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::Closed => "Closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blob storage error / 存储错误
#[derive(Debug, thiserror::Error)]
#[error("blob: {message} (code={kind})")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the backend error that caused this one / 附加底层错误
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Prefix the message with operation context, keeping kind and source.
    pub(crate) fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }
}

/// Classify a driver error using only generic knowledge: our own [`Error`]
/// anywhere in the chain, then `std::io::Error`. Everything else is Internal.
/// 通用错误分类
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return io_error_kind(e);
        }
    }
    ErrorKind::Internal
}

pub(crate) fn io_error_kind(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::NotFound => ErrorKind::NotFound,
        Io::PermissionDenied => ErrorKind::PermissionDenied,
        Io::AlreadyExists => ErrorKind::AlreadyExists,
        Io::InvalidInput => ErrorKind::InvalidArgument,
        _ => ErrorKind::Internal,
    }
}

/// Convert a driver error into the public taxonomy, keeping it as source.
pub(crate) fn from_driver(err: anyhow::Error, kind: ErrorKind) -> Error {
    // A driver that already produced a typed error keeps its message.
    if let Some(e) = err.downcast_ref::<Error>() {
        let message = e.message().to_string();
        return Error::new(kind, message).with_source(err);
    }
    Error::new(kind, format!("{:#}", err)).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_typed_error_in_chain() {
        let err = anyhow::Error::new(Error::not_found("missing")).context("reading blob");
        assert_eq!(classify(&err), ErrorKind::NotFound);
    }

    #[test]
    fn test_classify_io_errors() {
        let err = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(classify(&err), ErrorKind::PermissionDenied);

        let err = anyhow::anyhow!("connection reset");
        assert_eq!(classify(&err), ErrorKind::Internal);
    }

    #[test]
    fn test_from_driver_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = from_driver(anyhow::Error::new(io), ErrorKind::NotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("code=NotFound"));
    }
}

//! 服务发现错误处理模块
//!
//! 提供统一的错误类型、错误代码分类和错误转换

pub mod builder;
pub mod code;
pub mod conversions;
pub mod discovery_error;

pub use builder::ErrorBuilder;
pub use code::{ErrorCategory, ErrorCode};
pub use discovery_error::{DiscoveryError, Result};

/// 将后端错误转换为 `DiscoveryError`
pub fn map_backend_error<E, S>(error: E, code: ErrorCode, message: S) -> DiscoveryError
where
    E: std::fmt::Display,
    S: Into<String>,
{
    ErrorBuilder::new(code, message.into())
        .details(error.to_string())
        .build()
}

/// `Result` 的辅助扩展，用于给后端错误附加错误代码和上下文
pub trait BackendResultExt<T> {
    fn or_code<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>;
}

impl<T, E> BackendResultExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn or_code<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>,
    {
        self.map_err(|err| map_backend_error(err, code, message))
    }
}

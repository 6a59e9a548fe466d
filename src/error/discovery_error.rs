//! 服务发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务发现统一错误类型
///
/// 所有错误都带有错误代码，后端原始错误放在 `details` 中。
#[derive(Error, Debug, Clone)]
#[error("error [{}] {reason}", .code.as_str())]
pub struct DiscoveryError {
    code: ErrorCode,
    reason: String,
    details: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl DiscoveryError {
    /// 创建带错误代码的错误
    pub fn coded(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::with_details(code, reason, None)
    }

    pub(crate) fn with_details(
        code: ErrorCode,
        reason: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        Self {
            code,
            reason: reason.into(),
            details,
            timestamp: chrono::Utc::now(),
        }
    }

    // ============================================================
    // 便捷方法：后端传输相关错误
    // ============================================================

    /// 创建连接失败错误
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::ConnectionFailed, reason)
    }

    /// 创建网络错误
    pub fn network(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::NetworkError, reason)
    }

    /// 创建后端不可用错误
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::ServiceUnavailable, reason)
    }

    // ============================================================
    // 便捷方法：编解码与配置
    // ============================================================

    /// 创建反序列化错误
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::DeserializationError, reason)
    }

    /// 创建配置错误
    pub fn config(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::ConfigurationError, reason)
    }

    /// 创建不支持的操作错误
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::OperationNotSupported, reason)
    }

    // ============================================================
    // 便捷方法：服务发现相关错误
    // ============================================================

    /// 没有可用节点
    pub fn node_not_found(service_name: impl AsRef<str>) -> Self {
        Self::coded(
            ErrorCode::NodeNotFound,
            format!("no available node for service {}", service_name.as_ref()),
        )
    }

    /// 租约已过期
    pub fn lease_expired(lease_id: i64) -> Self {
        Self::coded(ErrorCode::LeaseExpired, format!("lease {} expired", lease_id))
    }

    /// 注册中心已关闭
    pub fn closed() -> Self {
        Self::coded(ErrorCode::RegistryClosed, "registry closed")
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// 获取错误原因
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// 获取错误详情
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// 错误发生时间
    pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        self.timestamp
    }

    /// 判断错误代码是否一致
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;

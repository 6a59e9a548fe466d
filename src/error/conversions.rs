//! 错误类型转换实现

use super::{DiscoveryError, ErrorBuilder, ErrorCode};
use std::io;

impl From<io::Error> for DiscoveryError {
    fn from(err: io::Error) -> Self {
        ErrorBuilder::new(ErrorCode::OperationFailed, "io error")
            .details(err.to_string())
            .build()
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        let code = if err.is_data() || err.is_syntax() || err.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        ErrorBuilder::new(code, format!("json error: {}", err)).build()
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        ErrorBuilder::new(ErrorCode::ConfigurationError, "invalid toml configuration")
            .details(err.to_string())
            .build()
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        let code = match &err {
            etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
                ErrorCode::ConnectionFailed
            }
            etcd_client::Error::GRpcStatus(_) => ErrorCode::ServiceUnavailable,
            _ => ErrorCode::OperationFailed,
        };
        ErrorBuilder::new(code, "etcd request failed")
            .details(err.to_string())
            .build()
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::NetworkTimeout
        } else if err.is_connect() {
            ErrorCode::ConnectionFailed
        } else if err.is_decode() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::NetworkError
        };
        ErrorBuilder::new(code, "consul request failed")
            .details(err.to_string())
            .build()
    }
}

#[cfg(feature = "zookeeper")]
impl From<zookeeper_client::Error> for DiscoveryError {
    fn from(err: zookeeper_client::Error) -> Self {
        let code = match &err {
            zookeeper_client::Error::ConnectionLoss | zookeeper_client::Error::SessionExpired => {
                ErrorCode::ConnectionFailed
            }
            _ => ErrorCode::OperationFailed,
        };
        ErrorBuilder::new(code, "zookeeper request failed")
            .details(err.to_string())
            .build()
    }
}

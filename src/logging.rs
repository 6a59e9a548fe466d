//! 日志初始化

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::{DiscoveryError, Result};

/// 初始化 tracing 日志
///
/// 环境变量 `RUST_LOG` 优先于配置中的级别；`json = true` 时输出 JSON，
/// 否则输出单行紧凑格式。全局订阅者已存在时返回配置错误。
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DiscoveryError::config(format!("invalid log level {}: {}", config.level, e)))?;

    let result = if config.json {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_thread_ids(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| DiscoveryError::config(format!("failed to install tracing subscriber: {}", e)))
}

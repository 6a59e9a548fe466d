use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::discovery::backend::Liveness;
use crate::discovery::backend::memory::WatchMode;
use crate::error::{DiscoveryError, Result};
use crate::loadbalancer::LoadBalanceStrategy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 后端配置，`type` 字段选择后端
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Etcd(EtcdConfig),
    Consul(ConsulConfig),
    Zookeeper(ZookeeperConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Etcd(_) => "etcd",
            BackendConfig::Consul(_) => "consul",
            BackendConfig::Zookeeper(_) => "zookeeper",
            BackendConfig::Memory(_) => "memory",
        }
    }
}

/// 注册中心参数（由构造时传入，不存在进程级默认值）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 租约 TTL（秒）
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// 连接后端的超时（秒）
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// 订阅通道容量
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

fn default_lease_ttl() -> u64 {
    10
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_watch_buffer() -> usize {
    64
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            dial_timeout_secs: default_dial_timeout(),
            watch_buffer: default_watch_buffer(),
        }
    }
}

impl RegistryConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "/services/".to_string()
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            key_prefix: default_key_prefix(),
        }
    }
}

/// ZooKeeper 后端配置
///
/// 节点以临时节点存放在 `{base_path}/{服务名}/{地址}:{端口}`，随会话消失。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZookeeperConfig {
    /// `host:port` 列表
    pub servers: Vec<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "/services".to_string()
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:2181".to_string()],
            base_path: default_base_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_address")]
    pub address: String,
    /// TCP 健康检查间隔（秒）
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// TCP 健康检查超时（秒）
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    /// 检查持续失败多久后由 Consul 注销（秒）
    #[serde(default = "default_deregister_after")]
    pub deregister_critical_after_secs: u64,
    /// 阻塞查询等待时间（秒）
    #[serde(default = "default_wait")]
    pub wait_secs: u64,
    /// 监听失败后的重试间隔（秒）
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_consul_address() -> String {
    "http://localhost:8500".to_string()
}

fn default_check_interval() -> u64 {
    5
}

fn default_check_timeout() -> u64 {
    5
}

fn default_deregister_after() -> u64 {
    30
}

fn default_wait() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    5
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            check_interval_secs: default_check_interval(),
            check_timeout_secs: default_check_timeout(),
            deregister_critical_after_secs: default_deregister_after(),
            wait_secs: default_wait(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

impl ConsulConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn deregister_critical_after(&self) -> Duration {
        Duration::from_secs(self.deregister_critical_after_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub mode: WatchMode,
    /// 为 true 时模拟委托存活（不申请租约）
    #[serde(default)]
    pub delegated: bool,
}

impl MemoryConfig {
    pub fn liveness(&self) -> Liveness {
        if self.delegated {
            Liveness::Delegated
        } else {
            Liveness::Lease
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 使用内存后端的配置（本地开发和测试）
    pub fn memory() -> Self {
        Self {
            backend: BackendConfig::Memory(MemoryConfig::default()),
            registry: RegistryConfig::default(),
            load_balance: LoadBalanceStrategy::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.lease_ttl_secs == 0 {
            return Err(DiscoveryError::config("registry.lease_ttl_secs must be positive"));
        }
        if self.registry.watch_buffer == 0 {
            return Err(DiscoveryError::config("registry.watch_buffer must be positive"));
        }
        match &self.backend {
            BackendConfig::Etcd(etcd) => {
                if etcd.endpoints.is_empty() {
                    return Err(DiscoveryError::config("etcd endpoints not configured"));
                }
            }
            BackendConfig::Consul(consul) => {
                if consul.address.trim().is_empty() {
                    return Err(DiscoveryError::config("consul address not configured"));
                }
            }
            BackendConfig::Zookeeper(zookeeper) => {
                if zookeeper.servers.is_empty() {
                    return Err(DiscoveryError::config("zookeeper servers not configured"));
                }
                let base = zookeeper.base_path.trim_end_matches('/');
                if !base.starts_with('/') || base.len() < 2 {
                    return Err(DiscoveryError::config(format!(
                        "zookeeper base_path must be an absolute non-root path, got {:?}",
                        zookeeper.base_path
                    )));
                }
            }
            BackendConfig::Memory(_) => {}
        }
        Ok(())
    }
}

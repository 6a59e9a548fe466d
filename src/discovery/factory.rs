//! 服务发现工厂
//!
//! 根据 [`DiscoveryConfig`] 构建后端、注册中心和解析器。

use std::sync::Arc;
use tracing::info;

use crate::client::Resolver;
use crate::config::{BackendConfig, DiscoveryConfig};
use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::backend::memory::MemoryBackend;
use crate::discovery::registry::Registry;
use crate::error::{DiscoveryError, Result};

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建后端
    pub async fn create_backend(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        config.validate()?;
        match &config.backend {
            #[cfg(feature = "etcd")]
            BackendConfig::Etcd(etcd) => {
                let backend =
                    crate::discovery::backend::etcd::EtcdBackend::connect(etcd, &config.registry)
                        .await?;
                Ok(Arc::new(backend))
            }
            #[cfg(feature = "consul")]
            BackendConfig::Consul(consul) => {
                let backend = crate::discovery::backend::consul::ConsulBackend::new(
                    consul.clone(),
                    &config.registry,
                )?;
                Ok(Arc::new(backend))
            }
            #[cfg(feature = "zookeeper")]
            BackendConfig::Zookeeper(zookeeper) => {
                let backend = crate::discovery::backend::zookeeper::ZookeeperBackend::connect(
                    zookeeper,
                    &config.registry,
                )
                .await?;
                Ok(Arc::new(backend))
            }
            BackendConfig::Memory(memory) => {
                let backend = MemoryBackend::new()
                    .with_mode(memory.mode)
                    .with_liveness(memory.liveness())
                    .with_buffer(config.registry.watch_buffer);
                Ok(Arc::new(backend))
            }
            #[allow(unreachable_patterns)]
            other => Err(DiscoveryError::unsupported(format!(
                "{} backend is not enabled, rebuild with the `{}` feature",
                other.name(),
                other.name()
            ))),
        }
    }

    /// 从配置创建注册中心
    pub async fn create_registry(config: &DiscoveryConfig) -> Result<Arc<Registry>> {
        let backend = Self::create_backend(config).await?;
        info!(
            backend = backend.name(),
            lease_ttl_secs = config.registry.lease_ttl_secs,
            "Registry created"
        );
        Ok(Arc::new(Registry::new(backend, config.registry.clone())))
    }

    /// 在注册中心之上创建解析器，每个服务按配置的策略使用独立的均衡器
    pub fn create_resolver(config: &DiscoveryConfig, registry: Arc<Registry>) -> Resolver {
        Resolver::per_service(registry, config.load_balance)
    }
}

//! 服务发现客户端
//!
//! 组合注册中心和负载均衡器：查询节点后选出一个。

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::discovery::node::ServiceNode;
use crate::discovery::registry::NodeRegistry;
use crate::error::{DiscoveryError, Result};
use crate::loadbalancer::{LoadBalanceStrategy, LoadBalancer};

enum Balancers {
    /// 所有服务共用一个均衡器
    Shared(Arc<dyn LoadBalancer>),
    /// 每个服务一个均衡器，首次解析时按策略创建
    PerService {
        strategy: LoadBalanceStrategy,
        balancers: DashMap<String, Arc<dyn LoadBalancer>>,
    },
}

/// 服务解析器
pub struct Resolver {
    registry: Arc<dyn NodeRegistry>,
    balancers: Balancers,
}

impl Resolver {
    /// 所有服务共用 `balancer`
    ///
    /// 有状态的均衡器（轮询、加权轮询）在不同服务间切换时会互相干扰，
    /// 解析多个服务时建议使用 [`Resolver::per_service`]。
    pub fn new(registry: Arc<dyn NodeRegistry>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            registry,
            balancers: Balancers::Shared(balancer),
        }
    }

    /// 每个服务使用独立的均衡器
    pub fn per_service(registry: Arc<dyn NodeRegistry>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            balancers: Balancers::PerService {
                strategy,
                balancers: DashMap::new(),
            },
        }
    }

    pub fn registry(&self) -> &Arc<dyn NodeRegistry> {
        &self.registry
    }

    fn balancer_for(&self, service_name: &str) -> Arc<dyn LoadBalancer> {
        match &self.balancers {
            Balancers::Shared(balancer) => balancer.clone(),
            Balancers::PerService {
                strategy,
                balancers,
            } => balancers
                .entry(service_name.to_string())
                .or_insert_with(|| strategy.build())
                .clone(),
        }
    }

    /// 解析服务，返回选中的节点
    pub async fn resolve(&self, service_name: &str) -> Result<Arc<ServiceNode>> {
        self.resolve_with_tags(service_name, None).await
    }

    /// 按标签过滤后解析
    pub async fn resolve_with_tags(
        &self,
        service_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<Arc<ServiceNode>> {
        let nodes = self.registry.get_nodes(service_name, tags).await?;
        let node = self
            .balancer_for(service_name)
            .select(&nodes)
            .ok_or_else(|| DiscoveryError::node_not_found(service_name))?;
        debug!(service = %service_name, node_key = %node.key(), candidates = nodes.len(), "Node resolved");
        Ok(node)
    }

    /// 解析服务地址
    pub async fn resolve_address(&self, service_name: &str) -> Result<SocketAddr> {
        Ok(self.resolve(service_name).await?.socket_addr())
    }
}

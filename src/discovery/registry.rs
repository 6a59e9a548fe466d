//! 注册中心
//!
//! 在任意 [`DiscoveryBackend`] 之上实现统一的注册、注销和节点查询：
//! - 首次查询某个服务时先订阅再拉取，之后由监听循环维护本地缓存
//! - 通过租约注册的节点由后台任务按 TTL/2 续约
//! - 所有后台任务共享注册中心的取消令牌，`close` 时统一停止

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::discovery::backend::{DiscoveryBackend, LeaseId, Liveness};
use crate::discovery::cache::{NodeCache, NodeMap};
use crate::discovery::node::ServiceNode;
use crate::discovery::renewer::{LeaseRenewer, Registration, Registrations};
use crate::discovery::watch::{WatchLoop, WatchState};
use crate::error::{DiscoveryError, Result};

/// 节点注册表
///
/// 负载均衡客户端只依赖这个 trait，方便替换实现。
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// 获取服务的节点，`tags` 为空时返回全部节点
    async fn get_nodes(
        &self,
        service_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<Vec<Arc<ServiceNode>>>;

    /// 注册节点
    async fn register(&self, node: &ServiceNode) -> Result<()>;

    /// 注销节点
    async fn unregister(&self, node: &ServiceNode) -> Result<()>;
}

/// 基于后端的注册中心
pub struct Registry {
    backend: Arc<dyn DiscoveryBackend>,
    config: RegistryConfig,
    cache: Arc<NodeCache>,
    states: Arc<DashMap<String, WatchState>>,
    starters: DashMap<String, Arc<Mutex<()>>>,
    registrations: Registrations,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Registry {
    /// 创建注册中心
    pub fn new(backend: Arc<dyn DiscoveryBackend>, config: RegistryConfig) -> Self {
        Self {
            backend,
            config,
            cache: Arc::new(NodeCache::new()),
            states: Arc::new(DashMap::new()),
            starters: DashMap::new(),
            registrations: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 底层后端
    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    /// 注册中心配置
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 本地节点缓存
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// 服务的监听状态，未查询过的服务返回 `None`
    pub fn watch_state(&self, service_name: &str) -> Option<WatchState> {
        self.states.get(service_name).map(|state| *state)
    }

    /// 通过本注册中心注册且仍然有效的节点
    pub fn registered_nodes(&self) -> Vec<ServiceNode> {
        self.registrations
            .iter()
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 检查后端健康状态
    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }

    /// 注销所有通过本注册中心注册的节点，然后关闭
    ///
    /// 注销失败只记录日志，返回第一个错误。
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for node in self.registered_nodes() {
            if let Err(e) = self.unregister(&node).await {
                warn!(
                    service = %node.service_name,
                    node_key = %node.key(),
                    error = %e,
                    "Failed to unregister node during shutdown"
                );
                first_error.get_or_insert(e);
            }
        }
        self.registrations.clear();
        self.close().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 停止所有监听循环和续约任务并等待结束
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(backend = self.backend.name(), "Registry closed");
    }

    /// 首次查询：订阅、拉取、写缓存、启动监听循环
    async fn start_watch(&self, service_name: &str) -> Result<Arc<NodeMap>> {
        let starter = self
            .starters
            .entry(service_name.to_string())
            .or_default()
            .clone();
        let _guard = starter.lock().await;

        // 等锁期间可能已经由其他调用完成
        if let Some(nodes) = self.cache.get(service_name) {
            return Ok(nodes);
        }
        if self.is_closed() {
            return Err(DiscoveryError::closed());
        }

        self.states
            .insert(service_name.to_string(), WatchState::Pulling);
        let task_cancel = self.cancel.child_token();

        let rx = match self
            .backend
            .subscribe(service_name, task_cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.states.remove(service_name);
                warn!(service = %service_name, error = %e, "Failed to subscribe service");
                return Err(e);
            }
        };

        let pulled = match self.backend.pull(service_name).await {
            Ok(pulled) => pulled,
            Err(e) => {
                task_cancel.cancel();
                self.states.remove(service_name);
                warn!(service = %service_name, error = %e, "Failed to pull service nodes");
                return Err(e);
            }
        };

        // 前缀查询可能带出名字以该服务为前缀的其他服务
        let nodes: NodeMap = pulled
            .into_iter()
            .filter(|(_, node)| node.service_name == service_name)
            .map(|(key, node)| (key, Arc::new(node)))
            .collect();
        let nodes = self.cache.replace(service_name, nodes);
        self.states
            .insert(service_name.to_string(), WatchState::Watching);

        let watch = WatchLoop::new(
            service_name,
            self.backend.name(),
            self.cache.clone(),
            self.states.clone(),
            task_cancel,
        );
        self.tracker.spawn(watch.run(rx));

        info!(
            service = %service_name,
            backend = self.backend.name(),
            nodes = nodes.len(),
            "Service watch started"
        );
        Ok(nodes)
    }

    async fn register_with_lease(&self, key: String, node: &ServiceNode) -> Result<()> {
        let lease = self.backend.grant_lease(self.config.lease_ttl()).await?;
        if let Err(e) = self.backend.put_record(&key, node, Some(lease)).await {
            self.revoke(lease).await;
            return Err(e);
        }

        let cancel = self.cancel.child_token();
        let previous = self.registrations.insert(
            key.clone(),
            Registration {
                node: node.clone(),
                lease: Some(lease),
                cancel: Some(cancel.clone()),
            },
        );
        if let Some(previous) = previous {
            if let Some(token) = previous.cancel {
                token.cancel();
            }
            if let Some(old) = previous.lease.filter(|old| *old != lease) {
                self.revoke(old).await;
            }
        }

        let renewer = LeaseRenewer {
            node_key: key.clone(),
            lease,
            interval: LeaseRenewer::interval_for(self.config.lease_ttl()),
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            registrations: self.registrations.clone(),
            cancel,
        };
        self.tracker.spawn(renewer.run());

        info!(
            service = %node.service_name,
            node_key = %key,
            lease_id = %lease,
            "Node registered"
        );
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) {
        if let Err(e) = self.backend.revoke_lease(lease).await {
            warn!(lease_id = %lease, error = %e, "Failed to revoke lease");
        }
    }
}

#[async_trait]
impl NodeRegistry for Registry {
    async fn get_nodes(
        &self,
        service_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<Vec<Arc<ServiceNode>>> {
        if self.is_closed() {
            return Err(DiscoveryError::closed());
        }

        let nodes = match self.cache.get(service_name) {
            Some(nodes) => nodes,
            None => self.start_watch(service_name).await?,
        };
        Ok(NodeCache::filter(&nodes, tags))
    }

    async fn register(&self, node: &ServiceNode) -> Result<()> {
        if self.is_closed() {
            return Err(DiscoveryError::closed());
        }

        let key = node.key();
        match self.backend.liveness() {
            Liveness::Lease => self.register_with_lease(key, node).await,
            Liveness::Delegated => {
                self.backend.put_record(&key, node, None).await?;
                if let Some(previous) = self.registrations.insert(
                    key.clone(),
                    Registration {
                        node: node.clone(),
                        lease: None,
                        cancel: None,
                    },
                ) {
                    if let Some(token) = previous.cancel {
                        token.cancel();
                    }
                }
                info!(
                    service = %node.service_name,
                    node_key = %key,
                    backend = self.backend.name(),
                    "Node registered"
                );
                Ok(())
            }
        }
    }

    async fn unregister(&self, node: &ServiceNode) -> Result<()> {
        let key = node.key();
        self.backend.delete_record(&key).await?;

        if let Some((_, registration)) = self.registrations.remove(&key) {
            if let Some(token) = registration.cancel {
                token.cancel();
            }
            if let Some(lease) = registration.lease {
                self.revoke(lease).await;
            }
        }

        let evicted = self.cache.evict_everywhere(&key);
        info!(
            service = %node.service_name,
            node_key = %key,
            evicted,
            "Node unregistered"
        );
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

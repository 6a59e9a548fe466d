//! 服务发现后端抽象和实现

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::node::ServiceNode;
use crate::error::{DiscoveryError, Result};

/// 租约 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// 节点存活方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// 基于租约：注册时申请租约，本地按 TTL/2 续约（etcd）
    Lease,
    /// 委托给后端：后端自行探测节点健康（Consul 健康检查、ZooKeeper 临时节点）
    Delegated,
}

/// 监听记录的负载
#[derive(Debug, Clone)]
pub enum Payload {
    /// 尚未解码的存储格式
    Encoded(Vec<u8>),
    /// 后端已经解析好的节点
    Decoded(ServiceNode),
    /// 通知到达时记录已被删除，无法读取
    Gone,
}

impl Payload {
    /// 解码负载，`Gone` 返回 `None`
    pub fn into_node(self) -> Result<Option<ServiceNode>> {
        match self {
            Payload::Encoded(bytes) => ServiceNode::decode(&bytes).map(Some),
            Payload::Decoded(node) => Ok(Some(node)),
            Payload::Gone => Ok(None),
        }
    }
}

/// 监听记录（键已转换为节点键）
#[derive(Debug, Clone)]
pub struct WatchRecord {
    pub key: String,
    pub payload: Payload,
}

impl WatchRecord {
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// 增量事件
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// 新增或更新
    Put(WatchRecord),
    /// 删除
    Delete { key: String },
}

/// 一次通知
#[derive(Debug, Clone)]
pub enum WatchBatch {
    /// 增量事件（etcd）
    Events(Vec<WatchEvent>),
    /// 全量快照（Consul 阻塞查询、ZooKeeper 子节点监听），整表替换
    Snapshot(Vec<WatchRecord>),
}

/// 服务发现后端 trait
///
/// 所有后端（etcd、consul、zookeeper、memory）都实现这个 trait，注册中心只依赖这里的能力。
/// 后端负责把存储自身的键转换成节点键。
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    /// 节点存活方式
    fn liveness(&self) -> Liveness;

    /// 拉取服务的全部节点
    async fn pull(&self, service_name: &str) -> Result<Vec<(String, ServiceNode)>>;

    /// 订阅服务的变化
    ///
    /// 返回的通道在后端流结束或 `cancel` 触发时关闭
    async fn subscribe(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchBatch>>;

    /// 写入节点记录
    async fn put_record(&self, key: &str, node: &ServiceNode, lease: Option<LeaseId>)
    -> Result<()>;

    /// 删除节点记录
    async fn delete_record(&self, key: &str) -> Result<()>;

    /// 申请租约
    async fn grant_lease(&self, _ttl: Duration) -> Result<LeaseId> {
        Err(DiscoveryError::unsupported(format!(
            "{} backend does not support leases",
            self.name()
        )))
    }

    /// 续约一次
    async fn keep_alive(&self, _lease: LeaseId) -> Result<()> {
        Err(DiscoveryError::unsupported(format!(
            "{} backend does not support leases",
            self.name()
        )))
    }

    /// 撤销租约
    async fn revoke_lease(&self, _lease: LeaseId) -> Result<()> {
        Ok(())
    }

    /// 健康检查
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

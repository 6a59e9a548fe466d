//! ZooKeeper 服务发现后端
//!
//! 每个节点是 `{base_path}/{服务名}/{地址}:{端口}` 下的临时节点，数据为节点的 JSON 编码。
//! 节点随注册方的会话消失，本地不续约。监听使用子节点 watch，每次触发后重新
//! 列出子节点并读取数据，以全量快照推送。

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zookeeper_client::{Acls, Client, CreateMode, Error as ZkError, EventType};

use crate::config::{RegistryConfig, ZookeeperConfig};
use crate::discovery::backend::{
    DiscoveryBackend, LeaseId, Liveness, Payload, WatchBatch, WatchRecord,
};
use crate::discovery::node::ServiceNode;
use crate::error::{DiscoveryError, ErrorCode, Result, map_backend_error};

/// 节点键与 ZooKeeper 路径的映射
///
/// 节点键 `{服务名}/{地址}:{端口}` 直接拼在基础路径之后，
/// 服务目录下的子节点名就是 `{地址}:{端口}`。
#[derive(Debug, Clone)]
struct Paths {
    base: String,
}

impl Paths {
    fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn service(&self, service_name: &str) -> String {
        format!("{}/{}", self.base, service_name)
    }

    fn node(&self, node_key: &str) -> String {
        format!("{}/{}", self.base, node_key)
    }

    fn child_key(service_name: &str, child: &str) -> String {
        format!("{}/{}", service_name, child)
    }
}

/// ZooKeeper 服务发现后端
#[derive(Clone)]
pub struct ZookeeperBackend {
    client: Client,
    paths: Paths,
    watch_buffer: usize,
}

impl ZookeeperBackend {
    /// 连接 ZooKeeper 并确保基础路径存在
    pub async fn connect(config: &ZookeeperConfig, registry: &RegistryConfig) -> Result<Self> {
        let cluster = config.servers.join(",");
        let client = tokio::time::timeout(registry.dial_timeout(), Client::connect(&cluster))
            .await
            .map_err(|_| {
                DiscoveryError::coded(
                    ErrorCode::NetworkTimeout,
                    format!("timed out connecting to zookeeper {}", cluster),
                )
            })?
            .map_err(|e| {
                DiscoveryError::connection_failed(format!(
                    "failed to connect to zookeeper {}: {}",
                    cluster, e
                ))
            })?;

        let backend = Self::with_client(client, &config.base_path, registry.watch_buffer);
        backend.ensure_path(&backend.paths.base).await?;
        info!(servers = %cluster, base_path = %backend.paths.base, "Connected to zookeeper");
        Ok(backend)
    }

    /// 使用已有客户端创建
    pub fn with_client(client: Client, base_path: &str, watch_buffer: usize) -> Self {
        Self {
            client,
            paths: Paths::new(base_path),
            watch_buffer: watch_buffer.max(1),
        }
    }

    /// 逐级创建持久节点，已存在的跳过
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let options = CreateMode::Persistent.with_acls(Acls::anyone_all());
        let mut current = String::with_capacity(path.len());
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.client.create(&current, &[], &options).await {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => {
                    return Err(map_backend_error(
                        e,
                        ErrorCode::OperationFailed,
                        format!("failed to create zookeeper path {}", current),
                    ));
                }
            }
        }
        Ok(())
    }

    /// 读取子节点数据；列出之后被删除的子节点记为 `Gone`
    async fn read_children(
        &self,
        service_name: &str,
        children: Vec<String>,
    ) -> Result<Vec<WatchRecord>> {
        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let key = Paths::child_key(service_name, &child);
            let payload = match self.client.get_data(&self.paths.node(&key)).await {
                Ok((data, _)) => Payload::Encoded(data),
                Err(ZkError::NoNode) => Payload::Gone,
                Err(e) => return Err(e.into()),
            };
            records.push(WatchRecord::new(key, payload));
        }
        Ok(records)
    }

    async fn watch_loop(
        self,
        service_name: String,
        tx: mpsc::Sender<WatchBatch>,
        cancel: CancellationToken,
    ) {
        let path = self.paths.service(&service_name);
        loop {
            let watched = tokio::select! {
                _ = cancel.cancelled() => break,
                watched = self.client.get_and_watch_children(&path) => watched,
            };
            let (children, _, watcher) = match watched {
                Ok(watched) => watched,
                Err(e) => {
                    warn!(service = %service_name, path = %path, error = %e, "Failed to watch zookeeper children");
                    break;
                }
            };

            let records = match self.read_children(&service_name, children).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(service = %service_name, path = %path, error = %e, "Failed to read zookeeper children");
                    break;
                }
            };
            debug!(service = %service_name, nodes = records.len(), "ZooKeeper snapshot read");
            if tx.send(WatchBatch::Snapshot(records)).await.is_err() {
                break;
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = watcher.changed() => event,
            };
            if event.event_type == EventType::Session {
                warn!(
                    service = %service_name,
                    state = ?event.session_state,
                    "ZooKeeper session ended, watch stopped"
                );
                break;
            }
        }
        debug!(service = %service_name, "ZooKeeper watch stopped");
    }
}

#[async_trait]
impl DiscoveryBackend for ZookeeperBackend {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    fn liveness(&self) -> Liveness {
        Liveness::Delegated
    }

    async fn pull(&self, service_name: &str) -> Result<Vec<(String, ServiceNode)>> {
        let children = match self.client.get_children(&self.paths.service(service_name)).await {
            Ok((children, _)) => children,
            Err(ZkError::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::with_capacity(children.len());
        for record in self.read_children(service_name, children).await? {
            if let Some(node) = record.payload.into_node()? {
                nodes.push((record.key, node));
            }
        }
        Ok(nodes)
    }

    async fn subscribe(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchBatch>> {
        // 子节点 watch 要求服务目录存在
        self.ensure_path(&self.paths.service(service_name)).await?;

        let (tx, rx) = mpsc::channel(self.watch_buffer);
        tokio::spawn(self.clone().watch_loop(service_name.to_string(), tx, cancel));
        Ok(rx)
    }

    async fn put_record(
        &self,
        key: &str,
        node: &ServiceNode,
        _lease: Option<LeaseId>,
    ) -> Result<()> {
        self.ensure_path(&self.paths.service(&node.service_name))
            .await?;

        let path = self.paths.node(key);
        let data = node.encode()?;
        let options = CreateMode::Ephemeral.with_acls(Acls::anyone_all());
        match self.client.create(&path, &data, &options).await {
            Ok(_) => Ok(()),
            // 重复注册覆盖数据，标签以最后一次为准
            Err(ZkError::NodeExists) => {
                self.client.set_data(&path, &data, None).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        match self.client.delete(&self.paths.node(key), None).await {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.client.get_children(&self.paths.base).await?;
        Ok(())
    }
}

//! 服务监听循环
//!
//! 每个服务名一个，首次拉取之后负责让缓存跟随后端变化。

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::discovery::backend::{WatchBatch, WatchEvent, WatchRecord};
use crate::discovery::cache::{NodeCache, NodeMap};
use crate::discovery::node::ServiceNode;

/// 监听状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// 正在首次拉取
    Pulling,
    /// 订阅中
    Watching,
    /// 已结束（通道关闭或注册中心关闭），缓存不再更新
    Terminated,
}

pub(crate) struct WatchLoop {
    service_name: String,
    backend_name: &'static str,
    cache: Arc<NodeCache>,
    states: Arc<dashmap::DashMap<String, WatchState>>,
    cancel: CancellationToken,
}

impl WatchLoop {
    pub(crate) fn new(
        service_name: impl Into<String>,
        backend_name: &'static str,
        cache: Arc<NodeCache>,
        states: Arc<dashmap::DashMap<String, WatchState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            backend_name,
            cache,
            states,
            cancel,
        }
    }

    /// 运行直到订阅通道关闭或被取消
    pub(crate) async fn run(self, mut rx: mpsc::Receiver<WatchBatch>) {
        debug!(
            service = %self.service_name,
            backend = self.backend_name,
            "Watch loop started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(service = %self.service_name, "Watch loop cancelled");
                    break;
                }
                batch = rx.recv() => match batch {
                    Some(batch) => self.apply(batch),
                    None => {
                        error!(
                            service = %self.service_name,
                            backend = self.backend_name,
                            "Watch channel closed, cached nodes will no longer be refreshed"
                        );
                        break;
                    }
                },
            }
        }

        // 通知后端停止对应的监听任务
        self.cancel.cancel();
        self.states
            .insert(self.service_name.clone(), WatchState::Terminated);
    }

    fn apply(&self, batch: WatchBatch) {
        match batch {
            WatchBatch::Events(events) => {
                for event in events {
                    match event {
                        WatchEvent::Put(record) => {
                            let key = record.key.clone();
                            if let Some(node) = self.decode(record) {
                                debug!(service = %self.service_name, node_key = %key, "Node updated");
                                self.cache.upsert(&self.service_name, key, node);
                            }
                        }
                        WatchEvent::Delete { key } => {
                            if self.cache.remove(&self.service_name, &key) {
                                debug!(service = %self.service_name, node_key = %key, "Node removed");
                            }
                        }
                    }
                }
            }
            WatchBatch::Snapshot(records) => {
                let mut nodes = NodeMap::new();
                for record in records {
                    let key = record.key.clone();
                    if let Some(node) = self.decode(record) {
                        nodes.insert(key, Arc::new(node));
                    }
                }
                let nodes = self.cache.replace(&self.service_name, nodes);
                debug!(
                    service = %self.service_name,
                    nodes = nodes.len(),
                    "Node snapshot applied"
                );
            }
        }
    }

    /// 解码单条记录，失败或属于其他服务时记录日志并跳过
    ///
    /// 前缀存储中 `a` 的前缀同样覆盖 `a/b` 的记录，按节点自身的服务名过滤。
    fn decode(&self, record: WatchRecord) -> Option<ServiceNode> {
        match record.payload.into_node() {
            Ok(Some(node)) if node.service_name == self.service_name => Some(node),
            Ok(Some(node)) => {
                debug!(
                    service = %self.service_name,
                    node_key = %record.key,
                    other = %node.service_name,
                    "Watched node belongs to another service, skipped"
                );
                None
            }
            Ok(None) => {
                debug!(
                    service = %self.service_name,
                    node_key = %record.key,
                    "Node vanished before it could be read, skipped"
                );
                None
            }
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    node_key = %record.key,
                    error = %e,
                    "Failed to decode watched node, skipped"
                );
                None
            }
        }
    }
}

//! 节点缓存
//!
//! 服务名 -> (节点键 -> 节点)。每个服务的节点表是 `Arc` 包装的不可变快照，
//! 写入方通过写时复制替换整张表，读取方拿到的永远是完整的一份。

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::discovery::node::ServiceNode;

/// 单个服务的节点表（按节点键有序）
pub type NodeMap = BTreeMap<String, Arc<ServiceNode>>;

/// 节点缓存
#[derive(Debug, Default)]
pub struct NodeCache {
    services: DashMap<String, Arc<NodeMap>>,
}

impl NodeCache {
    /// 创建空缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取服务的当前快照
    pub fn get(&self, service_name: &str) -> Option<Arc<NodeMap>> {
        self.services
            .get(service_name)
            .map(|entry| entry.value().clone())
    }

    /// 服务是否已缓存
    pub fn contains(&self, service_name: &str) -> bool {
        self.services.contains_key(service_name)
    }

    /// 已缓存的服务名
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 整表替换，返回新的快照
    pub fn replace(&self, service_name: &str, nodes: NodeMap) -> Arc<NodeMap> {
        let nodes = Arc::new(nodes);
        self.services
            .insert(service_name.to_string(), nodes.clone());
        nodes
    }

    /// 写入或覆盖单个节点
    pub fn upsert(&self, service_name: &str, key: String, node: ServiceNode) {
        let mut entry = self.services.entry(service_name.to_string()).or_default();
        Arc::make_mut(entry.value_mut()).insert(key, Arc::new(node));
    }

    /// 删除单个节点，返回节点是否存在
    pub fn remove(&self, service_name: &str, key: &str) -> bool {
        match self.services.get_mut(service_name) {
            Some(mut entry) if entry.contains_key(key) => {
                Arc::make_mut(entry.value_mut()).remove(key);
                true
            }
            _ => false,
        }
    }

    /// 从所有服务中移除该节点键，返回受影响的服务数量
    pub fn evict_everywhere(&self, key: &str) -> usize {
        let mut evicted = 0;
        for mut entry in self.services.iter_mut() {
            if entry.contains_key(key) {
                Arc::make_mut(entry.value_mut()).remove(key);
                evicted += 1;
            }
        }
        evicted
    }

    /// 按标签过滤节点
    pub fn filter(
        nodes: &NodeMap,
        tags: Option<&HashMap<String, String>>,
    ) -> Vec<Arc<ServiceNode>> {
        match tags {
            Some(filter) if !filter.is_empty() => nodes
                .values()
                .filter(|node| node.matches_tags(filter))
                .cloned()
                .collect(),
            _ => nodes.values().cloned().collect(),
        }
    }
}

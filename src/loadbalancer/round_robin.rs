use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::LoadBalancer;
use crate::discovery::node::ServiceNode;

/// 轮询选择
///
/// 游标通过 `fetch_add` 原子递增，并发调用也严格按顺序轮转。
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, nodes: &[Arc<ServiceNode>]) -> Option<Arc<ServiceNode>> {
        if nodes.is_empty() {
            return None;
        }
        // 选择时取模，节点列表缩短后游标依然有效；溢出时回绕
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[index].clone())
    }
}

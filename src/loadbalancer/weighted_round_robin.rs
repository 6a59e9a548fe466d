use parking_lot::Mutex;
use std::sync::Arc;

use super::LoadBalancer;
use crate::discovery::node::ServiceNode;

/// 平滑加权轮询
///
/// 权重取自节点的 `weight` 标签，缺失或不是数字按 0 处理，权重为 0 的节点不会被选中。
/// 每 `总权重 / 最大公约数` 次选择构成一轮，一轮内每个节点恰好被选中 `权重 / 最大公约数` 次。
pub struct WeightedRoundRobin {
    state: Mutex<State>,
}

struct State {
    index: isize,
    current_weight: i64,
    total_weight: i64,
    nodes: Vec<Arc<ServiceNode>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                index: -1,
                current_weight: 0,
                total_weight: 0,
                nodes: Vec::new(),
            }),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

fn weight_of(node: &ServiceNode) -> i64 {
    i64::try_from(node.weight()).unwrap_or(i64::MAX)
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn same_nodes(a: &[Arc<ServiceNode>], b: &[Arc<ServiceNode>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

impl LoadBalancer for WeightedRoundRobin {
    fn select(&self, nodes: &[Arc<ServiceNode>]) -> Option<Arc<ServiceNode>> {
        if nodes.is_empty() {
            return None;
        }

        let mut state = self.state.lock();

        // 节点变化时重新计算总权重并从头开始
        if !same_nodes(&state.nodes, nodes) {
            state.nodes = nodes.to_vec();
            state.total_weight = nodes
                .iter()
                .map(|node| weight_of(node))
                .fold(0i64, i64::saturating_add);
            state.index = -1;
            state.current_weight = 0;
        }

        let step = nodes.iter().map(|node| weight_of(node)).fold(0, gcd);
        let len = nodes.len() as isize;

        loop {
            state.index = (state.index + 1) % len;
            if state.index == 0 {
                state.current_weight -= step;
                if state.current_weight <= 0 {
                    state.current_weight = state.total_weight;
                    if state.current_weight == 0 {
                        return None;
                    }
                }
            }

            let node = &nodes[state.index as usize];
            if weight_of(node) >= state.current_weight {
                return Some(node.clone());
            }
        }
    }
}

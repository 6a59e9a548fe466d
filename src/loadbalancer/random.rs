use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use super::LoadBalancer;
use crate::discovery::node::ServiceNode;

/// 随机选择
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    /// 使用系统熵初始化
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 固定种子，相同种子得到相同的选择序列
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for Random {
    fn select(&self, nodes: &[Arc<ServiceNode>]) -> Option<Arc<ServiceNode>> {
        if nodes.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..nodes.len());
        nodes.get(index).cloned()
    }
}

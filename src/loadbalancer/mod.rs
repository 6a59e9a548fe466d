//! 负载均衡模块
//!
//! 从服务节点列表中选择一个节点。节点列表来自注册中心，按节点键有序，
//! 成员不变时每次得到的是同一组 `Arc`，有状态的均衡器可以据此判断列表是否变化。

mod random;
mod round_robin;
mod weighted_round_robin;

pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted_round_robin::WeightedRoundRobin;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::discovery::node::ServiceNode;
use crate::error::DiscoveryError;

/// 负载均衡器
pub trait LoadBalancer: Send + Sync {
    /// 选择一个节点，列表为空（或没有可用节点）时返回 `None`
    fn select(&self, nodes: &[Arc<ServiceNode>]) -> Option<Arc<ServiceNode>>;
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 随机
    Random,
    /// 轮询
    #[default]
    RoundRobin,
    /// 平滑加权轮询（权重取自 `weight` 标签）
    WeightedRoundRobin,
}

impl LoadBalanceStrategy {
    /// 创建对应的负载均衡器
    pub fn build(&self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalanceStrategy::Random => Arc::new(Random::new()),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobin::new()),
            LoadBalanceStrategy::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(LoadBalanceStrategy::Random),
            "round_robin" | "roundrobin" | "rr" => Ok(LoadBalanceStrategy::RoundRobin),
            "weighted_round_robin" | "weightedroundrobin" | "wrr" => {
                Ok(LoadBalanceStrategy::WeightedRoundRobin)
            }
            other => Err(DiscoveryError::config(format!(
                "unknown load balance strategy: {}",
                other
            ))),
        }
    }
}

//! 服务发现模块
//!
//! 本地节点缓存 + 后端监听的注册中心实现，后端（etcd、consul、zookeeper、memory）
//! 只负责存储协议的转换。

pub mod backend;
pub mod cache;
pub mod factory;
pub mod node;
pub mod registry;
mod renewer;
pub mod watch;

pub use backend::memory::{MemoryBackend, WatchMode};
pub use backend::{
    DiscoveryBackend, LeaseId, Liveness, Payload, WatchBatch, WatchEvent, WatchRecord,
};
pub use cache::{NodeCache, NodeMap};
pub use factory::DiscoveryFactory;
pub use node::{ServiceNode, WEIGHT_TAG, match_tags, node_key};
pub use registry::{NodeRegistry, Registry};
pub use watch::WatchState;

//! Flare Discovery
//!
//! 客户端服务发现：把服务名解析为存活节点，本地缓存随后端（etcd、Consul、ZooKeeper）
//! 的变化自动刷新，并按负载均衡策略选出一个节点。

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod loadbalancer;
pub mod logging;

// Re-exports
pub use client::Resolver;
pub use config::{
    BackendConfig, ConsulConfig, DiscoveryConfig, EtcdConfig, LoggingConfig, MemoryConfig,
    RegistryConfig, ZookeeperConfig,
};
pub use discovery::{
    DiscoveryBackend, DiscoveryFactory, MemoryBackend, NodeRegistry, Registry, ServiceNode,
    WatchState,
};
pub use error::{DiscoveryError, ErrorBuilder, ErrorCategory, ErrorCode, Result};
pub use loadbalancer::{LoadBalanceStrategy, LoadBalancer, Random, RoundRobin, WeightedRoundRobin};

//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! # 使用 Docker 启动 etcd
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

#![cfg(feature = "etcd")]

use flare_discovery::{
    BackendConfig, DiscoveryConfig, DiscoveryFactory, EtcdConfig, NodeRegistry, RegistryConfig,
    ServiceNode, WatchState,
};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

/// 创建测试用的 etcd 配置，每个测试使用独立的前缀
fn create_test_config(prefix: &str) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::memory();
    config.backend = BackendConfig::Etcd(EtcdConfig {
        endpoints: etcd_endpoints(),
        key_prefix: format!("/flare-test/{}/", prefix),
    });
    config.registry = RegistryConfig {
        lease_ttl_secs: 2,
        dial_timeout_secs: 3,
        watch_buffer: 16,
    };
    config
}

fn create_test_node(service: &str, port: u16) -> ServiceNode {
    ServiceNode::new(service, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        .with_tag("env", "test")
        .with_weight(10)
}

async fn wait_for<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// 测试：服务注册与发现
#[tokio::test]
#[ignore]
async fn test_etcd_register_and_discover() {
    let config = create_test_config("register");
    let registry = DiscoveryFactory::create_registry(&config)
        .await
        .expect("Failed to create etcd registry");
    registry.health_check().await.expect("etcd is not healthy");

    let node = create_test_node("test-service", 18080);
    registry.register(&node).await.expect("Failed to register node");

    let nodes = registry
        .get_nodes("test-service", None)
        .await
        .expect("Failed to get nodes");
    assert!(
        nodes.iter().any(|n| n.key() == node.key()),
        "Registered node not found"
    );

    registry.shutdown().await.expect("Failed to shutdown registry");
}

/// 测试：监听其他注册中心的注册和注销
#[tokio::test]
#[ignore]
async fn test_etcd_watch() {
    let config = create_test_config("watch");
    let writer = DiscoveryFactory::create_registry(&config)
        .await
        .expect("Failed to create writer");
    let reader = DiscoveryFactory::create_registry(&config)
        .await
        .expect("Failed to create reader");

    let before = reader
        .get_nodes("watch-service", None)
        .await
        .expect("Failed to get nodes");
    assert!(before.is_empty());
    assert_eq!(reader.watch_state("watch-service"), Some(WatchState::Watching));

    let node = create_test_node("watch-service", 18081);
    writer.register(&node).await.expect("Failed to register node");
    wait_for("node registered", || {
        reader
            .cache()
            .get("watch-service")
            .map(|nodes| nodes.contains_key(&node.key()))
            .unwrap_or(false)
    })
    .await;

    writer.unregister(&node).await.expect("Failed to unregister node");
    wait_for("node removed", || {
        reader
            .cache()
            .get("watch-service")
            .map(|nodes| nodes.is_empty())
            .unwrap_or(false)
    })
    .await;

    writer.shutdown().await.expect("Failed to shutdown writer");
    reader.close().await;
}

/// 测试：续约使节点在 TTL 之后依然存在
#[tokio::test]
#[ignore]
async fn test_etcd_lease_keep_alive() {
    let config = create_test_config("lease");
    let registry = DiscoveryFactory::create_registry(&config)
        .await
        .expect("Failed to create etcd registry");

    let node = create_test_node("lease-service", 18082);
    registry.register(&node).await.expect("Failed to register node");
    sleep(Duration::from_secs(5)).await;

    let nodes = registry
        .get_nodes("lease-service", None)
        .await
        .expect("Failed to get nodes");
    assert_eq!(nodes.len(), 1);

    registry.shutdown().await.expect("Failed to shutdown registry");
}

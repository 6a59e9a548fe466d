//! 注册中心集成测试
//!
//! 使用内存后端。写入方和读取方是共享同一个后端的两个注册中心，
//! 读取方的缓存只能通过监听更新，以此覆盖监听路径。

use flare_discovery::discovery::backend::Liveness;
use flare_discovery::{
    ErrorCode, MemoryBackend, NodeRegistry, Registry, RegistryConfig, ServiceNode, WatchState,
};
use flare_discovery::discovery::WatchMode;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

const SERVICE: &str = "user-service";

fn test_config() -> RegistryConfig {
    RegistryConfig {
        lease_ttl_secs: 1,
        dial_timeout_secs: 1,
        watch_buffer: 16,
    }
}

fn create_node(last_octet: u8, port: u16) -> ServiceNode {
    ServiceNode::new(SERVICE, IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
}

fn create_registry(backend: &Arc<MemoryBackend>) -> Registry {
    Registry::new(backend.clone(), test_config())
}

/// 等待条件成立，超时则失败
async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

fn cached_keys(registry: &Registry, service: &str) -> Vec<String> {
    registry
        .cache()
        .get(service)
        .map(|nodes| nodes.keys().cloned().collect())
        .unwrap_or_default()
}

/// 测试：注册后可以查询到节点
#[tokio::test]
async fn test_register_then_get_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080).with_tag("version", "v1");

    assert_ok!(registry.register(&node).await);
    assert!(backend.contains(&node.key()));
    assert!(backend.lease_of(&node.key()).is_some());

    let nodes = assert_ok!(registry.get_nodes(SERVICE, None).await);
    assert_eq!(nodes.len(), 1);
    assert_eq!(*nodes[0], node);
    assert_eq!(registry.watch_state(SERVICE), Some(WatchState::Watching));

    registry.close().await;
}

/// 测试：未查询过的服务没有监听状态，查询空服务返回空列表
#[tokio::test]
async fn test_get_nodes_empty_service() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);

    assert_eq!(registry.watch_state("unknown"), None);
    let nodes = assert_ok!(registry.get_nodes("unknown", None).await);
    assert!(nodes.is_empty());
    assert_eq!(registry.watch_state("unknown"), Some(WatchState::Watching));

    registry.close().await;
}

/// 测试：其他注册中心写入的节点通过监听出现在缓存中
#[tokio::test]
async fn test_watch_applies_remote_changes() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);

    assert!(assert_ok!(reader.get_nodes(SERVICE, None).await).is_empty());

    let a = create_node(1, 8080);
    let b = create_node(2, 8080);
    assert_ok!(writer.register(&a).await);
    assert_ok!(writer.register(&b).await);
    eventually("both nodes watched", || cached_keys(&reader, SERVICE).len() == 2).await;

    assert_ok!(writer.unregister(&a).await);
    eventually("node a removed", || cached_keys(&reader, SERVICE) == vec![b.key()]).await;

    writer.close().await;
    reader.close().await;
}

/// 测试：按标签过滤节点
#[tokio::test]
async fn test_get_nodes_with_tags() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);

    let v1 = create_node(1, 8080).with_tag("version", "v1").with_tag("zone", "a");
    let v2 = create_node(2, 8080).with_tag("version", "v2").with_tag("zone", "a");
    assert_ok!(registry.register(&v1).await);
    assert_ok!(registry.register(&v2).await);

    let mut filter = HashMap::new();
    filter.insert("version".to_string(), "v2".to_string());
    let nodes = assert_ok!(registry.get_nodes(SERVICE, Some(&filter)).await);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].key(), v2.key());

    filter.insert("zone".to_string(), "b".to_string());
    assert!(assert_ok!(registry.get_nodes(SERVICE, Some(&filter)).await).is_empty());

    let empty = HashMap::new();
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, Some(&empty)).await).len(), 2);

    registry.close().await;
}

/// 测试：节点列表按节点键排序，成员不变时返回同一组 Arc
#[tokio::test]
async fn test_node_order_is_stable() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    for octet in [3, 1, 2] {
        assert_ok!(registry.register(&create_node(octet, 8080)).await);
    }

    let first = assert_ok!(registry.get_nodes(SERVICE, None).await);
    let second = assert_ok!(registry.get_nodes(SERVICE, None).await);
    let keys: Vec<String> = first.iter().map(|n| n.key()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));

    registry.close().await;
}

/// 测试：相同节点键重复注册只保留一个，标签以最后一次为准
#[tokio::test]
async fn test_reregister_same_key() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);

    assert_ok!(reader.get_nodes(SERVICE, None).await);
    assert_ok!(writer.register(&create_node(1, 8080).with_tag("version", "v1")).await);
    assert_ok!(writer.register(&create_node(1, 8080).with_tag("version", "v2")).await);

    eventually("latest tags applied", || {
        reader
            .cache()
            .get(SERVICE)
            .map(|nodes| {
                nodes.len() == 1
                    && nodes.values().all(|n| n.tags.get("version").map(String::as_str) == Some("v2"))
            })
            .unwrap_or(false)
    })
    .await;

    // 旧租约已被撤销，只剩一个
    assert_eq!(backend.lease_count(), 1);
    assert_eq!(writer.registered_nodes().len(), 1);

    writer.close().await;
    reader.close().await;
}

/// 测试：注销删除记录、撤销租约并从缓存中移除
#[tokio::test]
async fn test_unregister() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, None).await).len(), 1);

    assert_ok!(registry.unregister(&node).await);
    assert!(!backend.contains(&node.key()));
    assert_eq!(backend.lease_count(), 0);
    assert!(cached_keys(&registry, SERVICE).is_empty());
    assert!(registry.registered_nodes().is_empty());

    registry.close().await;
}

/// 测试：租约按时续约，节点在 TTL 之后依然存在
#[tokio::test]
async fn test_lease_is_renewed() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    sleep(Duration::from_millis(2500)).await;

    assert!(backend.contains(&node.key()));
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, None).await).len(), 1);

    registry.close().await;
}

/// 测试：续约失败后节点立即从缓存移除，且不调用注销
#[tokio::test]
async fn test_renewal_failure_evicts_node() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, None).await).len(), 1);

    backend.fail_renewals(true);
    eventually("node evicted", || cached_keys(&registry, SERVICE).is_empty()).await;
    assert!(registry.registered_nodes().is_empty());

    registry.close().await;
}

/// 测试：续约失败时节点从所有缓存的服务中移除
#[tokio::test]
async fn test_renewal_failure_evicts_from_every_service() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, None).await).len(), 1);
    // 同一个节点键出现在另一个服务的缓存中
    registry
        .cache()
        .upsert("gateway-upstreams", node.key(), node.clone());
    assert_eq!(cached_keys(&registry, "gateway-upstreams"), vec![node.key()]);

    backend.fail_renewals(true);
    eventually("node evicted from every service", || {
        cached_keys(&registry, SERVICE).is_empty()
            && cached_keys(&registry, "gateway-upstreams").is_empty()
    })
    .await;
    assert!(registry.cache().contains("gateway-upstreams"));

    registry.close().await;
}

/// 测试：名字以查询服务为前缀的其他服务节点不会进入缓存
#[tokio::test]
async fn test_nested_service_nodes_are_filtered() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);

    let nested = ServiceNode::new(
        format!("{}/v2", SERVICE),
        IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)),
        8080,
    );
    // 前缀存储中 `user-service/` 同样覆盖 `user-service/v2/...`
    backend.put_raw(SERVICE, &nested.key(), assert_ok!(nested.encode()));
    assert!(assert_ok!(reader.get_nodes(SERVICE, None).await).is_empty());

    let moved = ServiceNode::new(
        format!("{}/v2", SERVICE),
        IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)),
        8080,
    );
    backend.put_raw(SERVICE, &moved.key(), assert_ok!(moved.encode()));
    let node = create_node(1, 8080);
    assert_ok!(writer.register(&node).await);

    eventually("own node applied", || cached_keys(&reader, SERVICE) == vec![node.key()]).await;

    writer.close().await;
    reader.close().await;
}

/// 测试：服务端租约过期时监听删除事件移除节点
#[tokio::test]
async fn test_lease_expiry_removes_node() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(writer.register(&node).await);
    assert_eq!(assert_ok!(reader.get_nodes(SERVICE, None).await).len(), 1);

    let lease = backend.lease_of(&node.key()).expect("node bound to lease");
    assert_eq!(backend.expire_lease(lease), 1);
    eventually("expired node removed", || cached_keys(&reader, SERVICE).is_empty()).await;

    writer.close().await;
    reader.close().await;
}

/// 测试：首次拉取失败时返回错误，缓存保持为空，之后的调用会重试
#[tokio::test]
async fn test_pull_failure_then_retry() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);

    backend.set_unavailable(true);
    let err = assert_err!(registry.get_nodes(SERVICE, None).await);
    assert!(err.is(ErrorCode::ServiceUnavailable));
    assert!(!registry.cache().contains(SERVICE));
    assert_eq!(registry.watch_state(SERVICE), None);

    backend.set_unavailable(false);
    assert_ok!(registry.get_nodes(SERVICE, None).await);
    assert!(registry.cache().contains(SERVICE));
    assert_eq!(registry.watch_state(SERVICE), Some(WatchState::Watching));

    registry.close().await;
}

/// 测试：并发首次查询只拉取和订阅一次
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_is_single_flight() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Arc::new(create_registry(&backend));
    assert_ok!(registry.register(&create_node(1, 8080)).await);

    let calls = (0..16).map(|_| {
        let registry = registry.clone();
        async move { registry.get_nodes(SERVICE, None).await }
    });
    for result in join_all(calls).await {
        assert_eq!(assert_ok!(result).len(), 1);
    }

    assert_eq!(backend.pull_count(), 1);
    assert_eq!(backend.subscribe_count(), 1);

    registry.close().await;
}

/// 测试：无法解码的监听记录被跳过，后续记录照常应用
#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);

    assert_ok!(reader.get_nodes(SERVICE, None).await);
    backend.put_raw(SERVICE, "user-service/broken", b"not json".to_vec());
    let node = create_node(1, 8080);
    assert_ok!(writer.register(&node).await);

    eventually("valid node applied", || cached_keys(&reader, SERVICE) == vec![node.key()]).await;
    assert_eq!(reader.watch_state(SERVICE), Some(WatchState::Watching));

    writer.close().await;
    reader.close().await;
}

/// 测试：快照模式下删除以 Gone 出现，不影响快照中的其他节点
#[tokio::test]
async fn test_snapshot_mode_with_deletions() {
    let backend = Arc::new(MemoryBackend::new().with_mode(WatchMode::Snapshot));
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);

    let a = create_node(1, 8080);
    let b = create_node(2, 8080);
    assert_ok!(writer.register(&a).await);
    assert_ok!(reader.get_nodes(SERVICE, None).await);
    assert_ok!(writer.register(&b).await);
    eventually("snapshot with both nodes", || cached_keys(&reader, SERVICE).len() == 2).await;

    assert_ok!(writer.unregister(&a).await);
    eventually("snapshot without a", || cached_keys(&reader, SERVICE) == vec![b.key()]).await;

    // 最后一个节点删除后是空快照
    assert_ok!(writer.unregister(&b).await);
    eventually("empty snapshot", || {
        reader.cache().get(SERVICE).map(|nodes| nodes.is_empty()).unwrap_or(false)
    })
    .await;
    assert!(assert_ok!(reader.get_nodes(SERVICE, None).await).is_empty());

    writer.close().await;
    reader.close().await;
}

/// 测试：订阅通道关闭后状态为 Terminated，缓存继续提供旧数据
#[tokio::test]
async fn test_watch_termination_keeps_stale_data() {
    let backend = Arc::new(MemoryBackend::new());
    let writer = create_registry(&backend);
    let reader = create_registry(&backend);
    let a = create_node(1, 8080);

    assert_ok!(writer.register(&a).await);
    assert_eq!(assert_ok!(reader.get_nodes(SERVICE, None).await).len(), 1);

    backend.close_watches(SERVICE);
    eventually("watch terminated", || {
        reader.watch_state(SERVICE) == Some(WatchState::Terminated)
    })
    .await;

    // 新节点不会再出现，旧节点依然可以查询
    assert_ok!(writer.register(&create_node(2, 8080)).await);
    sleep(Duration::from_millis(100)).await;
    let nodes = assert_ok!(reader.get_nodes(SERVICE, None).await);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].key(), a.key());

    writer.close().await;
    reader.close().await;
}

/// 测试：关闭后查询和注册返回 Closed，注销仍然允许
#[tokio::test]
async fn test_close() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    assert_ok!(registry.get_nodes(SERVICE, None).await);

    registry.close().await;
    registry.close().await;
    assert!(registry.is_closed());
    assert_eq!(registry.watch_state(SERVICE), Some(WatchState::Terminated));

    let err = assert_err!(registry.get_nodes(SERVICE, None).await);
    assert!(err.is(ErrorCode::RegistryClosed));
    let err = assert_err!(registry.register(&create_node(2, 8080)).await);
    assert!(err.is(ErrorCode::RegistryClosed));

    assert_ok!(registry.unregister(&node).await);
    assert!(!backend.contains(&node.key()));
}

/// 测试：shutdown 注销所有节点后关闭
#[tokio::test]
async fn test_shutdown_unregisters_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = create_registry(&backend);
    let a = create_node(1, 8080);
    let b = create_node(2, 8080);

    assert_ok!(registry.register(&a).await);
    assert_ok!(registry.register(&b).await);
    assert_ok!(registry.shutdown().await);

    assert!(!backend.contains(&a.key()));
    assert!(!backend.contains(&b.key()));
    assert_eq!(backend.lease_count(), 0);
    assert!(registry.is_closed());
    assert!(registry.registered_nodes().is_empty());
}

/// 测试：委托存活的后端不申请租约
#[tokio::test]
async fn test_delegated_liveness_skips_lease() {
    let backend = Arc::new(MemoryBackend::new().with_liveness(Liveness::Delegated));
    let registry = create_registry(&backend);
    let node = create_node(1, 8080);

    assert_ok!(registry.register(&node).await);
    assert!(backend.contains(&node.key()));
    assert_eq!(backend.lease_of(&node.key()), None);
    assert_eq!(backend.lease_count(), 0);

    // 没有续约任务，超过 TTL 依然存在
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(assert_ok!(registry.get_nodes(SERVICE, None).await).len(), 1);

    assert_ok!(registry.unregister(&node).await);
    assert!(!backend.contains(&node.key()));

    registry.close().await;
}

//! 配置解析测试

use flare_discovery::discovery::WatchMode;
use flare_discovery::discovery::backend::Liveness;
use flare_discovery::{BackendConfig, DiscoveryConfig, ErrorCode, LoadBalanceStrategy};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// 测试：etcd 配置及默认值
#[test]
fn test_parse_etcd_config() {
    let config = assert_ok!(DiscoveryConfig::from_toml_str(
        r#"
        load_balance = "weighted_round_robin"

        [backend]
        type = "etcd"
        endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        "#,
    ));

    match &config.backend {
        BackendConfig::Etcd(etcd) => {
            assert_eq!(etcd.endpoints.len(), 2);
            assert_eq!(etcd.key_prefix, "/services/");
        }
        other => panic!("unexpected backend {}", other.name()),
    }
    assert_eq!(config.load_balance, LoadBalanceStrategy::WeightedRoundRobin);
    assert_eq!(config.registry.lease_ttl(), Duration::from_secs(10));
    assert_eq!(config.registry.dial_timeout(), Duration::from_secs(5));
    assert_eq!(config.registry.watch_buffer, 64);
    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.json);
}

/// 测试：consul 配置覆盖健康检查参数
#[test]
fn test_parse_consul_config() {
    let config = assert_ok!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "consul"
        address = "http://consul:8500"
        check_interval_secs = 10
        deregister_critical_after_secs = 60

        [registry]
        lease_ttl_secs = 30

        [logging]
        level = "debug"
        json = true
        "#,
    ));

    match &config.backend {
        BackendConfig::Consul(consul) => {
            assert_eq!(consul.address, "http://consul:8500");
            assert_eq!(consul.check_interval(), Duration::from_secs(10));
            assert_eq!(consul.check_timeout(), Duration::from_secs(5));
            assert_eq!(consul.deregister_critical_after(), Duration::from_secs(60));
        }
        other => panic!("unexpected backend {}", other.name()),
    }
    assert_eq!(config.registry.lease_ttl_secs, 30);
    assert_eq!(config.load_balance, LoadBalanceStrategy::RoundRobin);
    assert!(config.logging.json);
}

/// 测试：zookeeper 配置及基础路径校验
#[test]
fn test_parse_zookeeper_config() {
    let config = assert_ok!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "zookeeper"
        servers = ["zk-1:2181", "zk-2:2181"]
        "#,
    ));
    match &config.backend {
        BackendConfig::Zookeeper(zookeeper) => {
            assert_eq!(zookeeper.servers, vec!["zk-1:2181", "zk-2:2181"]);
            assert_eq!(zookeeper.base_path, "/services");
        }
        other => panic!("unexpected backend {}", other.name()),
    }

    let err = assert_err!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "zookeeper"
        servers = ["zk-1:2181"]
        base_path = "/"
        "#,
    ));
    assert!(err.is(ErrorCode::ConfigurationError));
}

/// 测试：内存后端配置
#[test]
fn test_parse_memory_config() {
    let config = assert_ok!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "memory"
        mode = "snapshot"
        delegated = true
        "#,
    ));

    match &config.backend {
        BackendConfig::Memory(memory) => {
            assert_eq!(memory.mode, WatchMode::Snapshot);
            assert_eq!(memory.liveness(), Liveness::Delegated);
        }
        other => panic!("unexpected backend {}", other.name()),
    }
}

/// 测试：无效配置
#[test]
fn test_invalid_config() {
    let err = assert_err!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "etcd"
        endpoints = []
        "#,
    ));
    assert!(err.is(ErrorCode::ConfigurationError));

    let err = assert_err!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "memory"

        [registry]
        lease_ttl_secs = 0
        "#,
    ));
    assert!(err.is(ErrorCode::ConfigurationError));

    let err = assert_err!(DiscoveryConfig::from_toml_str(
        r#"
        [backend]
        type = "nacos"
        "#,
    ));
    assert!(err.is(ErrorCode::ConfigurationError));

    let err = assert_err!(DiscoveryConfig::from_toml_str(
        r#"
        load_balance = "least_connections"

        [backend]
        type = "memory"
        "#,
    ));
    assert!(err.is(ErrorCode::ConfigurationError));
}

/// 测试：从文件加载，文件不存在时返回错误
#[test]
fn test_load_from_file() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("flare-discovery-{}.toml", std::process::id()));
    std::fs::write(&path, "[backend]\ntype = \"memory\"\n")?;
    let config = DiscoveryConfig::load_from_file(&path)?;
    assert_eq!(config.backend.name(), "memory");
    std::fs::remove_file(&path)?;

    assert_err!(DiscoveryConfig::load_from_file("/nonexistent/flare-discovery.toml"));
    Ok(())
}

//! Consul 服务发现后端
//!
//! 节点存活委托给 Consul 的 TCP 健康检查，本地不做续约。
//! 监听使用阻塞查询，每次返回都是服务的全量健康实例。

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConsulConfig, RegistryConfig};
use crate::discovery::backend::{
    DiscoveryBackend, LeaseId, Liveness, Payload, WatchBatch, WatchRecord,
};
use crate::discovery::node::ServiceNode;
use crate::error::{DiscoveryError, Result};

const HEALTH_PASSING: &str = "passing";
const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: String,
    port: u16,
    meta: &'a HashMap<String, String>,
    check: ServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceCheck {
    #[serde(rename = "TCP")]
    tcp: String,
    timeout: String,
    interval: String,
    deregister_critical_service_after: String,
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    service: AgentService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID", default)]
    id: String,
    service: String,
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

impl ServiceEntry {
    /// 所有检查都通过才算健康
    fn is_passing(&self) -> bool {
        self.checks.iter().all(|check| check.status == HEALTH_PASSING)
    }

    fn into_node(self, service_name: &str) -> Option<ServiceNode> {
        let address: IpAddr = match self.service.address.parse() {
            Ok(address) => address,
            Err(e) => {
                warn!(
                    service = %service_name,
                    service_id = %self.service.id,
                    address = %self.service.address,
                    error = %e,
                    "Skipped consul service with invalid address"
                );
                return None;
            }
        };
        let mut node = ServiceNode::new(service_name, address, self.service.port);
        node.tags = self.service.meta.unwrap_or_default();
        Some(node)
    }
}

/// 把健康查询的结果转换为快照记录，只保留同名且全部检查通过的实例
fn snapshot_records(entries: Vec<ServiceEntry>, service_name: &str) -> Vec<WatchRecord> {
    entries
        .into_iter()
        .filter(|entry| entry.service.service == service_name && entry.is_passing())
        .filter_map(|entry| entry.into_node(service_name))
        .map(|node| WatchRecord::new(node.key(), Payload::Decoded(node)))
        .collect()
}

/// 阻塞查询返回后索引的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexStep {
    /// 索引未变（等待超时），没有新数据
    Unchanged,
    /// 索引回退，Consul 状态被重置，从 0 重新查询
    Reset,
    /// 有新数据
    Advance(u64),
}

fn next_index(current: u64, returned: u64) -> IndexStep {
    if returned == current {
        IndexStep::Unchanged
    } else if returned < current {
        IndexStep::Reset
    } else {
        IndexStep::Advance(returned)
    }
}

/// Go 风格的时长字符串
fn go_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Consul 服务发现后端
#[derive(Clone)]
pub struct ConsulBackend {
    http: HttpClient,
    config: ConsulConfig,
    watch_buffer: usize,
}

impl ConsulBackend {
    /// 创建 Consul 后端
    pub fn new(config: ConsulConfig, registry: &RegistryConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(registry.dial_timeout())
            .build()?;
        info!(address = %config.address, "Consul backend created");
        Ok(Self {
            http,
            config,
            watch_buffer: registry.watch_buffer.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.address.trim_end_matches('/'), path)
    }

    /// 查询服务的健康实例，返回 Consul 索引和实例列表
    async fn health_service(
        &self,
        service_name: &str,
        index: Option<u64>,
    ) -> Result<(u64, Vec<ServiceEntry>)> {
        let mut request = self
            .http
            .get(self.url(&format!("/v1/health/service/{}", service_name)));
        if let Some(index) = index {
            let wait = self.config.wait();
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", go_duration(wait)),
                ])
                // 阻塞查询最长会挂起 wait + wait/16
                .timeout(wait + wait / 16 + self.config.check_timeout());
        } else {
            request = request.query(&[("passing", "true")]);
        }

        let resp = request.send().await?.error_for_status()?;
        let consul_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| DiscoveryError::decode(format!("missing {} header", INDEX_HEADER)))?;
        let entries: Vec<ServiceEntry> = resp.json().await?;
        Ok((consul_index, entries))
    }

    fn registration<'a>(&self, key: &'a str, node: &'a ServiceNode) -> ServiceRegistration<'a> {
        ServiceRegistration {
            id: key,
            name: &node.service_name,
            address: node.address.to_string(),
            port: node.port,
            meta: &node.tags,
            check: ServiceCheck {
                tcp: node.socket_addr().to_string(),
                timeout: go_duration(self.config.check_timeout()),
                interval: go_duration(self.config.check_interval()),
                deregister_critical_service_after: go_duration(
                    self.config.deregister_critical_after(),
                ),
                status: HEALTH_PASSING,
            },
        }
    }

    async fn watch_loop(
        self,
        service_name: String,
        tx: mpsc::Sender<WatchBatch>,
        cancel: CancellationToken,
    ) {
        let mut index = 0u64;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.health_service(&service_name, Some(index)) => result,
            };

            match result {
                Ok((new_index, entries)) => {
                    match next_index(index, new_index) {
                        IndexStep::Unchanged => continue,
                        IndexStep::Reset => {
                            debug!(
                                service = %service_name,
                                index,
                                new_index,
                                "Consul index went backwards, resetting"
                            );
                            index = 0;
                            continue;
                        }
                        IndexStep::Advance(next) => index = next,
                    }

                    let records = snapshot_records(entries, &service_name);
                    debug!(service = %service_name, index, nodes = records.len(), "Consul snapshot received");
                    if tx.send(WatchBatch::Snapshot(records)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(service = %service_name, error = %e, "Consul blocking query failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_interval()) => {}
                    }
                }
            }
        }
        debug!(service = %service_name, "Consul watch stopped");
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn liveness(&self) -> Liveness {
        Liveness::Delegated
    }

    async fn pull(&self, service_name: &str) -> Result<Vec<(String, ServiceNode)>> {
        let (_, entries) = self.health_service(service_name, None).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.service.service == service_name)
            .filter_map(|entry| entry.into_node(service_name))
            .map(|node| (node.key(), node))
            .collect())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchBatch>> {
        let (tx, rx) = mpsc::channel(self.watch_buffer);
        tokio::spawn(self.clone().watch_loop(service_name.to_string(), tx, cancel));
        Ok(rx)
    }

    async fn put_record(
        &self,
        key: &str,
        node: &ServiceNode,
        _lease: Option<LeaseId>,
    ) -> Result<()> {
        let registration = self.registration(key, node);

        self.http
            .put(self.url("/v1/agent/service/register"))
            .json(&registration)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        self.http
            .put(self.url(&format!("/v1/agent/service/deregister/{}", key)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.http
            .get(self.url("/v1/status/leader"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

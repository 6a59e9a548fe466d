//! etcd 服务发现后端
//!
//! 节点记录存放在 `{key_prefix}{节点键}`，值为节点的 JSON 编码，
//! 通过租约绑定存活时间，监听使用前缀 watch 推送增量事件。

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchResponse,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EtcdConfig, RegistryConfig};
use crate::discovery::backend::{
    DiscoveryBackend, LeaseId, Liveness, Payload, WatchBatch, WatchEvent, WatchRecord,
};
use crate::discovery::node::ServiceNode;
use crate::error::{BackendResultExt, DiscoveryError, ErrorCode, Result};

/// etcd 服务发现后端
///
/// `etcd_client::Client` 内部是共享连接，每次操作克隆一份即可。
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    key_prefix: String,
    watch_buffer: usize,
}

impl EtcdBackend {
    /// 连接 etcd
    pub async fn connect(config: &EtcdConfig, registry: &RegistryConfig) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(registry.dial_timeout());
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                DiscoveryError::connection_failed(format!(
                    "failed to connect to etcd {:?}: {}",
                    config.endpoints, e
                ))
            })?;

        info!(endpoints = ?config.endpoints, prefix = %config.key_prefix, "Connected to etcd");
        Ok(Self::with_client(client, config.key_prefix.clone(), registry.watch_buffer))
    }

    /// 使用已有客户端创建
    pub fn with_client(client: Client, key_prefix: impl Into<String>, watch_buffer: usize) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            watch_buffer: watch_buffer.max(1),
        }
    }

    fn store_key(&self, node_key: &str) -> String {
        format!("{}{}", self.key_prefix, node_key)
    }

    fn service_prefix(&self, service_name: &str) -> String {
        format!("{}{}/", self.key_prefix, service_name)
    }

    fn node_key<'a>(&self, store_key: &'a str) -> &'a str {
        store_key.strip_prefix(&self.key_prefix).unwrap_or(store_key)
    }

    fn translate(&self, resp: &WatchResponse) -> Vec<WatchEvent> {
        resp.events()
            .iter()
            .filter_map(|event| {
                let kv = event.kv()?;
                let key = match kv.key_str() {
                    Ok(key) => self.node_key(key).to_string(),
                    Err(e) => {
                        warn!(error = %e, "Skipped etcd event with non-utf8 key");
                        return None;
                    }
                };
                Some(match event.event_type() {
                    EventType::Put => {
                        WatchEvent::Put(WatchRecord::new(key, Payload::Encoded(kv.value().to_vec())))
                    }
                    EventType::Delete => WatchEvent::Delete { key },
                })
            })
            .collect()
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    fn liveness(&self) -> Liveness {
        Liveness::Lease
    }

    async fn pull(&self, service_name: &str) -> Result<Vec<(String, ServiceNode)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                self.service_prefix(service_name),
                Some(GetOptions::new().with_prefix()),
            )
            .await?;

        let mut nodes = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .or_code(ErrorCode::DeserializationError, "invalid etcd key")?;
            nodes.push((self.node_key(key).to_string(), ServiceNode::decode(kv.value())?));
        }
        Ok(nodes)
    }

    async fn subscribe(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchBatch>> {
        let mut client = self.client.clone();
        let prefix = self.service_prefix(service_name);
        let (watcher, mut stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .or_code(ErrorCode::WatchFailed, "failed to open etcd watch")?;

        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let backend = self.clone();
        tokio::spawn(async move {
            // watcher 被 drop 时服务端会取消 watch，必须和流一起存活
            let mut watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = stream.next() => message,
                };
                match message {
                    Some(Ok(resp)) => {
                        if resp.canceled() {
                            warn!(prefix = %prefix, reason = %resp.cancel_reason(), "etcd watch canceled by server");
                            break;
                        }
                        let events = backend.translate(&resp);
                        if events.is_empty() {
                            continue;
                        }
                        if tx.send(WatchBatch::Events(events)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(prefix = %prefix, error = %e, "etcd watch stream failed");
                        break;
                    }
                    None => break,
                }
            }
            if let Err(e) = watcher.cancel().await {
                debug!(prefix = %prefix, error = %e, "Failed to cancel etcd watcher");
            }
            debug!(prefix = %prefix, "etcd watch stopped");
        });

        Ok(rx)
    }

    async fn put_record(
        &self,
        key: &str,
        node: &ServiceNode,
        lease: Option<LeaseId>,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));
        client.put(self.store_key(key), node.encode()?, options).await?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(self.store_key(key), None).await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .or_code(ErrorCode::LeaseGrantFailed, "failed to grant etcd lease")?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease.0).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(DiscoveryError::lease_expired(lease.0)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease.0).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut client = self.client.clone();
        client.status().await?;
        Ok(())
    }
}

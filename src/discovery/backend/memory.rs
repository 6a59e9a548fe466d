//! 内存服务发现后端
//!
//! 进程内的协调存储，支持租约、增量/快照两种监听模式和故障注入，
//! 用于本地开发和测试。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::backend::{
    DiscoveryBackend, LeaseId, Liveness, Payload, WatchBatch, WatchEvent, WatchRecord,
};
use crate::discovery::node::ServiceNode;
use crate::error::{DiscoveryError, Result};

/// 监听通知方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// 逐条增量事件
    #[default]
    Incremental,
    /// 每次变化推送服务的全量快照
    Snapshot,
}

struct StoredRecord {
    service_name: String,
    payload: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

struct Subscriber {
    service_name: String,
    inbox: mpsc::UnboundedSender<WatchBatch>,
    cancel: CancellationToken,
}

enum Change {
    Put {
        service_name: String,
        key: String,
        payload: Vec<u8>,
    },
    Delete {
        service_name: String,
        key: String,
    },
}

impl Change {
    fn service_name(&self) -> &str {
        match self {
            Change::Put { service_name, .. } | Change::Delete { service_name, .. } => service_name,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, StoredRecord>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: i64,
    subscribers: Vec<Subscriber>,
    unavailable: bool,
    fail_renewals: bool,
}

impl MemoryState {
    /// 清理过期租约及其记录
    fn reap_expired(&mut self, now: Instant) -> Vec<Change> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .flat_map(|id| self.drop_lease(id))
            .collect()
    }

    fn drop_lease(&mut self, lease: LeaseId) -> Vec<Change> {
        self.leases.remove(&lease);
        let keys: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                self.records.remove(&key).map(|record| Change::Delete {
                    service_name: record.service_name,
                    key,
                })
            })
            .collect()
    }

    fn snapshot(&self, service_name: &str) -> Vec<WatchRecord> {
        self.records
            .iter()
            .filter(|(_, record)| record.service_name == service_name)
            .map(|(key, record)| {
                WatchRecord::new(key.clone(), Payload::Encoded(record.payload.clone()))
            })
            .collect()
    }

    fn notify(&mut self, mode: WatchMode, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }

        let mut services: Vec<String> = Vec::new();
        for change in &changes {
            if !services.iter().any(|s| s == change.service_name()) {
                services.push(change.service_name().to_string());
            }
        }

        for service_name in services {
            let batch = match mode {
                WatchMode::Incremental => WatchBatch::Events(
                    changes
                        .iter()
                        .filter(|change| change.service_name() == service_name)
                        .map(|change| match change {
                            Change::Put { key, payload, .. } => WatchEvent::Put(WatchRecord::new(
                                key.clone(),
                                Payload::Encoded(payload.clone()),
                            )),
                            Change::Delete { key, .. } => WatchEvent::Delete { key: key.clone() },
                        })
                        .collect(),
                ),
                WatchMode::Snapshot => {
                    // 被删除的节点仍出现在子节点列表里，但已读不到数据
                    let mut records = self.snapshot(&service_name);
                    for change in &changes {
                        if let Change::Delete { service_name: s, key } = change {
                            if *s == service_name {
                                records.push(WatchRecord::new(key.clone(), Payload::Gone));
                            }
                        }
                    }
                    WatchBatch::Snapshot(records)
                }
            };

            self.subscribers.retain(|sub| {
                if sub.cancel.is_cancelled() {
                    return false;
                }
                if sub.service_name != service_name {
                    return true;
                }
                sub.inbox.send(batch.clone()).is_ok()
            });
        }
    }
}

/// 内存服务发现后端
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    mode: WatchMode,
    liveness: Liveness,
    buffer: usize,
    pulls: AtomicUsize,
    subscribes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// 创建增量监听、基于租约的内存后端
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_lease: 1,
                ..Default::default()
            })),
            mode: WatchMode::Incremental,
            liveness: Liveness::Lease,
            buffer: 64,
            pulls: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
        }
    }

    /// 设置监听模式
    pub fn with_mode(mut self, mode: WatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// 设置存活方式
    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// 设置订阅通道容量
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    // ============================================================
    // 故障注入与观测
    // ============================================================

    /// 模拟后端不可用：拉取、订阅、写入、续约全部失败
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// 模拟续约失败（租约本身保持不变）
    pub fn fail_renewals(&self, fail: bool) {
        self.state.lock().fail_renewals = fail;
    }

    /// 模拟服务端租约过期，删除其绑定的记录，返回删除的记录数
    pub fn expire_lease(&self, lease: LeaseId) -> usize {
        let mut state = self.state.lock();
        let changes = state.drop_lease(lease);
        let removed = changes.len();
        state.notify(self.mode, changes);
        removed
    }

    /// 关闭某个服务的全部订阅
    pub fn close_watches(&self, service_name: &str) {
        self.state
            .lock()
            .subscribers
            .retain(|sub| sub.service_name != service_name);
    }

    /// 直接写入原始负载（不绑定租约），用于构造无法解码的记录
    pub fn put_raw(&self, service_name: &str, key: &str, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.records.insert(
            key.to_string(),
            StoredRecord {
                service_name: service_name.to_string(),
                payload: payload.clone(),
                lease: None,
            },
        );
        state.notify(
            self.mode,
            vec![Change::Put {
                service_name: service_name.to_string(),
                key: key.to_string(),
                payload,
            }],
        );
    }

    /// 记录是否存在
    pub fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let changes = state.reap_expired(Instant::now());
        state.notify(self.mode, changes);
        state.records.contains_key(key)
    }

    /// 记录绑定的租约
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state.lock().records.get(key).and_then(|r| r.lease)
    }

    /// 有效租约数量
    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// 拉取次数
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// 订阅次数
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    fn check_available(&self, state: &MemoryState) -> Result<()> {
        if state.unavailable {
            return Err(DiscoveryError::unavailable("memory backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn liveness(&self) -> Liveness {
        self.liveness
    }

    async fn pull(&self, service_name: &str) -> Result<Vec<(String, ServiceNode)>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.check_available(&state)?;
        let changes = state.reap_expired(Instant::now());
        state.notify(self.mode, changes);

        state
            .records
            .iter()
            .filter(|(_, record)| record.service_name == service_name)
            .map(|(key, record)| Ok((key.clone(), ServiceNode::decode(&record.payload)?)))
            .collect()
    }

    async fn subscribe(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchBatch>> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(self.buffer);

        {
            let mut state = self.state.lock();
            self.check_available(&state)?;
            state.subscribers.push(Subscriber {
                service_name: service_name.to_string(),
                inbox: inbox_tx,
                cancel: cancel.clone(),
            });
        }

        // 写入方不会因为订阅方消费慢而阻塞
        let service = service_name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = inbox_rx.recv() => match batch {
                        Some(batch) => {
                            if tx.send(batch).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(service = %service, "memory watch forwarder stopped");
        });

        Ok(rx)
    }

    async fn put_record(
        &self,
        key: &str,
        node: &ServiceNode,
        lease: Option<LeaseId>,
    ) -> Result<()> {
        let payload = node.encode()?;
        let mut state = self.state.lock();
        self.check_available(&state)?;
        let mut changes = state.reap_expired(Instant::now());

        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                state.notify(self.mode, changes);
                return Err(DiscoveryError::lease_expired(lease.0));
            }
        }

        state.records.insert(
            key.to_string(),
            StoredRecord {
                service_name: node.service_name.clone(),
                payload: payload.clone(),
                lease,
            },
        );
        changes.push(Change::Put {
            service_name: node.service_name.clone(),
            key: key.to_string(),
            payload,
        });
        state.notify(self.mode, changes);
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.check_available(&state)?;
        let mut changes = state.reap_expired(Instant::now());
        if let Some(record) = state.records.remove(key) {
            changes.push(Change::Delete {
                service_name: record.service_name,
                key: key.to_string(),
            });
        }
        state.notify(self.mode, changes);
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock();
        self.check_available(&state)?;
        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        self.check_available(&state)?;
        if state.fail_renewals {
            return Err(DiscoveryError::network(format!(
                "keep-alive for lease {} rejected",
                lease
            )));
        }
        let now = Instant::now();
        let changes = state.reap_expired(now);
        state.notify(self.mode, changes);
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + entry.ttl;
                Ok(())
            }
            None => Err(DiscoveryError::lease_expired(lease.0)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        self.check_available(&state)?;
        let changes = state.drop_lease(lease);
        state.notify(self.mode, changes);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let state = self.state.lock();
        self.check_available(&state)
    }
}

//! 租约续约
//!
//! 每个通过租约注册的节点一个续约任务，按 TTL/2 续约。
//! 续约失败即视为节点已失效：立即从本地缓存的所有服务中移除并停止，不重试。

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::backend::{DiscoveryBackend, LeaseId};
use crate::discovery::cache::NodeCache;
use crate::discovery::node::ServiceNode;

/// 本注册中心登记过的节点
pub(crate) struct Registration {
    pub(crate) node: ServiceNode,
    pub(crate) lease: Option<LeaseId>,
    pub(crate) cancel: Option<CancellationToken>,
}

pub(crate) type Registrations = Arc<DashMap<String, Registration>>;

pub(crate) struct LeaseRenewer {
    pub(crate) node_key: String,
    pub(crate) lease: LeaseId,
    pub(crate) interval: Duration,
    pub(crate) backend: Arc<dyn DiscoveryBackend>,
    pub(crate) cache: Arc<NodeCache>,
    pub(crate) registrations: Registrations,
    pub(crate) cancel: CancellationToken,
}

impl LeaseRenewer {
    /// 续约间隔为 TTL 的一半
    pub(crate) fn interval_for(ttl: Duration) -> Duration {
        (ttl / 2).max(Duration::from_millis(1))
    }

    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.backend.keep_alive(self.lease) => result,
            };

            match result {
                Ok(()) => {
                    debug!(node_key = %self.node_key, lease_id = %self.lease, "Lease renewed");
                }
                Err(e) => {
                    let evicted = self.cache.evict_everywhere(&self.node_key);
                    let lease = self.lease;
                    self.registrations
                        .remove_if(&self.node_key, |_, reg| reg.lease == Some(lease));
                    warn!(
                        node_key = %self.node_key,
                        lease_id = %self.lease,
                        evicted,
                        error = %e,
                        "Lease renewal failed, node evicted from local cache"
                    );
                    return;
                }
            }
        }

        debug!(node_key = %self.node_key, lease_id = %self.lease, "Lease renewer stopped");
    }
}

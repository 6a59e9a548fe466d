//! 服务节点定义

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// 权重标签名（加权轮询读取）
pub const WEIGHT_TAG: &str = "weight";

/// 服务节点
///
/// `(service_name, address, port)` 三元组全局唯一，即节点键；
/// 节点键相同的两个节点视为同一节点，标签以最近一次写入为准。
///
/// 存储在 KV 后端中的编码为 JSON，字段名为 `ServiceName` / `IP` / `Port` / `Tags`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceNode {
    /// 服务名
    pub service_name: String,

    /// 节点地址
    #[serde(rename = "IP")]
    pub address: IpAddr,

    /// 端口
    pub port: u16,

    /// 标签（用于过滤，同时携带 `weight`）
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: HashMap<String, String>,
}

impl ServiceNode {
    /// 创建新的服务节点
    pub fn new(service_name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            address,
            port,
            tags: HashMap::new(),
        }
    }

    /// 添加标签
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// 设置权重标签
    pub fn with_weight(self, weight: u64) -> Self {
        self.with_tag(WEIGHT_TAG, weight.to_string())
    }

    /// 节点键：`{service_name}/{address}:{port}`
    pub fn key(&self) -> String {
        node_key(&self.service_name, self.address, self.port)
    }

    /// 节点的网络地址
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// 权重，缺失或无法解析时为 0
    pub fn weight(&self) -> u64 {
        self.tags
            .get(WEIGHT_TAG)
            .and_then(|w| w.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// 检查是否匹配标签过滤器
    pub fn matches_tags(&self, filter: &HashMap<String, String>) -> bool {
        match_tags(&self.tags, filter)
    }

    /// 编码为存储格式
    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从存储格式解码
    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 构造节点键
pub fn node_key(service_name: &str, address: IpAddr, port: u16) -> String {
    format!("{}/{}", service_name, SocketAddr::new(address, port))
}

/// 标签匹配：过滤器中的每个键都必须以相同的值出现在节点标签中，空过滤器匹配所有节点
pub fn match_tags(node_tags: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(key, value)| node_tags.get(key).map(|v| v == value).unwrap_or(false))
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

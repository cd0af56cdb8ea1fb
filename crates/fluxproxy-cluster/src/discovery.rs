//! 服务发现协作接口
//!
//! 提供期望的后端拓扑、集群定义与标签路由表,并在变化时推送失效通知。
//! `StaticDiscovery` 把拓扑保存在内存中,可从 TOML 文件加载与重载。

use async_trait::async_trait;
use fluxproxy_backend::HostInfo;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{ClusterError, ClusterResult};

/// 标签路由表状态: 稳定
pub const TAG_STATUS_READY: &str = "ready";
/// 标签路由表状态: 迁移中
pub const TAG_STATUS_CHANGED: &str = "changed";

/// 集群定义
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub host_list: Vec<String>,
    /// 可写但不参与读的后端
    #[serde(default)]
    pub unreadable_host_list: Vec<String>,
}

/// 单个标签路由键对应的后端
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    #[serde(default)]
    pub host_list: Vec<String>,
    /// 迁移目标,只写不读
    #[serde(default)]
    pub unreadable_host_list: Vec<String>,
    /// 待下线的后端,迁移完成前仍可读写
    #[serde(default)]
    pub delete_host_list: Vec<String>,
    #[serde(default = "default_tag_status")]
    pub status: String,
}

fn default_tag_status() -> String {
    TAG_STATUS_READY.to_string()
}

impl TagInfo {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            host_list: hosts.iter().map(|h| h.to_string()).collect(),
            unreadable_host_list: Vec::new(),
            delete_host_list: Vec::new(),
            status: default_tag_status(),
        }
    }

    /// 读集合
    pub fn read_hosts(&self) -> Vec<String> {
        self.host_list.clone()
    }

    /// 写集合: 读集合并上不可读的后端
    pub fn write_hosts(&self) -> Vec<String> {
        let mut hosts = self.host_list.clone();
        for host in &self.unreadable_host_list {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }
}

/// 完整拓扑快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub hosts: HashMap<String, HostInfo>,
    #[serde(default)]
    pub clusters: HashMap<String, ClusterInfo>,
    /// 集群名 -> 路由键 -> 标签信息
    #[serde(default)]
    pub tags: HashMap<String, HashMap<String, TagInfo>>,
}

impl Topology {
    pub fn from_toml(content: &str) -> ClusterResult<Self> {
        toml::from_str(content).map_err(|e| ClusterError::Discovery(format!("invalid topology: {}", e)))
    }
}

/// 服务发现接口
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn hosts(&self) -> ClusterResult<HashMap<String, HostInfo>>;

    async fn clusters(&self) -> ClusterResult<HashMap<String, ClusterInfo>>;

    /// 集群的标签路由表
    async fn tag_infos(&self, cluster: &str) -> ClusterResult<HashMap<String, TagInfo>>;

    /// 订阅集群路由表的变更通知
    fn subscribe(&self, cluster: &str) -> broadcast::Receiver<()>;
}

/// 内存拓扑实现
pub struct StaticDiscovery {
    topology: RwLock<Topology>,
    path: Option<PathBuf>,
    watchers: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl StaticDiscovery {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology: RwLock::new(topology),
            path: None,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// # Brief
    /// 从 TOML 拓扑文件加载
    ///
    /// # Arguments
    /// * `path` - 拓扑文件路径,`reload` 时重新读取
    pub fn from_file(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let path = path.as_ref().to_path_buf();
        let topology = read_topology(&path)?;
        info!("topology loaded from {}", path.display());
        Ok(Self {
            topology: RwLock::new(topology),
            path: Some(path),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// 重新读取拓扑文件,内容变化时通知订阅者
    ///
    /// # Returns
    /// 拓扑是否发生变化
    pub fn reload(&self) -> ClusterResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let topology = read_topology(path)?;
        Ok(self.update(topology))
    }

    /// 替换拓扑,路由表变化的集群收到通知
    pub fn update(&self, topology: Topology) -> bool {
        let changed: Vec<String> = {
            let mut current = self.topology.write();
            if *current == topology {
                return false;
            }
            let mut clusters: Vec<String> = topology
                .tags
                .iter()
                .filter(|(name, tags)| current.tags.get(*name) != Some(*tags))
                .map(|(name, _)| name.clone())
                .collect();
            clusters.extend(
                current
                    .tags
                    .keys()
                    .filter(|name| !topology.tags.contains_key(*name))
                    .cloned(),
            );
            *current = topology;
            clusters
        };
        for cluster in changed {
            self.notify(&cluster);
        }
        true
    }

    /// 替换单个集群的路由表并通知
    pub fn set_tag_infos(&self, cluster: &str, infos: HashMap<String, TagInfo>) {
        self.topology.write().tags.insert(cluster.to_string(), infos);
        self.notify(cluster);
    }

    pub fn snapshot(&self) -> Topology {
        self.topology.read().clone()
    }

    fn notify(&self, cluster: &str) {
        if let Some(tx) = self.watchers.lock().get(cluster) {
            // 没有订阅者时发送失败,忽略即可
            let _ = tx.send(());
            debug!("notify tag change of cluster {}", cluster);
        }
    }
}

fn read_topology(path: &Path) -> ClusterResult<Topology> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClusterError::Discovery(format!("read {} failed: {}", path.display(), e)))?;
    Topology::from_toml(&content)
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn hosts(&self) -> ClusterResult<HashMap<String, HostInfo>> {
        Ok(self.topology.read().hosts.clone())
    }

    async fn clusters(&self) -> ClusterResult<HashMap<String, ClusterInfo>> {
        Ok(self.topology.read().clusters.clone())
    }

    async fn tag_infos(&self, cluster: &str) -> ClusterResult<HashMap<String, TagInfo>> {
        Ok(self.topology.read().tags.get(cluster).cloned().unwrap_or_default())
    }

    fn subscribe(&self, cluster: &str) -> broadcast::Receiver<()> {
        self.watchers
            .lock()
            .entry(cluster.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }
}

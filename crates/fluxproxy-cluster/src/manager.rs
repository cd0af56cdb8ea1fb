//! 集群管理器
//!
//! 与 `BackendManager` 相同的差异调和语义: 新增、变更、删除三类操作,
//! 任一失败整体回滚。集群成员通过 `BackendManager` 按名称解析。

use fluxproxy_backend::{Backend, BackendManager};
use fluxproxy_common::{ClusterSettings, MetricsSink};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{ClusterInfo, Discovery};
use crate::route_cluster::RouteCluster;
use crate::{ClusterError, ClusterResult};

#[derive(Clone, Default)]
struct ClusterState {
    clusters: HashMap<String, Arc<RouteCluster>>,
    infos: HashMap<String, ClusterInfo>,
}

/// 集群管理器
pub struct ClusterManager {
    backends: Arc<BackendManager>,
    discovery: Arc<dyn Discovery>,
    settings: ClusterSettings,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    state: RwLock<ClusterState>,
    refresh_lock: tokio::sync::Mutex<()>,
    snapshot: Mutex<Option<ClusterState>>,
}

impl ClusterManager {
    pub fn new(
        backends: Arc<BackendManager>,
        discovery: Arc<dyn Discovery>,
        settings: ClusterSettings,
        metrics: Arc<dyn MetricsSink>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            backends,
            discovery,
            settings,
            metrics,
            cancel: parent.child_token(),
            state: RwLock::new(ClusterState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            snapshot: Mutex::new(None),
        }
    }

    fn resolve(&self, info: &ClusterInfo) -> ClusterResult<Vec<Arc<dyn Backend>>> {
        Ok(self.backends.get_backend_list(&info.host_list)?)
    }

    async fn make_cluster(&self, name: &str, info: &ClusterInfo) -> ClusterResult<Arc<RouteCluster>> {
        let backends = self.resolve(info)?;
        let cluster = RouteCluster::new(
            name,
            backends,
            &info.unreadable_host_list,
            self.discovery.clone(),
            &self.settings,
            self.metrics.clone(),
            &self.cancel,
        )
        .await?;
        Ok(Arc::new(cluster))
    }

    /// 成员与后端管理器中当前实例不一致,说明后端被重建过
    fn is_stale(&self, cluster: &RouteCluster, info: &ClusterInfo) -> bool {
        let Ok(current) = self.resolve(info) else {
            return true;
        };
        let members = cluster.backends();
        members.len() != current.len() || members.iter().zip(current.iter()).any(|(a, b)| !Arc::ptr_eq(a, b))
    }

    /// # Brief
    /// 按期望的集群定义刷新
    ///
    /// # Returns
    /// 任一新增或变更失败时回滚并返回 `RefreshFailed`
    pub async fn refresh(&self, desired: HashMap<String, ClusterInfo>) -> ClusterResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.state.read().clone();

        let mut add = Vec::new();
        let mut modify = Vec::new();
        for (name, info) in &desired {
            match (current.infos.get(name), current.clusters.get(name)) {
                (Some(old), Some(cluster)) => {
                    if old != info || self.is_stale(cluster, info) {
                        modify.push((name.clone(), old.clone(), info.clone()));
                    }
                }
                _ => add.push((name.clone(), info.clone())),
            }
        }
        let delete: Vec<String> = current
            .clusters
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();

        if add.is_empty() && modify.is_empty() && delete.is_empty() {
            debug!("clusters have no change");
            return Ok(());
        }
        info!(
            "refresh clusters, add:{} modify:{} delete:{}",
            add.len(),
            modify.len(),
            delete.len()
        );

        let mut staged = current.clusters.clone();
        let mut added: Vec<Arc<RouteCluster>> = Vec::new();
        let mut modified: Vec<(Arc<RouteCluster>, Vec<Arc<dyn Backend>>, ClusterInfo)> = Vec::new();
        let mut failed = false;

        for (name, info) in &add {
            match self.make_cluster(name, info).await {
                Ok(cluster) => {
                    staged.insert(name.clone(), cluster.clone());
                    added.push(cluster);
                }
                Err(e) => {
                    error!("add cluster {} failed: {}", name, e);
                    failed = true;
                }
            }
        }

        for (name, old, info) in &modify {
            let Some(cluster) = staged.get(name) else {
                error!("modify cluster {} failed: not running", name);
                failed = true;
                continue;
            };
            match self.resolve(info) {
                Ok(backends) => {
                    let previous = cluster.backends();
                    cluster.reset(backends, &info.unreadable_host_list);
                    modified.push((cluster.clone(), previous, old.clone()));
                }
                Err(e) => {
                    error!("modify cluster {} failed: {}", name, e);
                    failed = true;
                }
            }
        }

        if failed {
            for cluster in added {
                cluster.close();
            }
            for (cluster, previous, old) in modified {
                cluster.reset(previous, &old.unreadable_host_list);
            }
            error!("refresh clusters failed, rolled back");
            return Err(ClusterError::RefreshFailed);
        }

        for name in &delete {
            if let Some(cluster) = staged.remove(name) {
                info!("cluster {} removed", cluster);
                cluster.close();
            }
        }

        *self.state.write() = ClusterState {
            clusters: staged,
            infos: desired,
        };
        Ok(())
    }

    pub fn get_cluster(&self, name: &str) -> ClusterResult<Arc<RouteCluster>> {
        self.state
            .read()
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::ClusterNotExist(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().clusters.keys().cloned().collect();
        names.sort();
        names
    }

    /// 保存当前集群快照,供 `recover` 回滚
    pub fn backup(&self) {
        *self.snapshot.lock() = Some(self.state.read().clone());
    }

    /// # Brief
    /// 回滚到最近一次 `backup` 的集群
    ///
    /// 快照之后新增的集群被关闭,其余集群按快照中的定义重新解析成员,
    /// 被删除的集群按原定义重建
    pub async fn recover(&self) -> ClusterResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let snapshot = self.snapshot.lock().take().ok_or(ClusterError::BackupIsNil)?;
        let current = self.state.read().clone();

        let mut restored = HashMap::with_capacity(snapshot.infos.len());
        for (name, cluster) in &current.clusters {
            match (snapshot.clusters.get(name), snapshot.infos.get(name)) {
                (Some(old), Some(info)) if Arc::ptr_eq(old, cluster) => {
                    cluster.reset(self.resolve(info)?, &info.unreadable_host_list);
                    restored.insert(name.clone(), cluster.clone());
                }
                _ => cluster.close(),
            }
        }
        for (name, info) in &snapshot.infos {
            if restored.contains_key(name) {
                continue;
            }
            warn!("cluster {} was removed after backup, rebuild it", name);
            let rebuilt = self.make_cluster(name, info).await?;
            restored.insert(name.clone(), rebuilt);
        }

        *self.state.write() = ClusterState {
            clusters: restored,
            infos: snapshot.infos,
        };
        info!("clusters recovered to backup");
        Ok(())
    }

    /// 停止全部集群的路由表监听
    pub fn stop(&self) {
        self.cancel.cancel();
        for cluster in self.state.read().clusters.values() {
            cluster.close();
        }
        info!("cluster manager stopped");
    }

    /// 每行一个集群的描述
    pub fn print(&self) -> String {
        let mut lines: Vec<String> = self.state.read().clusters.values().map(|c| c.to_string()).collect();
        lines.sort();
        lines.join("\n")
    }
}

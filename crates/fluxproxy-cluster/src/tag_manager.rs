//! 标签路由表
//!
//! 维护 路由键 -> (读后端集合, 写后端集合) 的映射。路由表在两种情况下刷新:
//! 查找未命中时按需刷新一次,以及收到服务发现的变更通知时。

use fluxproxy_backend::Backend;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, TagInfo};
use crate::{ClusterError, ClusterResult};

#[derive(Clone, Default)]
struct Route {
    read: Vec<Arc<dyn Backend>>,
    write: Vec<Arc<dyn Backend>>,
}

#[derive(Default)]
struct TagState {
    /// 集群内可用于解析的后端
    backends: HashMap<String, Arc<dyn Backend>>,
    infos: HashMap<String, TagInfo>,
    routes: HashMap<String, Route>,
}

#[derive(Clone, Copy)]
enum Side {
    Read,
    Write,
}

/// 集群的标签路由表管理器
pub struct TagInfoManager {
    cluster: String,
    discovery: Arc<dyn Discovery>,
    state: RwLock<TagState>,
    refresh_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TagInfoManager {
    pub fn new(
        cluster: &str,
        discovery: Arc<dyn Discovery>,
        backends: &[Arc<dyn Backend>],
        parent: &CancellationToken,
    ) -> Self {
        let state = TagState {
            backends: index(backends),
            ..Default::default()
        };
        Self {
            cluster: cluster.to_string(),
            discovery,
            state: RwLock::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
            cancel: parent.child_token(),
            watcher: Mutex::new(None),
        }
    }

    /// 从服务发现重新拉取路由表
    pub async fn refresh(&self) -> ClusterResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let infos = self.discovery.tag_infos(&self.cluster).await?;
        let mut state = self.state.write();
        state.routes = build_routes(&self.cluster, &state.backends, &infos);
        state.infos = infos;
        debug!("cluster {} tag routes refreshed, keys: {}", self.cluster, state.routes.len());
        Ok(())
    }

    /// # Brief
    /// 获取路由键的写后端集合
    ///
    /// 未命中时刷新一次后重试,仍未命中返回 `MatchBackendByTag`
    pub async fn get_write_backends(&self, key: &str) -> ClusterResult<Vec<Arc<dyn Backend>>> {
        self.resolve(key, Side::Write).await
    }

    /// 获取路由键的读后端集合,未命中规则同写
    pub async fn get_read_backends(&self, key: &str) -> ClusterResult<Vec<Arc<dyn Backend>>> {
        self.resolve(key, Side::Read).await
    }

    async fn resolve(&self, key: &str, side: Side) -> ClusterResult<Vec<Arc<dyn Backend>>> {
        if let Some(list) = self.lookup(key, side) {
            return Ok(list);
        }
        debug!("cluster {} tag key {} not found, refresh once", self.cluster, key);
        self.refresh().await?;
        self.lookup(key, side)
            .ok_or_else(|| ClusterError::MatchBackendByTag(key.to_string()))
    }

    fn lookup(&self, key: &str, side: Side) -> Option<Vec<Arc<dyn Backend>>> {
        let state = self.state.read();
        let route = state.routes.get(key)?;
        let list = match side {
            Side::Read => &route.read,
            Side::Write => &route.write,
        };
        if list.is_empty() {
            None
        } else {
            Some(list.clone())
        }
    }

    /// 以 `prefix` 开头的全部路由键,已排序
    pub fn get_read_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .routes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// 集群成员变化后,用已有的标签信息重建路由
    pub fn reset(&self, backends: &[Arc<dyn Backend>]) {
        let mut state = self.state.write();
        state.backends = index(backends);
        state.routes = build_routes(&self.cluster, &state.backends, &state.infos);
    }

    /// 启动后台任务,收到变更通知时刷新
    pub fn watch(self: &Arc<Self>) {
        let mut rx = self.discovery.subscribe(&self.cluster);
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(()) | Err(RecvError::Lagged(_)) => {
                            info!("cluster {} tag info changed", manager.cluster);
                            if let Err(e) = manager.refresh().await {
                                warn!("cluster {} refresh tag info failed: {}", manager.cluster, e);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("cluster {} tag watcher exit", manager.cluster);
        });
        if let Some(old) = self.watcher.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn len(&self) -> usize {
        self.state.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn index(backends: &[Arc<dyn Backend>]) -> HashMap<String, Arc<dyn Backend>> {
    backends.iter().map(|b| (b.name().to_string(), b.clone())).collect()
}

fn build_routes(
    cluster: &str,
    backends: &HashMap<String, Arc<dyn Backend>>,
    infos: &HashMap<String, TagInfo>,
) -> HashMap<String, Route> {
    let resolve = |key: &str, names: Vec<String>| -> Vec<Arc<dyn Backend>> {
        names
            .iter()
            .filter_map(|name| {
                let backend = backends.get(name);
                if backend.is_none() {
                    warn!("cluster {} tag key {} refers to unknown backend {}", cluster, key, name);
                }
                backend.cloned()
            })
            .collect()
    };
    infos
        .iter()
        .map(|(key, info)| {
            let route = Route {
                read: resolve(key, info.read_hosts()),
                write: resolve(key, info.write_hosts()),
            };
            (key.clone(), route)
        })
        .collect()
}

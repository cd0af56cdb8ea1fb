//! 后端管理器
//!
//! 将期望的主机拓扑与运行中的后端做差异调和:
//! - 新增: 通过工厂创建后端
//! - 变更: 原地 `reset`
//! - 删除: 关闭后端并在后台等待其排空,`stop` 时一并等待
//!
//! 任一步骤失败时整体回滚,不会出现部分生效的拓扑。

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendFactory, HostInfo};
use crate::{BackendError, BackendResult};

#[derive(Clone, Default)]
struct ManagerState {
    backends: HashMap<String, Arc<dyn Backend>>,
    hosts: HashMap<String, HostInfo>,
}

/// 后端管理器
pub struct BackendManager {
    factory: Arc<dyn BackendFactory>,
    cancel: CancellationToken,
    state: RwLock<ManagerState>,
    /// 串行化刷新与恢复
    refresh_lock: tokio::sync::Mutex<()>,
    snapshot: Mutex<Option<ManagerState>>,
    /// 已移出拓扑、仍在排空的后端
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl BackendManager {
    /// # Brief
    /// 创建管理器
    ///
    /// # Arguments
    /// * `factory` - 后端工厂
    /// * `parent` - 上级取消令牌,所有后端派生自管理器的子令牌
    pub fn new(factory: Arc<dyn BackendFactory>, parent: &CancellationToken) -> Self {
        Self {
            factory,
            cancel: parent.child_token(),
            state: RwLock::new(ManagerState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            snapshot: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// # Brief
    /// 按期望拓扑刷新后端
    ///
    /// # Returns
    /// 任一新增或变更失败时回滚并返回 `RefreshFailed`
    pub async fn refresh(&self, desired: HashMap<String, HostInfo>) -> BackendResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.state.read().clone();

        let mut add = Vec::new();
        let mut modify = Vec::new();
        for (name, host) in &desired {
            match current.hosts.get(name) {
                None => add.push((name.clone(), host.clone())),
                Some(old) if old != host => modify.push((name.clone(), old.clone(), host.clone())),
                Some(_) => {}
            }
        }
        let delete: Vec<String> = current
            .hosts
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();

        if add.is_empty() && modify.is_empty() && delete.is_empty() {
            debug!("backends have no change");
            return Ok(());
        }
        info!(
            "refresh backends, add:{} modify:{} delete:{}",
            add.len(),
            modify.len(),
            delete.len()
        );

        let mut staged = current.backends.clone();
        let mut added: Vec<Arc<dyn Backend>> = Vec::new();
        let mut modified: Vec<(Arc<dyn Backend>, HostInfo)> = Vec::new();
        let mut failed = false;

        for (name, host) in &add {
            match self.factory.create(name, host, &self.cancel).await {
                Ok(backend) => {
                    staged.insert(name.clone(), backend.clone());
                    added.push(backend);
                }
                Err(e) => {
                    error!("add backend {} failed: {}", name, e);
                    failed = true;
                }
            }
        }

        for (name, old, host) in &modify {
            let Some(backend) = staged.get(name) else {
                error!("modify backend {} failed: not running", name);
                failed = true;
                continue;
            };
            match backend.reset(host) {
                Ok(()) => modified.push((backend.clone(), old.clone())),
                Err(e) => {
                    error!("modify backend {} failed: {}", name, e);
                    failed = true;
                }
            }
        }

        if failed {
            for backend in added {
                self.retire(backend);
            }
            for (backend, old) in modified {
                if let Err(e) = backend.reset(&old) {
                    warn!("rollback backend {} failed: {}", backend.name(), e);
                }
            }
            error!("refresh backends failed, rolled back");
            return Err(BackendError::RefreshFailed);
        }

        let mut removed = Vec::new();
        for name in &delete {
            if let Some(backend) = staged.remove(name) {
                removed.push(backend);
            }
        }

        *self.state.write() = ManagerState {
            backends: staged,
            hosts: desired,
        };

        for backend in removed {
            info!("backend {} removed", backend);
            self.retire(backend);
        }
        self.log_status();
        Ok(())
    }

    pub fn get_backend(&self, name: &str) -> BackendResult<Arc<dyn Backend>> {
        self.state
            .read()
            .backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::BackendNotExist(name.to_string()))
    }

    /// # Brief
    /// 按名称列表获取后端,已禁用的后端被跳过
    ///
    /// # Returns
    /// 存在未知名称时返回 `BackendNotExistInList`,携带全部缺失的名称
    pub fn get_backend_list(&self, names: &[String]) -> BackendResult<Vec<Arc<dyn Backend>>> {
        let state = self.state.read();
        let mut list = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match state.backends.get(name) {
                None => missing.push(name.clone()),
                Some(backend) if backend.disabled() => debug!("backend {} disabled, skipped", name),
                Some(backend) => list.push(backend.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(BackendError::BackendNotExistInList(missing));
        }
        Ok(list)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// 保存当前拓扑快照,供 `recover` 回滚
    pub fn backup(&self) {
        *self.snapshot.lock() = Some(self.state.read().clone());
    }

    /// # Brief
    /// 回滚到最近一次 `backup` 的拓扑
    ///
    /// 快照之后新增的后端被关闭,变更的后端恢复原参数,被删除的后端按原参数重建。
    ///
    /// # Returns
    /// 单个后端恢复失败不会中断其余后端的恢复,全部处理完后返回第一个错误;
    /// 重建失败的后端不进入拓扑,下次刷新时重新创建。
    pub async fn recover(&self) -> BackendResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let snapshot = self.snapshot.lock().take().ok_or(BackendError::BackupIsNil)?;
        let current = self.state.read().clone();

        let mut first_err = None;
        let mut restored = snapshot.backends.clone();
        let mut hosts = snapshot.hosts.clone();
        for (name, backend) in &current.backends {
            match snapshot.backends.get(name) {
                Some(old) if Arc::ptr_eq(old, backend) => {
                    let (Some(old_host), Some(host)) = (snapshot.hosts.get(name), current.hosts.get(name)) else {
                        continue;
                    };
                    if old_host == host {
                        continue;
                    }
                    if let Err(e) = backend.reset(old_host) {
                        error!("recover backend {} failed: {}", name, e);
                        first_err.get_or_insert(e);
                    }
                }
                _ => self.retire(backend.clone()),
            }
        }
        for (name, backend) in &snapshot.backends {
            if current.backends.contains_key(name) {
                continue;
            }
            let Some(host) = snapshot.hosts.get(name) else {
                continue;
            };
            warn!("backend {} was removed after backup, rebuild it", backend);
            match self.factory.create(name, host, &self.cancel).await {
                Ok(rebuilt) => {
                    restored.insert(name.clone(), rebuilt);
                }
                Err(e) => {
                    error!("rebuild backend {} failed: {}", name, e);
                    restored.remove(name);
                    hosts.remove(name);
                    first_err.get_or_insert(e);
                }
            }
        }

        *self.state.write() = ManagerState {
            backends: restored,
            hosts,
        };
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("backends recovered to backup");
                Ok(())
            }
        }
    }

    /// 取消所有后端并等待其排空,包括此前已移出拓扑的后端
    pub async fn stop(&self) {
        self.cancel.cancel();
        let backends: Vec<Arc<dyn Backend>> = self.state.read().backends.values().cloned().collect();
        for backend in backends {
            close_backend(backend.as_ref());
            backend.wait().await;
        }
        let retired: Vec<JoinHandle<()>> = std::mem::take(&mut *self.retired.lock());
        for handle in retired {
            if let Err(e) = handle.await {
                error!("retired backend task failed: {}", e);
            }
        }
        info!("backend manager stopped");
    }

    /// 每行一个后端的描述
    pub fn print(&self) -> String {
        let state = self.state.read();
        let mut lines: Vec<String> = state.backends.values().map(|b| b.to_string()).collect();
        lines.sort();
        lines.join("\n")
    }

    /// 关闭后端并在后台等待其任务退出,句柄留给 `stop` 汇合
    fn retire(&self, backend: Arc<dyn Backend>) {
        close_backend(backend.as_ref());
        let handle = tokio::spawn(async move { backend.wait().await });
        let mut retired = self.retired.lock();
        retired.retain(|h| !h.is_finished());
        retired.push(handle);
    }

    fn log_status(&self) {
        let state = self.state.read();
        debug!("running backend count: {}", state.backends.len());
        for backend in state.backends.values() {
            debug!("backend {} status {}", backend, backend.status());
        }
    }
}

fn close_backend(backend: &dyn Backend) {
    if let Err(e) = backend.close() {
        warn!("close backend {} failed: {}", backend.name(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InfluxBackendFactory;
    use crate::backup::MemoryBackupFactory;
    use crate::status::Status;
    use crate::testutil::deps_with;
    use crate::transport::ScriptedTransport;
    use async_trait::async_trait;
    use fluxproxy_common::{
        BackendSettings, FlowId, Headers, PointsReader, QueryParams, RawQuery, RawResponse, Response, WriteParams,
    };
    use std::fmt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeBackend {
        name: String,
        host: RwLock<HostInfo>,
        closed: AtomicBool,
    }

    impl fmt::Display for FakeBackend {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "fake[{}]", self.name)
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }
        async fn write(&self, _: FlowId, _: &WriteParams, _: PointsReader, _: &Headers) -> BackendResult<Response> {
            Ok(Response::new("", 204))
        }
        async fn query(&self, _: FlowId, _: &QueryParams, _: &Headers) -> BackendResult<Response> {
            Ok(Response::new("", 200))
        }
        async fn create_database(&self, _: FlowId, _: &QueryParams, _: &Headers) -> BackendResult<Response> {
            Ok(Response::new("", 200))
        }
        async fn raw_query(&self, _: FlowId, _: RawQuery) -> BackendResult<RawResponse> {
            Ok(RawResponse::default())
        }
        async fn ping(&self, _: Duration) -> BackendResult<(Duration, String)> {
            Ok((Duration::ZERO, String::new()))
        }
        fn readable(&self) -> bool {
            true
        }
        fn disabled(&self) -> bool {
            self.host.read().disabled
        }
        fn version(&self) -> String {
            String::new()
        }
        fn status(&self) -> Status {
            Status::initial()
        }
        fn reset(&self, host: &HostInfo) -> BackendResult<()> {
            *self.host.write() = host.clone();
            Ok(())
        }
        fn close(&self) -> BackendResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn wait(&self) {}
    }

    /// 对指定域名创建失败的工厂
    #[derive(Default)]
    struct FakeFactory {
        fail_domain: RwLock<Option<String>>,
        created: Mutex<Vec<Arc<FakeBackend>>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl BackendFactory for FakeFactory {
        async fn create(&self, name: &str, host: &HostInfo, _: &CancellationToken) -> BackendResult<Arc<dyn Backend>> {
            if self.fail_domain.read().as_deref() == Some(host.domain_name.as_str()) {
                return Err(BackendError::Network("unreachable".into()));
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            let backend = Arc::new(FakeBackend {
                name: name.to_string(),
                host: RwLock::new(host.clone()),
                closed: AtomicBool::new(false),
            });
            self.created.lock().push(backend.clone());
            Ok(backend)
        }
    }

    fn hosts(entries: &[(&str, &str)]) -> HashMap<String, HostInfo> {
        entries
            .iter()
            .map(|(name, domain)| (name.to_string(), HostInfo::new(*domain, 8086)))
            .collect()
    }

    fn manager() -> (BackendManager, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        (BackendManager::new(factory.clone(), &CancellationToken::new()), factory)
    }

    #[tokio::test]
    async fn test_refresh_add_modify_delete() {
        let (manager, factory) = manager();
        manager.refresh(hosts(&[("b1", "h1"), ("b2", "h2")])).await.unwrap();
        assert_eq!(manager.names(), vec!["b1", "b2"]);

        let b1 = manager.get_backend("b1").unwrap();
        let mut desired = hosts(&[("b1", "h1"), ("b3", "h3")]);
        desired.get_mut("b1").unwrap().backup_rate_limit = 5.0;
        manager.refresh(desired).await.unwrap();

        assert_eq!(manager.names(), vec!["b1", "b3"]);
        // 变更的后端原地更新,不重建
        assert!(Arc::ptr_eq(&b1, &manager.get_backend("b1").unwrap()));
        assert_eq!(factory.count.load(Ordering::SeqCst), 3);
        let created = factory.created.lock().clone();
        assert!(created.iter().find(|b| b.name == "b2").unwrap().closed.load(Ordering::SeqCst));
        assert!(matches!(manager.get_backend("b2"), Err(BackendError::BackendNotExist(_))));
    }

    #[tokio::test]
    async fn test_refresh_is_all_or_nothing() {
        let (manager, factory) = manager();
        manager.refresh(hosts(&[("b1", "h1")])).await.unwrap();

        *factory.fail_domain.write() = Some("bad".into());
        let mut desired = hosts(&[("b1", "h1-new"), ("b2", "h2"), ("b3", "bad")]);
        desired.get_mut("b1").unwrap().port = 9999;
        let err = manager.refresh(desired).await.unwrap_err();
        assert!(matches!(err, BackendError::RefreshFailed));

        assert_eq!(manager.names(), vec!["b1"]);
        let created = factory.created.lock().clone();
        let b1 = created.iter().find(|b| b.name == "b1").unwrap();
        assert_eq!(b1.host.read().domain_name, "h1");
        let b2 = created.iter().find(|b| b.name == "b2").unwrap();
        assert!(b2.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_backend_list() {
        let (manager, _) = manager();
        let mut desired = hosts(&[("b1", "h1"), ("b2", "h2")]);
        desired.get_mut("b2").unwrap().disabled = true;
        manager.refresh(desired).await.unwrap();

        let list = manager.get_backend_list(&["b1".to_string(), "b2".to_string()]).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name(), "b1");

        match manager.get_backend_list(&["b1".to_string(), "x".to_string(), "y".to_string()]) {
            Err(BackendError::BackendNotExistInList(missing)) => assert_eq!(missing, vec!["x", "y"]),
            Err(other) => panic!("unexpected error {other}"),
            Ok(list) => panic!("unexpected {} backends", list.len()),
        }
    }

    #[tokio::test]
    async fn test_backup_and_recover() {
        let (manager, factory) = manager();
        assert!(matches!(manager.recover().await, Err(BackendError::BackupIsNil)));

        manager.refresh(hosts(&[("b1", "h1"), ("b2", "h2")])).await.unwrap();
        manager.backup();
        manager.refresh(hosts(&[("b1", "h1-new"), ("b3", "h3")])).await.unwrap();
        manager.recover().await.unwrap();

        assert_eq!(manager.names(), vec!["b1", "b2"]);
        assert_eq!(manager.get_backend("b1").unwrap().to_string(), "fake[b1]");
        let created = factory.created.lock().clone();
        assert!(created.iter().find(|b| b.name == "b3").unwrap().closed.load(Ordering::SeqCst));
        let b1 = created.iter().find(|b| b.name == "b1").unwrap();
        assert_eq!(b1.host.read().domain_name, "h1");
        // b2 在快照后被删除,恢复时重建
        let rebuilt: Vec<_> = created.iter().filter(|b| b.name == "b2").collect();
        assert_eq!(rebuilt.len(), 2);
        assert!(rebuilt[0].closed.load(Ordering::SeqCst));
        assert!(!rebuilt[1].closed.load(Ordering::SeqCst));
        assert!(matches!(manager.recover().await, Err(BackendError::BackupIsNil)));
    }

    #[tokio::test]
    async fn test_recover_continues_after_rebuild_failure() {
        let (manager, factory) = manager();
        manager.refresh(hosts(&[("b1", "h1"), ("b2", "h2")])).await.unwrap();
        manager.backup();
        manager.refresh(hosts(&[("b1", "h1-new"), ("b3", "h3")])).await.unwrap();

        *factory.fail_domain.write() = Some("h2".into());
        let err = manager.recover().await.unwrap_err();
        assert!(matches!(err, BackendError::Network(_)));

        // 其余后端仍然恢复到快照
        assert_eq!(manager.names(), vec!["b1"]);
        let created = factory.created.lock().clone();
        assert_eq!(created.iter().find(|b| b.name == "b1").unwrap().host.read().domain_name, "h1");
        assert!(created.iter().find(|b| b.name == "b3").unwrap().closed.load(Ordering::SeqCst));

        // 重建失败的后端在下次刷新时重新创建
        *factory.fail_domain.write() = None;
        manager.refresh(hosts(&[("b1", "h1"), ("b2", "h2")])).await.unwrap();
        assert_eq!(manager.names(), vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_stop_drains_removed_backend() {
        let transport = ScriptedTransport::healthy();
        let settings = BackendSettings {
            batch_size: 100,
            flush_interval_ms: 3_600_000,
            ..Default::default()
        };
        let factory = Arc::new(InfluxBackendFactory::new(deps_with(
            transport.clone(),
            MemoryBackupFactory::new(),
            settings,
        )));
        let manager = BackendManager::new(factory, &CancellationToken::new());
        manager.refresh(hosts(&[("b1", "127.0.0.1")])).await.unwrap();

        let b1 = manager.get_backend("b1").unwrap();
        let reader = PointsReader::from_bytes(bytes::Bytes::from_static(b"cpu value=1\n"));
        b1.write(1, &WriteParams::new("db1"), reader, &Headers::new()).await.unwrap();
        drop(b1);

        manager.refresh(HashMap::new()).await.unwrap();
        manager.stop().await;

        let writes = transport.requests_to("/write");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].body.as_deref(), Some(&b"cpu value=1\n"[..]));
    }

    #[tokio::test]
    async fn test_stop_closes_all() {
        let (manager, factory) = manager();
        manager.refresh(hosts(&[("b1", "h1"), ("b2", "h2")])).await.unwrap();
        manager.stop().await;
        assert!(factory.created.lock().iter().all(|b| b.closed.load(Ordering::SeqCst)));
        assert_eq!(manager.print().lines().count(), 2);
    }
}

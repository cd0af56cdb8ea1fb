//! 代理上下文
//!
//! `Proxy` 持有配置、指标、传输层、服务发现、后端管理器、集群管理器与取消令牌。
//! 重载流程: 两个管理器先做快照,依次刷新后端与集群;
//! 任一步失败则两者都回滚到快照,继续使用旧拓扑提供服务。

use fluxproxy_backend::{BackendDeps, BackendManager, InfluxBackendFactory, ReqwestTransport, Transport};
use fluxproxy_cluster::{ClusterError, ClusterManager, Discovery, RouteCluster, StaticDiscovery, Topology};
use fluxproxy_common::{FlowId, MetricsSink, TracingMetrics};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::ServerResult;

/// 代理上下文
pub struct Proxy {
    config: ProxyConfig,
    discovery: Arc<StaticDiscovery>,
    backends: Arc<BackendManager>,
    clusters: ClusterManager,
    cancel: CancellationToken,
    flow: AtomicU64,
}

impl Proxy {
    /// # Brief
    /// 按配置创建代理: reqwest 传输层、拓扑文件、tracing 指标
    pub fn from_config(config: ProxyConfig) -> ServerResult<Self> {
        let discovery = match &config.topology_file {
            Some(path) => StaticDiscovery::from_file(path)?,
            None => {
                warn!("no topology file configured, start with empty topology");
                StaticDiscovery::new(Topology::default())
            }
        };
        let transport = Arc::new(ReqwestTransport::new()?);
        Self::new(config, Arc::new(discovery), transport, Arc::new(TracingMetrics))
    }

    /// # Brief
    /// 以注入的依赖创建代理
    ///
    /// # Arguments
    /// * `config` - 代理配置
    /// * `discovery` - 拓扑来源
    /// * `transport` - 访问底层实例的传输层
    /// * `metrics` - 指标接收端
    pub fn new(
        config: ProxyConfig,
        discovery: Arc<StaticDiscovery>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> ServerResult<Self> {
        let cancel = CancellationToken::new();
        let deps = BackendDeps {
            settings: config.backend.clone(),
            transport,
            backup_factory: config.backup_factory()?,
            metrics: metrics.clone(),
        };
        let backends = Arc::new(BackendManager::new(Arc::new(InfluxBackendFactory::new(deps)), &cancel));
        let clusters = ClusterManager::new(
            backends.clone(),
            discovery.clone(),
            config.cluster.clone(),
            metrics,
            &cancel,
        );
        Ok(Self {
            config,
            discovery,
            backends,
            clusters,
            cancel,
            flow: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn backends(&self) -> &BackendManager {
        &self.backends
    }

    pub fn clusters(&self) -> &ClusterManager {
        &self.clusters
    }

    pub fn discovery(&self) -> &Arc<StaticDiscovery> {
        &self.discovery
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 分配新的请求链路标识
    pub fn next_flow(&self) -> FlowId {
        self.flow.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn cluster(&self, name: &str) -> Result<Arc<RouteCluster>, ClusterError> {
        self.clusters.get_cluster(name)
    }

    /// # Brief
    /// 按服务发现的当前拓扑刷新后端与集群
    ///
    /// # Returns
    /// 刷新失败时返回原始错误,此时两个管理器已回滚
    pub async fn reload(&self) -> ServerResult<()> {
        let hosts = self.discovery.hosts().await?;
        let clusters = self.discovery.clusters().await?;

        self.backends.backup();
        self.clusters.backup();

        let result: ServerResult<()> = async {
            self.backends.refresh(hosts).await?;
            self.clusters.refresh(clusters).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!("reload failed, recover to previous topology: {}", e);
            if let Err(e) = self.backends.recover().await {
                warn!("recover backends failed: {}", e);
            }
            if let Err(e) = self.clusters.recover().await {
                warn!("recover clusters failed: {}", e);
            }
            return Err(e);
        }
        debug!("backends:\n{}", self.backends.print());
        debug!("clusters:\n{}", self.clusters.print());
        Ok(())
    }

    /// 定期重读拓扑文件并重载,直到取消
    pub async fn run(&self) -> ServerResult<()> {
        let mut ticker = tokio::time::interval(self.config.reload_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.discovery.reload() {
                        Ok(true) => {
                            info!("topology changed, reload");
                            if let Err(e) = self.reload().await {
                                error!("reload topology failed: {}", e);
                            }
                        }
                        Ok(false) => debug!("topology unchanged"),
                        Err(e) => warn!("read topology failed: {}", e),
                    }
                }
            }
        }
        info!("proxy reload loop exit");
        Ok(())
    }

    /// 先停止集群的路由表监听,再关闭全部后端并等待排空
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.clusters.stop();
        self.backends.stop().await;
        info!("proxy shutdown");
    }
}

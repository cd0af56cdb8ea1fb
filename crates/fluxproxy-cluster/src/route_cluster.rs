//! 标签路由集群
//!
//! 把一组后端组合为一个逻辑写入/查询入口:
//! - 未配置标签: 写入复制到所有后端,查询在全部后端间轮询
//! - 配置了标签: 按路由键分组写入对应后端集合,查询从条件中提取路由键
//! - 建库总是广播到全部后端
//!
//! 写入与建库的并发扇出受信号量限制,单个后端任务 panic 只记为该后端失败。

use bytes::Bytes;
use fluxproxy_backend::{Backend, BackendResult};
use fluxproxy_common::metrics::{BACKEND_PANIC, CLUSTER_REQUEST};
use fluxproxy_common::{
    parse_points, tags_key, tags_key_prefix, ClusterSettings, FlowId, Headers, MetricsSink, PointsReader,
    QueryParams, RawQuery, RawResponse, Response, WriteParams,
};
use futures::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::merge_series_values;
use crate::balance::BalanceMap;
use crate::discovery::Discovery;
use crate::influxql::{dimension_tags, select_tags};
use crate::tag_manager::TagInfoManager;
use crate::{ClusterError, ClusterResult};

/// 透传查询中携带路由信息的请求头
pub const HEADER_DB: &str = "db";
pub const HEADER_MEASUREMENT: &str = "measurement";
pub const HEADER_DIMENSIONS: &str = "dimensions";

#[derive(Clone, Default)]
struct Members {
    backends: Vec<Arc<dyn Backend>>,
    unreadable: HashSet<String>,
}

/// 标签路由集群
pub struct RouteCluster {
    name: String,
    members: RwLock<Members>,
    tags: Arc<TagInfoManager>,
    balance: BalanceMap,
    fanout: Arc<Semaphore>,
    metrics: Arc<dyn MetricsSink>,
}

impl RouteCluster {
    /// # Brief
    /// 创建集群,拉取一次路由表并启动变更监听
    ///
    /// # Arguments
    /// * `name` - 集群名
    /// * `backends` - 集群内全部后端,含不可读的
    /// * `unreadable` - 只写不读的后端名
    /// * `discovery` - 路由表来源
    /// * `settings` - 扇出并发与轮询键上限
    /// * `metrics` - 指标接收端
    /// * `parent` - 上级取消令牌
    pub async fn new(
        name: &str,
        backends: Vec<Arc<dyn Backend>>,
        unreadable: &[String],
        discovery: Arc<dyn Discovery>,
        settings: &ClusterSettings,
        metrics: Arc<dyn MetricsSink>,
        parent: &CancellationToken,
    ) -> ClusterResult<Self> {
        let tags = Arc::new(TagInfoManager::new(name, discovery, &backends, parent));
        tags.refresh().await?;
        tags.watch();

        let cluster = Self {
            name: name.to_string(),
            members: RwLock::new(Members {
                backends,
                unreadable: unreadable.iter().cloned().collect(),
            }),
            tags,
            balance: BalanceMap::new(settings.balance_max_keys),
            fanout: Arc::new(Semaphore::new(settings.fanout_concurrency.max(1))),
            metrics,
        };
        info!("cluster created: {}", cluster);
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.members.read().backends.clone()
    }

    pub fn tag_manager(&self) -> &Arc<TagInfoManager> {
        &self.tags
    }

    /// # Brief
    /// 写入行协议数据
    ///
    /// # Arguments
    /// * `flow` - 请求链路标识
    /// * `params` - 写入参数
    /// * `body` - 原始请求体
    /// * `tag_names` - 路由标签名,为空时写入全部后端
    /// * `header` - 请求头
    ///
    /// # Returns
    /// 任一后端硬失败返回错误;否则优先返回状态码 >= 300 的响应
    pub async fn write(
        &self,
        flow: FlowId,
        params: &WriteParams,
        body: Bytes,
        tag_names: &[String],
        header: &Headers,
    ) -> ClusterResult<Response> {
        let result = self.write_inner(flow, params, body, tag_names, header).await;
        self.request_metric("write", &result, &params.db);
        result
    }

    async fn write_inner(
        &self,
        flow: FlowId,
        params: &WriteParams,
        body: Bytes,
        tag_names: &[String],
        header: &Headers,
    ) -> ClusterResult<Response> {
        let (reader, points) = parse_points(&params.db, body.clone())?;
        if tag_names.is_empty() {
            let backends = self.backends();
            if backends.is_empty() {
                return Err(ClusterError::MissingBackend);
            }
            return self.send_into_backends(flow, "", backends, params, reader, header).await;
        }

        // 保持键首次出现的顺序
        let mut order: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, PointsReader)> = Vec::new();
        for point in &points {
            let key = tags_key(&point.db, &point.measurement, tag_names, &point.tags);
            let index = *order.entry(key.clone()).or_insert_with(|| {
                groups.push((key, PointsReader::new(body.clone())));
                groups.len() - 1
            });
            groups[index].1.append_index(point.start, point.end)?;
        }
        debug!("flow {} cluster {} write {} points in {} groups", flow, self.name, points.len(), groups.len());

        let tasks = groups.into_iter().map(|(key, reader)| async move {
            let backends = self.tags.get_write_backends(&key).await?;
            self.send_into_backends(flow, &key, backends, params, reader, header).await
        });

        let mut picked = Picked::default();
        let mut first_err = None;
        for result in join_all(tasks).await {
            match result {
                Ok(resp) => picked.push(resp),
                Err(e) => {
                    error!("flow {} cluster {} write group failed: {}", flow, self.name, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(picked.finish().unwrap_or_else(|| Response::new("", 204)))
    }

    async fn send_into_backends(
        &self,
        flow: FlowId,
        key: &str,
        backends: Vec<Arc<dyn Backend>>,
        params: &WriteParams,
        reader: PointsReader,
        header: &Headers,
    ) -> ClusterResult<Response> {
        let mut handles = Vec::with_capacity(backends.len());
        for backend in backends {
            let permit = self
                .fanout
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ClusterError::WriteFailed(e.to_string()))?;
            let name = backend.name().to_string();
            let params = params.clone();
            let header = header.clone();
            let copy = reader.copy();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                backend.write(flow, &params, copy, &header).await
            });
            handles.push((name, handle));
        }

        let mut picked = Picked::default();
        let mut failed = Vec::new();
        for (name, handle) in handles {
            let payload = || String::from_utf8_lossy(&reader.to_bytes()).into_owned();
            match self.join_fanout(flow, &name, handle, payload).await {
                Ok(resp) => {
                    debug!("flow {} cluster {} key [{}] backend {} write code {}", flow, self.name, key, name, resp.code);
                    picked.push(resp);
                }
                Err(e) => {
                    error!("flow {} cluster {} key [{}] backend {} write failed: {}", flow, self.name, key, name, e);
                    failed.push(format!("{}: {}", name, e));
                }
            }
        }
        if !failed.is_empty() {
            return Err(ClusterError::WriteFailed(failed.join("; ")));
        }
        picked.finish().ok_or(ClusterError::MissingBackend)
    }

    /// 建库广播到全部后端
    pub async fn create_database(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        let result = self.create_database_inner(flow, params, header).await;
        self.request_metric("create_database", &result, &params.db);
        result
    }

    async fn create_database_inner(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        let backends = self.backends();
        if backends.is_empty() {
            return Err(ClusterError::MissingBackend);
        }

        let mut handles = Vec::with_capacity(backends.len());
        for backend in backends {
            let permit = self
                .fanout
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ClusterError::CreateDbFailed(e.to_string()))?;
            let name = backend.name().to_string();
            let params = params.clone();
            let header = header.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                backend.create_database(flow, &params, &header).await
            });
            handles.push((name, handle));
        }

        let mut picked = Picked::default();
        let mut failed = Vec::new();
        for (name, handle) in handles {
            match self.join_fanout(flow, &name, handle, || params.sql.clone()).await {
                Ok(resp) => picked.push(resp),
                Err(e) => {
                    error!("flow {} cluster {} backend {} create database failed: {}", flow, self.name, name, e);
                    failed.push(format!("{}: {}", name, e));
                }
            }
        }
        if !failed.is_empty() {
            return Err(ClusterError::CreateDbFailed(failed.join("; ")));
        }
        picked.finish().ok_or(ClusterError::MissingBackend)
    }

    /// 等待扇出任务,panic 被记录并视为该后端失败
    async fn join_fanout<T>(
        &self,
        flow: FlowId,
        backend: &str,
        handle: JoinHandle<BackendResult<T>>,
        payload: impl FnOnce() -> String,
    ) -> Result<T, String> {
        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(
                    "flow {} cluster {} backend {} panic: {}, payload: {}, backtrace: {}",
                    flow,
                    self.name,
                    backend,
                    message,
                    payload(),
                    Backtrace::force_capture()
                );
                self.metrics
                    .counter_inc(BACKEND_PANIC, &[("cluster", self.name.as_str()), ("backend", backend)]);
                Err(format!("panic: {}", message))
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// # Brief
    /// 查询
    ///
    /// 配置了标签时从 WHERE 条件中提取路由键,否则在全部后端间轮询
    pub async fn query(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        let result = self.query_inner(flow, params, header).await;
        self.request_metric("query", &result, &params.db);
        result
    }

    async fn query_inner(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        let (key, backends) = if params.tag_names.is_empty() {
            (tags_key_prefix(&params.db, &params.measurement), self.backends())
        } else {
            let tags = select_tags(&params.tag_names, &params.sql)
                .map_err(|e| ClusterError::GetTagValueFailed(e.to_string()))?;
            let key = tags_key(&params.db, &params.measurement, &params.tag_names, &tags);
            let backends = self.tags.get_read_backends(&key).await?;
            (key, backends)
        };
        debug!("flow {} cluster {} query key [{}]", flow, self.name, key);
        self.query_in_backends(flow, &key, &backends, move |backend| async move {
            backend.query(flow, params, header).await
        })
        .await
    }

    /// # Brief
    /// 元信息查询,跨全部路由键查询后合并
    pub async fn query_info(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        let result = self.query_info_inner(flow, params, header).await;
        self.request_metric("query_info", &result, &params.db);
        result
    }

    async fn query_info_inner(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> ClusterResult<Response> {
        if params.tag_names.is_empty() {
            let key = tags_key_prefix(&params.db, &params.measurement);
            return self
                .query_in_backends(flow, &key, &self.backends(), move |backend| async move {
                    backend.query(flow, params, header).await
                })
                .await;
        }

        let keys = self.tags.get_read_keys(&tags_key_prefix(&params.db, &params.measurement));
        debug!("flow {} cluster {} query info across {} keys", flow, self.name, keys.len());
        let mut responses = Vec::with_capacity(keys.len());
        for key in keys {
            let backends = self.tags.get_read_backends(&key).await?;
            let resp = self
                .query_in_backends(flow, &key, &backends, move |backend| async move {
                    backend.query(flow, params, header).await
                })
                .await?;
            responses.push(resp);
        }
        merge_series_values(responses)
    }

    /// # Brief
    /// 列式查询透传
    ///
    /// 路由键由 `db`、`measurement` 请求头与 `dimensions` 头中的标签生成
    pub async fn raw_query(&self, flow: FlowId, request: RawQuery, tag_names: &[String]) -> ClusterResult<RawResponse> {
        let db = request.headers.get(HEADER_DB).unwrap_or_default().to_string();
        let result = self.raw_query_inner(flow, request, tag_names).await;
        let status = match &result {
            Ok(resp) => resp.status.to_string(),
            Err(_) => "error".to_string(),
        };
        self.metrics.counter_inc(
            CLUSTER_REQUEST,
            &[("cluster", self.name.as_str()), ("action", "raw_query"), ("status", status.as_str()), ("db", db.as_str())],
        );
        result
    }

    async fn raw_query_inner(&self, flow: FlowId, request: RawQuery, tag_names: &[String]) -> ClusterResult<RawResponse> {
        let db = request.headers.get(HEADER_DB).unwrap_or_default();
        let measurement = request.headers.get(HEADER_MEASUREMENT).unwrap_or_default();
        let (key, backends) = if tag_names.is_empty() {
            (tags_key_prefix(db, measurement), self.backends())
        } else {
            let dimensions = request
                .headers
                .get(HEADER_DIMENSIONS)
                .ok_or_else(|| ClusterError::GetTagValueFailed("missing dimensions header".to_string()))?;
            let tags = dimension_tags(tag_names, dimensions)?;
            let key = tags_key(db, measurement, tag_names, &tags);
            let backends = self.tags.get_read_backends(&key).await?;
            (key, backends)
        };
        let request = &request;
        self.query_in_backends(flow, &key, &backends, move |backend| async move {
            backend.raw_query(flow, request.clone()).await
        })
        .await
    }

    /// # Brief
    /// 轮询加故障转移
    ///
    /// 从键计数器位置开始线性探测,跳过不可读的后端;
    /// 网络与读响应体错误换下一个后端,其他错误直接返回
    async fn query_in_backends<T, F, Fut>(
        &self,
        flow: FlowId,
        key: &str,
        backends: &[Arc<dyn Backend>],
        call: F,
    ) -> ClusterResult<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let total = backends.len() as u64;
        if total == 0 {
            return Err(ClusterError::NoAvailableBackend(self.name.clone()));
        }
        let start = self.balance.get_count(key);
        let unreadable = self.members.read().unreadable.clone();

        for offset in 0..total {
            let backend = &backends[((start + offset) % total) as usize];
            if unreadable.contains(backend.name()) || !backend.readable() {
                debug!("flow {} cluster {} skip unreadable backend {}", flow, self.name, backend.name());
                continue;
            }
            match call(backend.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_network() || e.is_read_body() => {
                    warn!("flow {} cluster {} backend {} query failed, try next: {}", flow, self.name, backend.name(), e);
                }
                Err(e) => {
                    error!("flow {} cluster {} backend {} query failed: {}", flow, self.name, backend.name(), e);
                    return Err(ClusterError::QueryFailed(format!("{}: {}", backend.name(), e)));
                }
            }
        }
        Err(ClusterError::NoAvailableBackend(self.name.clone()))
    }

    /// 替换集群成员并重建路由
    pub fn reset(&self, backends: Vec<Arc<dyn Backend>>, unreadable: &[String]) {
        self.tags.reset(&backends);
        *self.members.write() = Members {
            backends,
            unreadable: unreadable.iter().cloned().collect(),
        };
        info!("cluster reset: {}", self);
    }

    /// 随机一个后端的版本,没有后端时为空
    pub fn influx_version(&self) -> String {
        self.members
            .read()
            .backends
            .choose(&mut rand::thread_rng())
            .map(|b| b.version())
            .unwrap_or_default()
    }

    /// 停止路由表监听
    pub fn close(&self) {
        self.tags.close();
    }

    fn request_metric(&self, action: &str, result: &ClusterResult<Response>, db: &str) {
        let status = match result {
            Ok(resp) => resp.code.to_string(),
            Err(_) => "error".to_string(),
        };
        self.metrics.counter_inc(
            CLUSTER_REQUEST,
            &[("cluster", self.name.as_str()), ("action", action), ("status", status.as_str()), ("db", db)],
        );
    }
}

impl fmt::Display for RouteCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members.read();
        let names: Vec<&str> = members.backends.iter().map(|b| b.name()).collect();
        let mut unreadable: Vec<&String> = members.unreadable.iter().collect();
        unreadable.sort();
        write!(
            f,
            "influxdb_cluster:[{}],backend_list:{:?},unreadable_host:{:?},tags:{}",
            self.name,
            names,
            unreadable,
            self.tags.len()
        )
    }
}

/// 多个后端应答的取舍: 状态码 >= 300 的优先,否则取最后一个
#[derive(Default)]
struct Picked {
    stacked: Option<Response>,
    last: Option<Response>,
}

impl Picked {
    fn push(&mut self, resp: Response) {
        if resp.code >= 300 && self.stacked.is_none() {
            self.stacked = Some(resp.clone());
        }
        self.last = Some(resp);
    }

    fn finish(self) -> Option<Response> {
        self.stacked.or(self.last)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{StaticDiscovery, TagInfo, Topology};
    use crate::testutil::{CountingDiscovery, MockBackend, Reply};
    use fluxproxy_backend::{HostInfo, InfluxBackend, MemoryBackupFactory, ScriptedTransport, TransportError};
    use fluxproxy_backend::{BackendDeps, HttpResponse};
    use fluxproxy_common::{BackendSettings, MemoryMetrics};

    struct Fixture {
        cluster: RouteCluster,
        mocks: Vec<Arc<MockBackend>>,
        discovery: Arc<CountingDiscovery>,
        metrics: Arc<MemoryMetrics>,
    }

    /// `tags` 为 (路由键, 后端名)
    async fn fixture(names: &[&str], unreadable: &[&str], tags: &[(&str, &str)]) -> Fixture {
        let mocks: Vec<Arc<MockBackend>> = names.iter().map(|n| MockBackend::new(n)).collect();
        let backends: Vec<Arc<dyn Backend>> = mocks.iter().map(|m| m.clone() as Arc<dyn Backend>).collect();
        let mut topology = Topology::default();
        topology.tags.insert(
            "c1".into(),
            tags.iter().map(|(k, host)| (k.to_string(), TagInfo::new(&[*host]))).collect(),
        );
        let discovery = CountingDiscovery::new(StaticDiscovery::new(topology));
        let metrics = MemoryMetrics::new();
        let unreadable: Vec<String> = unreadable.iter().map(|s| s.to_string()).collect();
        let cluster = RouteCluster::new(
            "c1",
            backends,
            &unreadable,
            discovery.clone(),
            &ClusterSettings::default(),
            metrics.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        Fixture {
            cluster,
            mocks,
            discovery,
            metrics,
        }
    }

    fn tag_names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const LINES: &[u8] = b"cpu,host=a value=1 0\ncpu,host=b value=2 0\ncpu,host=a value=3 0\n";

    #[tokio::test]
    async fn test_write_replicates_without_tags() {
        let f = fixture(&["b1", "b2"], &[], &[]).await;
        let resp = f
            .cluster
            .write(1, &WriteParams::new("db"), Bytes::from_static(LINES), &[], &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 204);
        for mock in &f.mocks {
            assert_eq!(mock.written(), vec![Bytes::from_static(LINES)]);
        }
        assert_eq!(
            f.metrics.counter(CLUSTER_REQUEST, &[("cluster", "c1"), ("action", "write"), ("status", "204"), ("db", "db")]),
            1
        );
    }

    #[tokio::test]
    async fn test_write_hard_failure_is_all_or_nothing() {
        let f = fixture(&["b1", "b2"], &[], &[]).await;
        f.mocks[0].set_write(Reply::Fail);
        let err = f
            .cluster
            .write(1, &WriteParams::new("db"), Bytes::from_static(LINES), &[], &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WriteFailed(_)));
        assert_eq!(f.mocks[1].written().len(), 1);
    }

    #[tokio::test]
    async fn test_write_prefers_error_response() {
        let f = fixture(&["b1", "b2", "b3"], &[], &[]).await;
        f.mocks[1].set_write(Reply::Ok(Response::new(r#"{"error":"database not found"}"#, 404)));
        let resp = f
            .cluster
            .write(1, &WriteParams::new("db"), Bytes::from_static(LINES), &[], &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 404);
    }

    #[tokio::test]
    async fn test_write_panic_counted_as_failure() {
        let f = fixture(&["b1", "b2"], &[], &[]).await;
        f.mocks[0].set_write(Reply::Panic);
        let err = f
            .cluster
            .write(1, &WriteParams::new("db"), Bytes::from_static(LINES), &[], &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WriteFailed(ref msg) if msg.contains("panic")));
        assert_eq!(f.mocks[1].written().len(), 1);
        assert_eq!(f.metrics.counter(BACKEND_PANIC, &[("cluster", "c1"), ("backend", "b1")]), 1);
    }

    #[tokio::test]
    async fn test_write_groups_by_tags() {
        let f = fixture(
            &["b1", "b2"],
            &[],
            &[("db/cpu/host==a", "b1"), ("db/cpu/host==b", "b2")],
        )
        .await;
        f.cluster
            .write(1, &WriteParams::new("db"), Bytes::from_static(LINES), &tag_names(&["host"]), &Headers::new())
            .await
            .unwrap();
        assert_eq!(
            f.mocks[0].written(),
            vec![Bytes::from_static(b"cpu,host=a value=1 0\ncpu,host=a value=3 0\n")]
        );
        assert_eq!(f.mocks[1].written(), vec![Bytes::from_static(b"cpu,host=b value=2 0\n")]);
    }

    #[tokio::test]
    async fn test_unmapped_key_refreshes_once() {
        let f = fixture(&["b1"], &[], &[("db/cpu/host==a", "b1")]).await;
        let before = f.discovery.tag_calls();
        let err = f
            .cluster
            .write(
                1,
                &WriteParams::new("db"),
                Bytes::from_static(b"cpu,host=z value=1 0\n"),
                &tag_names(&["host"]),
                &Headers::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MatchBackendByTag(_)));
        assert_eq!(f.discovery.tag_calls() - before, 1);
    }

    #[tokio::test]
    async fn test_query_round_robin_and_failover() {
        let f = fixture(&["b1", "b2", "b3"], &["b3"], &[]).await;
        let params = QueryParams::new("db", "select * from cpu");

        let first = f.cluster.query(1, &params, &Headers::new()).await.unwrap();
        let second = f.cluster.query(2, &params, &Headers::new()).await.unwrap();
        assert_eq!(first.result, "from b1");
        assert_eq!(second.result, "from b2");

        // b3 不可读被跳过,回到 b1
        let third = f.cluster.query(3, &params, &Headers::new()).await.unwrap();
        assert_eq!(third.result, "from b1");

        f.mocks[0].set_query(Reply::Network);
        f.mocks[1].readable.store(false, std::sync::atomic::Ordering::SeqCst);
        let err = f.cluster.query(4, &params, &Headers::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoAvailableBackend(ref name) if name == "c1"));
        assert_eq!(f.mocks[2].query_count(), 0);
    }

    #[tokio::test]
    async fn test_query_other_error_not_retried() {
        let f = fixture(&["b1", "b2"], &[], &[]).await;
        f.mocks[0].set_query(Reply::Fail);
        let err = f
            .cluster
            .query(1, &QueryParams::new("db", "select 1"), &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::QueryFailed(_)));
        assert_eq!(f.mocks[1].query_count(), 0);
    }

    #[tokio::test]
    async fn test_query_routes_by_where_clause() {
        let f = fixture(&["b1", "b2"], &[], &[("db/cpu/host==b", "b2")]).await;
        let mut params = QueryParams::new("db", "select * from cpu where host = 'b' and time > now() - 1h");
        params.measurement = "cpu".into();
        params.tag_names = tag_names(&["host"]);
        let resp = f.cluster.query(1, &params, &Headers::new()).await.unwrap();
        assert_eq!(resp.result, "from b2");

        params.sql = "select * from cpu where (host = 'b'".into();
        let err = f.cluster.query(2, &params, &Headers::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::GetTagValueFailed(_)));
    }

    #[tokio::test]
    async fn test_query_info_merges_keys() {
        let f = fixture(
            &["b1", "b2"],
            &[],
            &[("db/cpu/host==a", "b1"), ("db/cpu/host==b", "b2")],
        )
        .await;
        let body = |v: &str| {
            Reply::Ok(Response::new(
                format!(r#"{{"results":[{{"statement_id":0,"series":[{{"name":"cpu","values":[["host","{}"],["host","x"]]}}]}}]}}"#, v),
                200,
            ))
        };
        f.mocks[0].set_query(body("a"));
        f.mocks[1].set_query(body("b"));

        let mut params = QueryParams::new("db", "show tag values from cpu with key = host");
        params.measurement = "cpu".into();
        params.tag_names = tag_names(&["host"]);
        let resp = f.cluster.query_info(1, &params, &Headers::new()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&resp.result).unwrap();
        assert_eq!(
            doc["results"][0]["series"][0]["values"],
            serde_json::json!([["host", "a"], ["host", "x"], ["host", "b"]])
        );
    }

    #[tokio::test]
    async fn test_raw_query_routes_by_dimensions() {
        let f = fixture(&["b1", "b2"], &[], &[("db/cpu/host==b", "b2")]).await;
        let mut request = RawQuery::default();
        request.headers.insert(HEADER_DB, "db");
        request.headers.insert(HEADER_MEASUREMENT, "cpu");
        request.headers.insert(HEADER_DIMENSIONS, r#"{"host":"b"}"#);
        let resp = f.cluster.raw_query(1, request.clone(), &tag_names(&["host"])).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"from b2"));

        let mut missing = request;
        missing.headers = Headers::new();
        assert!(matches!(
            f.cluster.raw_query(2, missing, &tag_names(&["host"])).await,
            Err(ClusterError::GetTagValueFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_create_database_fans_out() {
        let f = fixture(&["b1", "b2"], &[], &[("db/cpu/host==a", "b1")]).await;
        let resp = f
            .cluster
            .create_database(1, &QueryParams::new("", "create database db"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 204);

        f.mocks[1].set_write(Reply::Network);
        let err = f
            .cluster
            .create_database(2, &QueryParams::new("", "create database db"), &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::CreateDbFailed(_)));

        let empty = fixture(&[], &[], &[]).await;
        assert!(matches!(
            empty.cluster.create_database(3, &QueryParams::new("", "create database db"), &Headers::new()).await,
            Err(ClusterError::MissingBackend)
        ));
        assert_eq!(empty.cluster.influx_version(), "");
    }

    #[tokio::test]
    async fn test_reset_and_display() {
        let f = fixture(&["b1", "b2"], &[], &[]).await;
        assert!(f.cluster.influx_version().starts_with("1.8-"));
        f.cluster.reset(vec![f.mocks[1].clone() as Arc<dyn Backend>], &["b2".to_string()]);
        assert_eq!(
            f.cluster.to_string(),
            r#"influxdb_cluster:[c1],backend_list:["b2"],unreadable_host:["b2"],tags:0"#
        );
        let err = f
            .cluster
            .query(1, &QueryParams::new("db", "select 1"), &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoAvailableBackend(_)));
    }

    async fn influx_backend(name: &str, transport: Arc<ScriptedTransport>, backups: Arc<MemoryBackupFactory>) -> Arc<dyn Backend> {
        let deps = BackendDeps {
            settings: BackendSettings {
                ping_interval_ms: 3_600_000,
                ..Default::default()
            },
            transport,
            backup_factory: backups,
            metrics: MemoryMetrics::new(),
        };
        Arc::new(
            InfluxBackend::start(name, HostInfo::new("127.0.0.1", 8086), deps, &CancellationToken::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unreachable_backend_backed_up_while_peer_succeeds() {
        let t1 = ScriptedTransport::healthy();
        let t2 = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let b1 = influx_backend("b1", t1.clone(), backups.clone()).await;
        let b2 = influx_backend("b2", t2.clone(), backups.clone()).await;

        let cluster = RouteCluster::new(
            "c1",
            vec![b1, b2],
            &[],
            Arc::new(StaticDiscovery::new(Topology::default())),
            &ClusterSettings::default(),
            MemoryMetrics::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let line = Bytes::from_static(b"cpu,host=a value=1 0\n");
        let resp = cluster
            .write(1, &WriteParams::new("db"), line.clone(), &[], &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 204);
        assert_eq!(t1.requests_to("/write")[0].body.as_ref(), Some(&line));
        assert_eq!(t2.requests_to("/write")[0].body.as_ref(), Some(&line));

        t1.set_handler(|req| {
            if req.url.ends_with("/write") {
                Err(TransportError::Network("connection refused".into()))
            } else {
                Ok(HttpResponse::new(204, Bytes::new()))
            }
        });
        let resp = cluster
            .write(2, &WriteParams::new("db"), line.clone(), &[], &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 204);
        assert_eq!(backups.store("b1").len(), 1);
        assert!(backups.store("b2").is_empty());
        assert_eq!(t2.requests_to("/write").len(), 2);
    }
}

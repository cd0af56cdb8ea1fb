//! InfluxDB 后端
//!
//! 管理单个 InfluxDB 实例的连接参数、健康状态、写入缓冲以及备份回放。
//!
//! # 写入路径
//!
//! - 不可直写时: 序列化进入备份队列,返回合成的 204
//! - 网络错误: 重置读取位置后进入备份
//! - 5xx 且开启 force_backup: 进入备份
//! - 其余响应原样返回
//!
//! 缓冲模式下写入请求直接进入事件循环,由刷新工作协程按同样的决策写出。

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use fluxproxy_common::metrics::{BACKEND_ALIVE, BACKEND_BACKUP_OFFSET, BACKEND_REQUEST};
use fluxproxy_common::{
    BackendSettings, CopyReader, FlowId, Headers, MetricsSink, PointsReader, QueryParams,
    RawQuery, RawResponse, Response, WriteParams,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendDeps, HostInfo};
use crate::backup::{BackupData, BackupFactory, BackupStore, EmptyBackupFactory};
use crate::buffer::BufferData;
use crate::limiter::RateLimiter;
use crate::status::Status;
use crate::transport::{HttpRequest, Method, Transport, TransportError};
use crate::{BackendError, BackendResult};

/// 写入成功(含进入缓冲、进入备份)的合成状态码
pub const WRITE_SUCCESS_CODE: u16 = 204;
/// 建库成功(含进入备份)的合成响应
pub const CREATE_DB_SUCCESS: &str = r#"{"results":[{"statement_id":0}]}"#;
pub const CREATE_DB_SUCCESS_CODE: u16 = 200;

const VERSION_HEADER: &str = "X-Influxdb-Version";

pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) host: RwLock<HostInfo>,
    pub(crate) status: RwLock<Status>,
    pub(crate) version: RwLock<String>,
    pub(crate) limiter: RateLimiter,
    pub(crate) backup_count: AtomicU64,
    pub(crate) settings: BackendSettings,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) backup: RwLock<Arc<dyn BackupStore>>,
    pub(crate) backup_factory: Arc<dyn BackupFactory>,
    /// 正在进行的回放: (序号, 取消令牌)
    pub(crate) recovery: Mutex<Option<(u64, CancellationToken)>>,
    pub(crate) recovery_seq: AtomicU64,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// InfluxDB 后端
pub struct InfluxBackend {
    inner: Arc<Inner>,
    buffer_tx: Option<mpsc::Sender<BufferData>>,
}

impl InfluxBackend {
    /// # Brief
    /// 创建后端并启动后台任务
    ///
    /// 先连接备份队列并完成一次健康检查,再启动定时检查与缓冲流水线。
    ///
    /// # Arguments
    /// * `name` - 后端名
    /// * `host` - 主机信息
    /// * `deps` - 传输层、备份队列、指标等依赖
    /// * `parent` - 上级取消令牌,后端持有其子令牌
    pub async fn start(
        name: &str,
        host: HostInfo,
        deps: BackendDeps,
        parent: &CancellationToken,
    ) -> BackendResult<Self> {
        // 关闭备份队列时以空队列代替
        let backup_factory: Arc<dyn BackupFactory> = if deps.settings.ignore_kafka {
            Arc::new(EmptyBackupFactory)
        } else {
            deps.backup_factory
        };
        let backup = backup_factory.create(name).await?;
        let limiter = RateLimiter::new(host.backup_rate_limit);

        let inner = Arc::new(Inner {
            name: name.to_string(),
            host: RwLock::new(host),
            status: RwLock::new(Status::initial()),
            version: RwLock::new(String::new()),
            limiter,
            backup_count: AtomicU64::new(0),
            settings: deps.settings,
            transport: deps.transport,
            backup: RwLock::new(backup),
            backup_factory,
            recovery: Mutex::new(None),
            recovery_seq: AtomicU64::new(0),
            cancel: parent.child_token(),
            metrics: deps.metrics,
            tasks: Mutex::new(Vec::new()),
        });

        inner.report_offset().await;
        inner.check_health().await;

        let health = tokio::spawn(inner.clone().run_health_loop());
        inner.tasks.lock().push(health);

        let buffer_tx = if inner.settings.buffer_enabled() {
            let (tx, rx) = mpsc::channel(inner.settings.write_channel_size.max(1));
            let handles = inner.spawn_buffer_pipeline(rx);
            inner.tasks.lock().extend(handles);
            Some(tx)
        } else {
            None
        };

        info!("backend started: {}", inner);
        Ok(Self { inner, buffer_tx })
    }

    /// 立即执行一次健康检查
    pub async fn check_health(&self) {
        self.inner.check_health().await;
    }

    /// 已启动过的回放次数
    pub fn backup_count(&self) -> u64 {
        self.inner.backup_count.load(Ordering::Relaxed)
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovery.lock().is_some()
    }
}

impl Inner {
    pub(crate) fn address(&self) -> String {
        self.host.read().address()
    }

    /// 白名单过滤后的请求头,并注入认证
    fn request_headers(&self, header: &Headers) -> Headers {
        let mut out = header.filtered(&self.settings.header_whitelist);
        let host = self.host.read();
        if !host.username.is_empty() {
            let token = STANDARD.encode(format!("{}:{}", host.username, host.password));
            out.insert("Authorization", format!("Basic {}", token));
        }
        out
    }

    pub(crate) fn backup_store(&self) -> Arc<dyn BackupStore> {
        self.backup.read().clone()
    }

    pub(crate) fn set_status(&self, write: bool, inner_write: bool, read: bool) {
        let changed = {
            let mut status = self.status.write();
            let before = (status.write, status.inner_write, status.read, status.checked);
            status.set(write, inner_write, read);
            before != (write, inner_write, read, true)
        };
        if changed {
            info!("backend {} status changed to {}", self.name, self.status.read());
        }
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let name = self.name.as_str();
        self.metrics.gauge_set(BACKEND_ALIVE, &[("backend", name), ("kind", "write")], flag(write));
        self.metrics.gauge_set(BACKEND_ALIVE, &[("backend", name), ("kind", "inner_write")], flag(inner_write));
        self.metrics.gauge_set(BACKEND_ALIVE, &[("backend", name), ("kind", "read")], flag(read));
    }

    pub(crate) fn invalid_count_inc(&self) -> u32 {
        let mut status = self.status.write();
        status.invalid_count += 1;
        status.invalid_count
    }

    pub(crate) fn reset_invalid_count(&self) {
        self.status.write().invalid_count = 0;
    }

    fn set_read_unhealthy(&self) {
        let (write, inner_write) = {
            let status = self.status.read();
            (status.write, status.inner_write)
        };
        self.set_status(write, inner_write, false);
    }

    pub(crate) fn request_metric(&self, action: &str, status: &str, db: &str) {
        self.metrics.counter_inc(
            BACKEND_REQUEST,
            &[("backend", self.name.as_str()), ("action", action), ("status", status), ("db", db)],
        );
    }

    pub(crate) async fn report_offset(&self) {
        match self.backup_store().offset_size().await {
            Ok(size) => self.metrics.gauge_set(BACKEND_BACKUP_OFFSET, &[("backend", self.name.as_str())], size as f64),
            Err(e) => warn!("backend {} get backup offset failed: {}", self.name, e),
        }
    }

    fn should_backup(&self, code: u16) -> bool {
        self.settings.force_backup && (500..600).contains(&code)
    }

    /// 备份失败时整体停止直写与读取,直到队列恢复
    fn mark_backup_unavailable(&self) {
        self.invalid_count_inc();
        self.set_status(true, false, false);
        self.cancel_recovery();
    }

    /// # Brief
    /// 序列化并推入备份队列
    ///
    /// 限速为负时直接丢弃数据。
    pub(crate) async fn backup_data(
        &self,
        flow: FlowId,
        params: WriteParams,
        query: Bytes,
        header: &Headers,
    ) -> BackendResult<()> {
        let db = params.db.clone();
        if self.limiter.backup_disabled() {
            warn!("flow:{} backend:{} backup disabled, {} bytes dropped", flow, self.name, query.len());
            self.request_metric("backup", "dropped", &db);
            return Ok(());
        }

        let encoded = BackupData::new(flow, params, query, header.clone()).encode()?;
        let store = self.backup_store();
        match store.push(encoded).await {
            Ok(()) => {
                self.request_metric("backup", "success", &db);
                Ok(())
            }
            Err(e) => {
                error!("flow:{} backend:{} push to {} failed: {}", flow, self.name, store.topic(), e);
                self.request_metric("backup", "failed", &db);
                self.mark_backup_unavailable();
                Err(e)
            }
        }
    }

    async fn write_backup<R: CopyReader + ?Sized>(
        &self,
        flow: FlowId,
        params: &WriteParams,
        reader: &mut R,
        header: &Headers,
    ) -> BackendResult<()> {
        reader.seek_zero();
        let data = reader.read_remaining()?;
        self.backup_data(flow, params.clone(), data, header)
            .await
            .map_err(|e| BackendError::WriteBackup(e.to_string()))
    }

    /// # Brief
    /// 同步写入路径,缓冲刷新与备份回放共用
    ///
    /// # Arguments
    /// * `action` - 指标中的动作名: write/flush/recover
    pub(crate) async fn write_direct<R: CopyReader + ?Sized>(
        &self,
        flow: FlowId,
        params: &WriteParams,
        reader: &mut R,
        header: &Headers,
        action: &str,
    ) -> BackendResult<Response> {
        let db = params.db.as_str();
        if !self.status.read().inner_write {
            debug!("flow:{} backend:{} not writable, write to backup", flow, self.name);
            self.write_backup(flow, params, reader, header).await?;
            self.request_metric(action, "backup", db);
            return Ok(Response::new("", WRITE_SUCCESS_CODE));
        }

        let body = reader.read_remaining()?;
        let request = HttpRequest::new(Method::Post, format!("{}/write", self.address()))
            .param("db", &params.db)
            .param("consistency", &params.consistency)
            .param("precision", &params.precision)
            .param("rp", &params.rp)
            .headers(self.request_headers(header))
            .body(body);

        match self.transport.send(request, self.settings.timeout()).await {
            Err(TransportError::Network(e)) => {
                warn!("flow:{} backend:{} write network error: {}, backup data", flow, self.name, e);
                self.request_metric(action, "network_error", db);
                self.write_backup(flow, params, reader, header).await?;
                Ok(Response::new("", WRITE_SUCCESS_CODE))
            }
            Err(TransportError::Body(e)) => {
                self.request_metric(action, "read_body_error", db);
                Err(BackendError::ReadBody(e))
            }
            Err(TransportError::Request(e)) => {
                self.request_metric(action, "failed", db);
                Err(BackendError::DoWrite(e))
            }
            Ok(resp) if self.should_backup(resp.status) => {
                warn!("flow:{} backend:{} write got status {}, backup data", flow, self.name, resp.status);
                self.request_metric(action, "server_error", db);
                self.write_backup(flow, params, reader, header).await?;
                Ok(Response::new("", WRITE_SUCCESS_CODE))
            }
            Ok(resp) => {
                let body = String::from_utf8_lossy(&resp.body).into_owned();
                if resp.status >= 300 {
                    warn!("flow:{} backend:{} write got status {}: {}", flow, self.name, resp.status, body);
                    self.request_metric(action, "failed", db);
                } else {
                    self.request_metric(action, "success", db);
                }
                Ok(Response::new(body, resp.status))
            }
        }
    }

    fn query_request(&self, params: &QueryParams, header: &Headers) -> HttpRequest {
        HttpRequest::new(Method::Post, format!("{}/query", self.address()))
            .param("q", &params.sql)
            .param("db", &params.db)
            .param("epoch", &params.epoch)
            .param("pretty", &params.pretty)
            .param("chunked", &params.chunked)
            .param("chunk_size", &params.chunk_size)
            .headers(self.request_headers(header))
    }

    pub(crate) async fn query(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> BackendResult<Response> {
        let db = params.db.as_str();
        let request = self.query_request(params, header);
        match self.transport.send(request, self.settings.timeout()).await {
            Ok(resp) => {
                let status = if resp.status >= 300 { "failed" } else { "success" };
                self.request_metric("query", status, db);
                Ok(Response::new(String::from_utf8_lossy(&resp.body), resp.status))
            }
            Err(TransportError::Network(e)) => {
                warn!("flow:{} backend:{} query network error: {}", flow, self.name, e);
                self.invalid_count_inc();
                self.set_read_unhealthy();
                self.request_metric("query", "network_error", db);
                Err(BackendError::Network(e))
            }
            Err(TransportError::Body(e)) => {
                self.request_metric("query", "read_body_error", db);
                Err(BackendError::ReadBody(e))
            }
            Err(TransportError::Request(e)) => {
                self.request_metric("query", "failed", db);
                Err(BackendError::DoQuery(e))
            }
        }
    }

    /// 建库语句,不可写或网络错误时进入备份,回放时重新执行
    pub(crate) async fn create_database(
        &self,
        flow: FlowId,
        params: &QueryParams,
        header: &Headers,
    ) -> BackendResult<Response> {
        let sql = Bytes::from(params.sql.clone());
        if !self.status.read().inner_write {
            self.backup_data(flow, WriteParams::default(), sql, header)
                .await
                .map_err(|e| BackendError::WriteBackup(e.to_string()))?;
            self.request_metric("create_db", "backup", "");
            return Ok(Response::new(CREATE_DB_SUCCESS, CREATE_DB_SUCCESS_CODE));
        }

        let request = self.query_request(params, header);
        match self.transport.send(request, self.settings.timeout()).await {
            Err(TransportError::Network(e)) => {
                warn!("flow:{} backend:{} create database network error: {}, backup sql", flow, self.name, e);
                self.backup_data(flow, WriteParams::default(), sql, header)
                    .await
                    .map_err(|e| BackendError::WriteBackup(e.to_string()))?;
                self.request_metric("create_db", "network_error", "");
                Ok(Response::new(CREATE_DB_SUCCESS, CREATE_DB_SUCCESS_CODE))
            }
            Err(TransportError::Body(e)) => Err(BackendError::ReadBody(e)),
            Err(TransportError::Request(e)) => Err(BackendError::DoQuery(e)),
            Ok(resp) if self.should_backup(resp.status) => {
                self.backup_data(flow, WriteParams::default(), sql, header)
                    .await
                    .map_err(|e| BackendError::WriteBackup(e.to_string()))?;
                self.request_metric("create_db", "server_error", "");
                Ok(Response::new(CREATE_DB_SUCCESS, CREATE_DB_SUCCESS_CODE))
            }
            Ok(resp) => {
                let status = if resp.status >= 300 { "failed" } else { "success" };
                self.request_metric("create_db", status, "");
                Ok(Response::new(String::from_utf8_lossy(&resp.body), resp.status))
            }
        }
    }

    pub(crate) async fn raw_query(&self, flow: FlowId, request: RawQuery) -> BackendResult<RawResponse> {
        let http = HttpRequest::new(Method::Post, format!("{}/api/v2/query", self.address()))
            .headers(self.request_headers(&request.headers))
            .body(request.body);
        match self.transport.send(http, self.settings.timeout()).await {
            Ok(resp) => {
                self.request_metric("raw_query", "success", "");
                Ok(RawResponse {
                    status: resp.status,
                    headers: resp.headers,
                    body: resp.body,
                })
            }
            Err(TransportError::Network(e)) => {
                warn!("flow:{} backend:{} raw query network error: {}", flow, self.name, e);
                self.invalid_count_inc();
                self.set_read_unhealthy();
                self.request_metric("raw_query", "network_error", "");
                Err(BackendError::Network(e))
            }
            Err(TransportError::Body(e)) => Err(BackendError::ReadBody(e)),
            Err(TransportError::Request(e)) => Err(BackendError::DoQuery(e)),
        }
    }

    pub(crate) async fn ping(&self, timeout: Duration) -> BackendResult<(Duration, String)> {
        let start = Instant::now();
        let wait = format!("{}s", self.settings.wait_for_leader_secs);
        let request = HttpRequest::new(Method::Get, format!("{}/ping", self.address()))
            .param("wait_for_leader", &wait)
            .headers(self.request_headers(&Headers::new()));
        let resp = self.transport.send(request, timeout).await.map_err(|e| match e {
            TransportError::Network(e) => BackendError::Network(e),
            TransportError::Body(e) => BackendError::ReadBody(e),
            TransportError::Request(e) => BackendError::DoQuery(e),
        })?;
        if resp.status != 204 {
            return Err(BackendError::Ping(resp.status));
        }
        let version = resp.headers.get(VERSION_HEADER).unwrap_or_default().to_string();
        Ok((start.elapsed(), version))
    }
}

impl fmt::Display for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.read();
        write!(
            f,
            "influxdb_backend[{}:{}:{}-{}]disabled[{}]backup_rate_limit[{}]",
            self.name,
            host.domain_name,
            host.port,
            host.address(),
            host.disabled,
            self.limiter.limit()
        )
    }
}

impl fmt::Display for InfluxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

#[async_trait]
impl Backend for InfluxBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn write(
        &self,
        flow: FlowId,
        params: &WriteParams,
        reader: PointsReader,
        header: &Headers,
    ) -> BackendResult<Response> {
        match &self.buffer_tx {
            Some(tx) => {
                if self.inner.cancel.is_cancelled() {
                    return Err(BackendError::Closed(self.inner.name.clone()));
                }
                let data = BufferData {
                    flow,
                    params: params.clone(),
                    header: header.clone(),
                    reader,
                };
                tx.send(data)
                    .await
                    .map_err(|_| BackendError::Closed(self.inner.name.clone()))?;
                self.inner.request_metric("write", "buffered", &params.db);
                Ok(Response::new("", WRITE_SUCCESS_CODE))
            }
            None => {
                let mut reader = reader;
                self.inner.write_direct(flow, params, &mut reader, header, "write").await
            }
        }
    }

    async fn query(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> BackendResult<Response> {
        self.inner.query(flow, params, header).await
    }

    async fn create_database(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> BackendResult<Response> {
        self.inner.create_database(flow, params, header).await
    }

    async fn raw_query(&self, flow: FlowId, request: RawQuery) -> BackendResult<RawResponse> {
        self.inner.raw_query(flow, request).await
    }

    async fn ping(&self, timeout: Duration) -> BackendResult<(Duration, String)> {
        self.inner.ping(timeout).await
    }

    fn readable(&self) -> bool {
        self.inner.status.read().read
    }

    fn disabled(&self) -> bool {
        self.inner.host.read().disabled
    }

    fn version(&self) -> String {
        self.inner.version.read().clone()
    }

    fn status(&self) -> Status {
        *self.inner.status.read()
    }

    fn reset(&self, host: &HostInfo) -> BackendResult<()> {
        info!("backend {} reset to {}", self.inner.name, host.address());
        self.inner.limiter.set_limit(host.backup_rate_limit);
        *self.inner.host.write() = host.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.check_health().await });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        if !self.inner.cancel.is_cancelled() {
            info!("backend {} closing", self.inner.name);
            self.inner.cancel.cancel();
        }
        Ok(())
    }

    async fn wait(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("backend {} task panicked: {}", self.inner.name, e);
                    }
                }
            }
        }
        self.inner.backup_store().close().await;
        debug!("backend {} all tasks exited", self.inner.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemoryBackupFactory;
    use crate::status::HealthState;
    use crate::testutil::deps;
    use crate::transport::{HttpResponse, ScriptedTransport};

    fn points(data: &'static [u8]) -> PointsReader {
        PointsReader::from_bytes(Bytes::from_static(data))
    }

    async fn start(transport: Arc<ScriptedTransport>, backups: Arc<MemoryBackupFactory>) -> InfluxBackend {
        let mut host = HostInfo::new("127.0.0.1", 8086);
        host.username = "admin".into();
        host.password = "secret".into();
        InfluxBackend::start("b1", host, deps(transport, backups), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_healthy() {
        let transport = ScriptedTransport::healthy();
        let backend = start(transport.clone(), MemoryBackupFactory::new()).await;
        assert_eq!(backend.status().state(), HealthState::Healthy);
        assert!(backend.readable());
        assert_eq!(backend.version(), "1.8.10");

        let ping = &transport.requests_to("/ping")[0];
        assert_eq!(ping.query_value("wait_for_leader"), Some("5s"));
        assert_eq!(ping.headers.get("authorization"), Some("Basic YWRtaW46c2VjcmV0"));
        backend.close().unwrap();
        backend.wait().await;
    }

    #[tokio::test]
    async fn test_write_pass_through() {
        let transport = ScriptedTransport::healthy();
        let backend = start(transport.clone(), MemoryBackupFactory::new()).await;

        let mut params = WriteParams::new("db1");
        params.precision = "s".into();
        let mut header = Headers::new();
        header.insert("Content-Type", "text/plain");
        header.insert("Cookie", "secret");

        let resp = backend.write(1, &params, points(b"cpu,host=a value=1 0\n"), &header).await.unwrap();
        assert_eq!(resp.code, 204);

        let writes = transport.requests_to("/write");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].query_value("db"), Some("db1"));
        assert_eq!(writes[0].query_value("precision"), Some("s"));
        assert_eq!(writes[0].body.as_deref(), Some(&b"cpu,host=a value=1 0\n"[..]));
        assert!(writes[0].headers.get("cookie").is_none());
        assert_eq!(writes[0].headers.get("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_write_application_error_not_backed_up() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        transport.set_handler(|req| {
            if req.url.ends_with("/write") {
                Ok(HttpResponse::new(404, r#"{"error":"database not found: \"db1\""}"#))
            } else {
                Ok(HttpResponse::new(204, Bytes::new()))
            }
        });

        let resp = backend
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 404);
        assert!(resp.result.contains("database not found"));
        assert!(backups.store("b1").is_empty());
    }

    #[tokio::test]
    async fn test_write_network_error_backs_up() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        transport.set_handler(|_| Err(TransportError::Network("connection refused".into())));

        let resp = backend
            .write(9, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, WRITE_SUCCESS_CODE);

        let store = backups.store("b1");
        assert_eq!(store.len(), 1);
        let envelope = BackupData::decode(&store.snapshot()[0]).unwrap();
        assert_eq!(envelope.flow_id, 9);
        assert_eq!(envelope.url_params.db, "db1");
        assert_eq!(&envelope.query[..], b"cpu value=1\n");
    }

    #[tokio::test]
    async fn test_ignore_kafka_uses_empty_backup() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let settings = BackendSettings {
            ignore_kafka: true,
            ..Default::default()
        };
        let backend = InfluxBackend::start(
            "b1",
            HostInfo::new("127.0.0.1", 8086),
            crate::testutil::deps_with(transport.clone(), backups.clone(), settings),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        transport.set_handler(|_| Err(TransportError::Network("connection refused".into())));

        let resp = backend
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, WRITE_SUCCESS_CODE);
        assert!(backups.store("b1").is_empty());
    }

    #[tokio::test]
    async fn test_write_server_error_respects_force_backup() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        transport.set_handler(|_| Ok(HttpResponse::new(503, "unavailable")));

        let resp = backend
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, WRITE_SUCCESS_CODE);
        assert_eq!(backups.store("b1").len(), 1);

        let mut strict_deps = deps(transport.clone(), backups.clone());
        strict_deps.settings.force_backup = false;
        transport.set_handler(|req| {
            if req.url.ends_with("/ping") {
                Ok(HttpResponse::new(204, Bytes::new()))
            } else {
                Ok(HttpResponse::new(503, "unavailable"))
            }
        });
        let strict = InfluxBackend::start("b2", HostInfo::new("127.0.0.2", 8086), strict_deps, &CancellationToken::new())
            .await
            .unwrap();
        let resp = strict
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, 503);
        assert!(backups.store("b2").is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_marks_unwritable() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        backups.store("b1").set_available(false);
        transport.set_handler(|_| Err(TransportError::Network("connection refused".into())));

        let err = backend
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::WriteBackup(_)));
        let status = backend.status();
        assert!(!status.inner_write);
        assert!(!status.read);
    }

    #[tokio::test]
    async fn test_backup_disabled_drops() {
        let transport = ScriptedTransport::healthy();
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        let mut host = HostInfo::new("127.0.0.1", 8086);
        host.backup_rate_limit = -1.0;
        backend.reset(&host).unwrap();
        transport.set_handler(|_| Err(TransportError::Network("connection refused".into())));

        let resp = backend
            .write(1, &WriteParams::new("db1"), points(b"cpu value=1\n"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.code, WRITE_SUCCESS_CODE);
        assert!(backups.store("b1").is_empty());
        assert!(backend.to_string().contains("backup_rate_limit[-1]"));
    }

    #[tokio::test]
    async fn test_query_network_error_marks_unreadable() {
        let transport = ScriptedTransport::healthy();
        let backend = start(transport.clone(), MemoryBackupFactory::new()).await;
        transport.set_handler(|_| Err(TransportError::Network("timeout".into())));

        let err = backend
            .query(1, &QueryParams::new("db1", "select * from cpu"), &Headers::new())
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert!(!backend.readable());
        assert!(backend.status().inner_write);
    }

    #[tokio::test]
    async fn test_query_params() {
        let transport = ScriptedTransport::healthy();
        let backend = start(transport.clone(), MemoryBackupFactory::new()).await;
        let mut params = QueryParams::new("db1", "select * from cpu");
        params.epoch = "ms".into();
        params.chunked = "true".into();

        let resp = backend.query(1, &params, &Headers::new()).await.unwrap();
        assert_eq!(resp.code, 200);
        let query = &transport.requests_to("/query")[0];
        assert_eq!(query.query_value("q"), Some("select * from cpu"));
        assert_eq!(query.query_value("epoch"), Some("ms"));
        assert_eq!(query.query_value("chunked"), Some("true"));
        assert_eq!(query.query_value("pretty"), None);
    }

    #[tokio::test]
    async fn test_create_database_backup_when_unwritable() {
        let transport = ScriptedTransport::new(|_| Err(TransportError::Network("refused".into())));
        let backups = MemoryBackupFactory::new();
        let backend = start(transport.clone(), backups.clone()).await;
        assert_eq!(backend.status().state(), HealthState::Unhealthy);

        let resp = backend
            .create_database(1, &QueryParams::new("", "CREATE DATABASE db1"), &Headers::new())
            .await
            .unwrap();
        assert_eq!(resp.result, CREATE_DB_SUCCESS);

        let envelope = BackupData::decode(&backups.store("b1").snapshot()[0]).unwrap();
        assert!(envelope.is_create_database());
        assert_eq!(&envelope.query[..], b"CREATE DATABASE db1");
    }

    #[tokio::test]
    async fn test_raw_query() {
        let transport = ScriptedTransport::healthy();
        let backend = start(transport.clone(), MemoryBackupFactory::new()).await;
        transport.set_handler(|_| Ok(HttpResponse::new(200, "_result,table\n").with_header("Content-Type", "text/csv")));

        let mut headers = Headers::new();
        headers.insert("Accept", "application/csv");
        let resp = backend
            .raw_query(1, RawQuery { headers, body: Bytes::from_static(b"from(bucket:\"db1\")") })
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("content-type"), Some("text/csv"));
        let sent = &transport.requests_to("/api/v2/query")[0];
        assert_eq!(sent.headers.get("accept"), Some("application/csv"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = start(ScriptedTransport::healthy(), MemoryBackupFactory::new()).await;
        backend.close().unwrap();
        backend.close().unwrap();
        backend.wait().await;
    }
}

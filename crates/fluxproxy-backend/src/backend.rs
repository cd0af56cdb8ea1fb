//! 后端接口与构造
//!
//! 集群层只依赖 `Backend` trait,管理器通过注入的 `BackendFactory` 创建实例。

use async_trait::async_trait;
use fluxproxy_common::{
    BackendSettings, FlowId, Headers, MetricsSink, PointsReader, QueryParams, RawQuery,
    RawResponse, Response, WriteParams,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::BackupFactory;
use crate::influxdb::InfluxBackend;
use crate::status::Status;
use crate::transport::Transport;
use crate::BackendResult;

/// 后端主机信息,来自服务发现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disabled: bool,
    /// 备份回放限速,负数关闭备份,0 不限速
    #[serde(default)]
    pub backup_rate_limit: f64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl HostInfo {
    pub fn new(domain_name: impl Into<String>, port: u16) -> Self {
        Self {
            domain_name: domain_name.into(),
            port,
            username: String::new(),
            password: String::new(),
            disabled: false,
            backup_rate_limit: 0.0,
            protocol: default_protocol(),
        }
    }

    /// 实例访问地址,如 `http://127.0.0.1:8086`
    pub fn address(&self) -> String {
        let protocol = if self.protocol.is_empty() { "http" } else { self.protocol.as_str() };
        format!("{}://{}:{}", protocol, self.domain_name, self.port)
    }
}

/// 单个底层实例的访问接口
#[async_trait]
pub trait Backend: Send + Sync + fmt::Display {
    fn name(&self) -> &str;

    /// 写入行协议数据
    async fn write(
        &self,
        flow: FlowId,
        params: &WriteParams,
        reader: PointsReader,
        header: &Headers,
    ) -> BackendResult<Response>;

    async fn query(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> BackendResult<Response>;

    async fn create_database(&self, flow: FlowId, params: &QueryParams, header: &Headers) -> BackendResult<Response>;

    /// 列式查询透传
    async fn raw_query(&self, flow: FlowId, request: RawQuery) -> BackendResult<RawResponse>;

    /// 返回往返耗时与实例版本
    async fn ping(&self, timeout: Duration) -> BackendResult<(Duration, String)>;

    fn readable(&self) -> bool;

    fn disabled(&self) -> bool;

    fn version(&self) -> String;

    fn status(&self) -> Status;

    /// 原地更新连接参数
    fn reset(&self, host: &HostInfo) -> BackendResult<()>;

    /// 取消后台任务,可重复调用
    fn close(&self) -> BackendResult<()>;

    /// 等待后台任务退出
    async fn wait(&self);
}

/// 按主机信息创建后端
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        host: &HostInfo,
        cancel: &CancellationToken,
    ) -> BackendResult<Arc<dyn Backend>>;
}

/// 后端运行所需的外部依赖
#[derive(Clone)]
pub struct BackendDeps {
    pub settings: BackendSettings,
    pub transport: Arc<dyn Transport>,
    pub backup_factory: Arc<dyn BackupFactory>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// InfluxDB 后端工厂
pub struct InfluxBackendFactory {
    deps: BackendDeps,
}

impl InfluxBackendFactory {
    pub fn new(deps: BackendDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl BackendFactory for InfluxBackendFactory {
    async fn create(
        &self,
        name: &str,
        host: &HostInfo,
        cancel: &CancellationToken,
    ) -> BackendResult<Arc<dyn Backend>> {
        let backend = InfluxBackend::start(name, host.clone(), self.deps.clone(), cancel).await?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_address() {
        let mut host = HostInfo::new("127.0.0.1", 8086);
        assert_eq!(host.address(), "http://127.0.0.1:8086");
        host.protocol = "https".into();
        assert_eq!(host.address(), "https://127.0.0.1:8086");
        host.protocol.clear();
        assert_eq!(host.address(), "http://127.0.0.1:8086");
    }

    #[test]
    fn test_host_compare() {
        let a = HostInfo::new("127.0.0.1", 8086);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.backup_rate_limit = 10.0;
        assert_ne!(a, b);
    }
}

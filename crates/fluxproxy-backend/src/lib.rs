//! 后端层模块
//!
//! 本模块管理每个底层时序数据库实例的写入与健康状态:
//! - **InfluxBackend**: 健康状态机、同步/缓冲写入、查询、建库、透传查询
//! - **Buffer**: 按 (backend, db[, rp]) 聚合写入,按数量或时间刷新
//! - **backup**: 后端不可写时的持久化溢出队列(Kafka)及回放
//! - **BackendManager**: 期望拓扑与运行中后端的差异调和,失败整体回滚
//!
//! # 写入决策
//!
//! - 网络错误: 转入备份,备份成功则对调用方透明
//! - 非 5xx 的业务错误: 原样返回
//! - 5xx: 按配置转入备份
//! - 备份队列不可用: 后端整体进入不可写状态

pub mod backend;
pub mod backup;
pub mod buffer;
pub mod influxdb;
pub mod limiter;
pub mod manager;
pub mod status;
pub mod transport;

mod flush;
mod health;
#[cfg(test)]
mod testutil;

pub use backend::{Backend, BackendDeps, BackendFactory, HostInfo, InfluxBackendFactory};
pub use backup::{
    BackupData, BackupFactory, BackupHandler, BackupStore, EmptyBackup, EmptyBackupFactory,
    KafkaBackup, KafkaBackupFactory, MemoryBackup, MemoryBackupFactory,
};
pub use buffer::Buffer;
pub use influxdb::InfluxBackend;
pub use limiter::RateLimiter;
pub use manager::BackendManager;
pub use status::{HealthState, Status};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, ScriptedTransport, Transport, TransportError};

use fluxproxy_common::CommonError;
use thiserror::Error;

/// 后端层错误类型
#[derive(Error, Debug)]
pub enum BackendError {
    /// 网络错误
    #[error("Network error: {0}")]
    Network(String),

    /// 写请求失败
    #[error("Do write request failed: {0}")]
    DoWrite(String),

    /// 查询请求失败
    #[error("Do query request failed: {0}")]
    DoQuery(String),

    /// 读取响应体失败
    #[error("Read response body failed: {0}")]
    ReadBody(String),

    /// 读取写入数据失败
    #[error("Read write payload failed: {0}")]
    ReadReader(#[from] std::io::Error),

    /// 序列化备份数据失败
    #[error("Serialize backup data failed: {0}")]
    BackupSerialize(String),

    /// 解析备份数据失败
    #[error("Decode backup data failed: {0}")]
    BackupDecode(String),

    /// 推送备份队列失败
    #[error("Push data to backup queue failed: {0}")]
    PushBackup(String),

    /// 写入需要备份,但备份失败
    #[error("Write backup failed: {0}")]
    WriteBackup(String),

    /// 备份队列不可用
    #[error("Backup queue unavailable: {0}")]
    BackupUnavailable(String),

    /// 备份积压量小于 0
    #[error("Backup offset lower than zero: {0}")]
    LowerZeroOffset(i64),

    /// ping 返回非预期状态码
    #[error("Ping failed with status {0}")]
    Ping(u16),

    /// 后端不存在
    #[error("Backend not exist: {0}")]
    BackendNotExist(String),

    /// 列表中存在不存在的后端
    #[error("Backends not exist in list: {0:?}")]
    BackendNotExistInList(Vec<String>),

    /// 刷新后端失败,已回滚
    #[error("Refresh backend failed")]
    RefreshFailed,

    /// 没有可恢复的快照
    #[error("Backup snapshot is empty")]
    BackupIsNil,

    /// 未知的备份队列类型
    #[error("Unknown backup type: {0}")]
    UnknownBackendType(String),

    /// 后端已关闭
    #[error("Backend closed: {0}")]
    Closed(String),

    /// 公共层错误
    #[error("Common error: {0}")]
    Common(#[from] CommonError),
}

impl BackendError {
    /// 是否为网络层错误
    pub fn is_network(&self) -> bool {
        matches!(self, BackendError::Network(_))
    }

    /// 是否为读取响应体错误
    pub fn is_read_body(&self) -> bool {
        matches!(self, BackendError::ReadBody(_))
    }
}

/// 后端层 Result 类型别名
pub type BackendResult<T> = Result<T, BackendError>;

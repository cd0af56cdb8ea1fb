//! 集群错误类型定义

use fluxproxy_backend::BackendError;
use fluxproxy_common::CommonError;
use thiserror::Error;

/// 集群操作错误
#[derive(Error, Debug)]
pub enum ClusterError {
    /// 集群中存在缺失的后端
    #[error("Cluster has missing backend")]
    MissingBackend,

    /// 写入失败,至少一个后端硬失败
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// 建库失败
    #[error("Create database failed: {0}")]
    CreateDbFailed(String),

    /// 查询失败
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// 没有可用的后端
    #[error("Influxdb cluster: [{0}] has no available backend")]
    NoAvailableBackend(String),

    /// 标签 key 没有对应的后端
    #[error("Match backend by tag failed: {0}")]
    MatchBackendByTag(String),

    /// 从查询中获取标签值失败
    #[error("Get tag value failed: {0}")]
    GetTagValueFailed(String),

    /// 语句解析失败
    #[error("SQL parse error: {0}")]
    Sql(String),

    /// 集群不存在
    #[error("Cluster not exist: {0}")]
    ClusterNotExist(String),

    /// 刷新集群失败,已回滚
    #[error("Refresh cluster failed")]
    RefreshFailed,

    /// 没有可恢复的快照
    #[error("Cluster backup snapshot is empty")]
    BackupIsNil,

    /// 服务发现错误
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// 后端层错误
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// 公共层错误
    #[error("Common error: {0}")]
    Common(#[from] CommonError),
}

/// 集群操作结果类型
pub type ClusterResult<T> = Result<T, ClusterError>;

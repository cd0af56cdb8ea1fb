//! 代理配置模块
//!
//! 本模块定义了 fluxproxy 的全部配置项:
//! - 日志配置(级别、JSON 输出)
//! - 后端配置(超时、健康检查、备份策略、缓冲写入、请求头白名单)
//! - Kafka 备份队列配置
//! - 集群配置(扇出并发、轮询键上限)
//! - 拓扑文件与重载间隔
//!
//! 支持从 TOML 文件加载配置。

use fluxproxy_backend::{
    BackendError, BackupFactory, EmptyBackupFactory, KafkaBackupFactory, MemoryBackupFactory,
};
use fluxproxy_common::{BackendSettings, ClusterSettings, KafkaConfig, LogConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::{ServerError, ServerResult};

/// 代理主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,

    /// 后端配置
    #[serde(default)]
    pub backend: BackendSettings,

    /// Kafka 配置
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// 集群配置
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// 备份队列配置
    #[serde(default)]
    pub backup: BackupConfig,

    /// 拓扑文件路径,未配置时以空拓扑启动
    #[serde(default)]
    pub topology_file: Option<PathBuf>,

    /// 拓扑重载间隔(毫秒) (默认: 10000)
    #[serde(default = "default_reload_interval")]
    pub reload_interval_ms: u64,
}

fn default_reload_interval() -> u64 { 10000 }

/// 备份队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// 队列类型: kafka / memory / empty (默认: kafka)
    #[serde(default = "default_backup_kind")]
    pub kind: String,
}

fn default_backup_kind() -> String { "kafka".to_string() }

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            kind: default_backup_kind(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            backend: BackendSettings::default(),
            kafka: KafkaConfig::default(),
            cluster: ClusterSettings::default(),
            backup: BackupConfig::default(),
            topology_file: None,
            reload_interval_ms: default_reload_interval(),
        }
    }
}

impl ProxyConfig {
    /// # Brief
    /// 从 TOML 文件加载配置
    ///
    /// # Arguments
    /// * `path` - 配置文件路径
    ///
    /// # Returns
    /// 解析并校验后的配置实例
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("Failed to read config: {}", e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> ServerResult<()> {
        if self.reload_interval_ms == 0 {
            return Err(ServerError::Config("reload_interval_ms must be positive".to_string()));
        }
        if self.backend.ping_interval_ms == 0 {
            return Err(ServerError::Config("backend.ping_interval_ms must be positive".to_string()));
        }
        if self.backend.failure_threshold == 0 {
            return Err(ServerError::Config("backend.failure_threshold must be positive".to_string()));
        }
        self.backup_factory().map(|_| ())
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    /// # Brief
    /// 按 `[backup] kind` 创建备份队列工厂
    ///
    /// # Returns
    /// 未知类型返回 `UnknownBackendType`
    pub fn backup_factory(&self) -> ServerResult<Arc<dyn BackupFactory>> {
        match self.backup.kind.as_str() {
            "kafka" => Ok(Arc::new(KafkaBackupFactory::new(self.kafka.clone()))),
            "memory" => Ok(MemoryBackupFactory::new()),
            "empty" => Ok(Arc::new(EmptyBackupFactory)),
            other => Err(BackendError::UnknownBackendType(other.to_string()).into()),
        }
    }
}

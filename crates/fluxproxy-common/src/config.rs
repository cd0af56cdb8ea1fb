//! 共享配置段
//!
//! 后端、Kafka 备份队列、集群路由与日志的配置项,均支持 serde 默认值,
//! 由服务端的 TOML 配置文件组合加载。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 后端写入与健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// HTTP 请求超时(毫秒) (默认: 30000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// 健康检查间隔(毫秒) (默认: 5000)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// ping 时等待 leader 的秒数 (默认: 5)
    #[serde(default = "default_wait_for_leader_secs")]
    pub wait_for_leader_secs: u64,

    /// 连续 ping 失败多少次判定为不可用 (默认: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// 5xx 响应是否转入备份 (默认: true)
    #[serde(default = "default_force_backup")]
    pub force_backup: bool,

    /// 不使用 Kafka 备份队列
    #[serde(default)]
    pub ignore_kafka: bool,

    /// 缓冲刷新间隔(毫秒) (默认: 5000)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// 缓冲刷新的数据点阈值,为 0 时关闭缓冲 (默认: 0)
    #[serde(default)]
    pub batch_size: usize,

    /// 并发刷新的工作协程数 (默认: 100)
    #[serde(default = "default_max_flush_concurrency")]
    pub max_flush_concurrency: usize,

    /// 缓冲写入通道容量 (默认: 10000)
    #[serde(default = "default_write_channel_size")]
    pub write_channel_size: usize,

    /// 转发给后端的请求头白名单
    #[serde(default = "default_header_whitelist")]
    pub header_whitelist: Vec<String>,
}

fn default_timeout_ms() -> u64 { 30000 }
fn default_ping_interval_ms() -> u64 { 5000 }
fn default_wait_for_leader_secs() -> u64 { 5 }
fn default_failure_threshold() -> u32 { 3 }
fn default_force_backup() -> bool { true }
fn default_flush_interval_ms() -> u64 { 5000 }
fn default_max_flush_concurrency() -> usize { 100 }
fn default_write_channel_size() -> usize { 10000 }
fn default_header_whitelist() -> Vec<String> {
    ["Content-Type", "Accept", "User-Agent", "X-Forwarded-For", "X-Request-Id"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            wait_for_leader_secs: default_wait_for_leader_secs(),
            failure_threshold: default_failure_threshold(),
            force_backup: default_force_backup(),
            ignore_kafka: false,
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: 0,
            max_flush_concurrency: default_max_flush_concurrency(),
            write_channel_size: default_write_channel_size(),
            header_whitelist: default_header_whitelist(),
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// 三个缓冲参数均非零时启用缓冲写入
    pub fn buffer_enabled(&self) -> bool {
        self.flush_interval_ms > 0 && self.batch_size > 0 && self.max_flush_concurrency > 0
    }
}

/// Kafka 备份队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_address")]
    pub address: String,

    #[serde(default = "default_kafka_port")]
    pub port: u16,

    /// topic 前缀,完整 topic 为 `<prefix>_<backend>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// 数据保留时长(小时),0 表示使用 broker 默认值,最小 24 (默认: 336)
    #[serde(default = "default_offset_retention_hours")]
    pub offset_retention_hours: u64,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// SASL 机制 (默认: PLAIN)
    #[serde(default = "default_mechanism")]
    pub mechanism: String,

    /// 回放时复查积压量的间隔(毫秒) (默认: 5000)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_kafka_address() -> String { "127.0.0.1".to_string() }
fn default_kafka_port() -> u16 { 9092 }
fn default_topic_prefix() -> String { "bkmonitor".to_string() }
fn default_offset_retention_hours() -> u64 { 336 }
fn default_mechanism() -> String { "PLAIN".to_string() }
fn default_check_interval_ms() -> u64 { 5000 }

/// 数据保留时长下限(小时)
pub const MIN_OFFSET_RETENTION_HOURS: u64 = 24;

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            address: default_kafka_address(),
            port: default_kafka_port(),
            topic_prefix: default_topic_prefix(),
            offset_retention_hours: default_offset_retention_hours(),
            username: String::new(),
            password: String::new(),
            mechanism: default_mechanism(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl KafkaConfig {
    pub fn brokers(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 实际生效的保留时长,未设置时返回 None
    pub fn retention(&self) -> Option<Duration> {
        match self.offset_retention_hours {
            0 => None,
            hours => Some(Duration::from_secs(
                hours.max(MIN_OFFSET_RETENTION_HOURS) * 3600,
            )),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn topic(&self, backend: &str) -> String {
        format!("{}_{}", self.topic_prefix, backend)
    }

    pub fn group(&self, backend: &str) -> String {
        format!("fluxproxy_{}", backend)
    }
}

/// 集群路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// 扇出写入的最大并发数 (默认: 64)
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,

    /// 轮询计数表的最大键数量 (默认: 5000)
    #[serde(default = "default_balance_max_keys")]
    pub balance_max_keys: usize,
}

fn default_fanout_concurrency() -> usize { 64 }
fn default_balance_max_keys() -> usize { 5000 }

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            fanout_concurrency: default_fanout_concurrency(),
            balance_max_keys: default_balance_max_keys(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

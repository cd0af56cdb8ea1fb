//! fluxproxy 公共模块
//!
//! 各组件共享的基础设施:
//! - **types**: 写入/查询参数、响应、请求头等值对象
//! - **reader**: 基于区间索引、可重读的写入数据读取器
//! - **point**: 行协议扫描与标签路由键
//! - **metrics**: 指标上报接口
//! - **config**: 后端、Kafka、集群与日志的共享配置段

pub mod error;
pub mod types;
pub mod reader;
pub mod point;
pub mod metrics;
pub mod config;

pub use config::{BackendSettings, ClusterSettings, KafkaConfig, LogConfig};
pub use error::{CommonError, CommonResult};
pub use metrics::{MemoryMetrics, MetricsSink, TracingMetrics};
pub use point::{parse_points, tags_key, tags_key_prefix, Point, Tag};
pub use reader::{CopyReader, PointsReader};
pub use types::*;

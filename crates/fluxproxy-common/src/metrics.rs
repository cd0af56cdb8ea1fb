//! 指标上报接口
//!
//! 指标后端由外部提供,各组件通过构造函数注入 `Arc<dyn MetricsSink>`。

use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

pub const BACKEND_REQUEST: &str = "backend_request";
pub const BACKEND_ALIVE: &str = "backend_alive";
pub const BACKEND_BACKUP_COUNT: &str = "backend_backup_count";
pub const BACKEND_BACKUP_OFFSET: &str = "backend_backup_offset";
pub const BACKEND_PANIC: &str = "backend_panic";
pub const CLUSTER_REQUEST: &str = "cluster_request";

/// 指标标签
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// 带标签的计数器/仪表盘接收端
pub trait MetricsSink: Send + Sync {
    fn counter_add(&self, name: &str, labels: Labels<'_>, value: u64);

    fn gauge_set(&self, name: &str, labels: Labels<'_>, value: f64);

    fn counter_inc(&self, name: &str, labels: Labels<'_>) {
        self.counter_add(name, labels, 1);
    }
}

/// 将指标写成 trace 级别日志
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn counter_add(&self, name: &str, labels: Labels<'_>, value: u64) {
        trace!("counter {}{} += {}", name, format_labels(labels), value);
    }

    fn gauge_set(&self, name: &str, labels: Labels<'_>, value: f64) {
        trace!("gauge {}{} = {}", name, format_labels(labels), value);
    }
}

/// 内存中的指标表,用于状态快照与测试断言
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
}

impl MemoryMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 按指标名与完整标签读取计数
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    /// 指标名下所有序列的计数之和
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{}{{", name);
        self.counters
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| *e.value())
            .sum()
    }
}

impl MetricsSink for MemoryMetrics {
    fn counter_add(&self, name: &str, labels: Labels<'_>, value: u64) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += value;
    }

    fn gauge_set(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.gauges.insert(series_key(name, labels), value);
    }
}

fn format_labels(labels: Labels<'_>) -> String {
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
    format!("{{{}}}", parts.join(","))
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    format!("{}{}", name, format_labels(labels))
}

//! 读请求轮询计数

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 每个路由键一个单调递增计数器,用作轮询起点
///
/// 键数量超过上限时整体清空,避免长时间运行后无界增长。
pub struct BalanceMap {
    counters: DashMap<String, AtomicU64>,
    max_keys: usize,
}

impl BalanceMap {
    pub fn new(max_keys: usize) -> Self {
        Self {
            counters: DashMap::new(),
            max_keys: max_keys.max(1),
        }
    }

    /// 返回键当前计数并加一
    pub fn get_count(&self, key: &str) -> u64 {
        if let Some(counter) = self.counters.get(key) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        if self.counters.len() >= self.max_keys {
            self.counters.clear();
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_per_key() {
        let balance = BalanceMap::new(10);
        assert_eq!(balance.get_count("a"), 0);
        assert_eq!(balance.get_count("a"), 1);
        assert_eq!(balance.get_count("b"), 0);
        assert_eq!(balance.get_count("a"), 2);
    }

    #[test]
    fn test_clear_on_overflow() {
        let balance = BalanceMap::new(2);
        balance.get_count("a");
        balance.get_count("a");
        balance.get_count("b");
        assert_eq!(balance.len(), 2);
        assert_eq!(balance.get_count("c"), 0);
        assert_eq!(balance.len(), 1);
        assert_eq!(balance.get_count("a"), 0);
    }
}

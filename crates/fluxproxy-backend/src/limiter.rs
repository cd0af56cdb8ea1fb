//! 备份回放限速器
//!
//! 令牌桶,突发容量为 1。限速值为负表示关闭备份,为 0 表示不限速。

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct LimiterState {
    limit: f64,
    tokens: f64,
    last: Instant,
}

/// 令牌桶限速器
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(limit: f64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                limit,
                tokens: 1.0,
                last: Instant::now(),
            }),
        }
    }

    /// 每秒允许的次数
    pub fn limit(&self) -> f64 {
        self.state.lock().limit
    }

    pub fn set_limit(&self, limit: f64) {
        let mut state = self.state.lock();
        Self::refill(&mut state);
        state.limit = limit;
    }

    /// 限速值为负时不做备份
    pub fn backup_disabled(&self) -> bool {
        self.limit() < 0.0
    }

    fn refill(state: &mut LimiterState) {
        let now = Instant::now();
        if state.limit > 0.0 {
            let elapsed = now.duration_since(state.last).as_secs_f64();
            state.tokens = (state.tokens + elapsed * state.limit).min(1.0);
        }
        state.last = now;
    }

    /// 立即获取一个令牌,失败时返回需要等待的时长
    fn reserve(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        if state.limit == 0.0 {
            return None;
        }
        if state.limit < 0.0 {
            // 关闭状态下不放行,等待重新配置
            return Some(Duration::from_secs(1));
        }
        Self::refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - state.tokens) / state.limit))
    }

    /// # Brief
    /// 等待一个令牌
    ///
    /// # Returns
    /// 取得令牌返回 true,被取消返回 false
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            let delay = match self.reserve() {
                None => return true,
                Some(delay) => delay,
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_rate() {
        let limiter = RateLimiter::new(2.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(limiter.wait(&cancel).await);
        assert!(limiter.wait(&cancel).await);
        assert!(limiter.wait(&cancel).await);

        // 首个令牌立即可用,之后每 500ms 一个
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_and_cancel() {
        let limiter = RateLimiter::new(0.0);
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            assert!(limiter.wait(&cancel).await);
        }

        limiter.set_limit(-1.0);
        assert!(limiter.backup_disabled());
        cancel.cancel();
        assert!(!limiter.wait(&cancel).await);
    }
}

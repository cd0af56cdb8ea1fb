//! 后端健康状态

use chrono::{DateTime, Utc};
use std::fmt;

/// 由状态位推导出的健康阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// 尚未完成首次检查
    Unknown,
    /// 可写可读
    Healthy,
    /// 可写,备份队列仍有积压,暂不可读
    Recovering,
    /// 不可直接写入,不可读
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Recovering => "recovering",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// 后端状态
///
/// 只由后端自身的健康检查任务和写入失败路径修改。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// 对外可写(写入总能进入直写或备份)
    pub write: bool,
    /// 可直接写入底层实例
    pub inner_write: bool,
    /// 可读
    pub read: bool,
    /// 连续失败次数
    pub invalid_count: u32,
    /// 是否正在回放备份
    pub recovery: bool,
    /// 是否完成过首次检查
    pub checked: bool,
    pub update_time: DateTime<Utc>,
}

impl Status {
    /// 初始状态: 可写但不直写,不可读
    pub fn initial() -> Self {
        Self {
            write: true,
            inner_write: false,
            read: false,
            invalid_count: 0,
            recovery: false,
            checked: false,
            update_time: Utc::now(),
        }
    }

    pub fn set(&mut self, write: bool, inner_write: bool, read: bool) {
        self.write = write;
        self.inner_write = inner_write;
        self.read = read;
        self.checked = true;
        self.update_time = Utc::now();
    }

    pub fn state(&self) -> HealthState {
        if !self.checked {
            return HealthState::Unknown;
        }
        match (self.inner_write, self.read) {
            (true, true) => HealthState::Healthy,
            (true, false) => HealthState::Recovering,
            _ => HealthState::Unhealthy,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "write[{}]inner_write[{}]read[{}]invalid_count[{}]recovery[{}]state[{}]",
            self.write,
            self.inner_write,
            self.read,
            self.invalid_count,
            self.recovery,
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut status = Status::initial();
        assert_eq!(status.state(), HealthState::Unknown);

        status.set(true, true, false);
        assert_eq!(status.state(), HealthState::Recovering);

        status.set(true, true, true);
        assert_eq!(status.state(), HealthState::Healthy);

        status.set(true, false, false);
        assert_eq!(status.state(), HealthState::Unhealthy);
    }
}

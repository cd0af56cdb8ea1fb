//! 测试辅助

use fluxproxy_common::{BackendSettings, MemoryMetrics};
use std::sync::Arc;

use crate::backend::BackendDeps;
use crate::backup::MemoryBackupFactory;
use crate::transport::ScriptedTransport;

/// 健康检查间隔足够长,测试中只由显式调用触发
pub(crate) fn deps(transport: Arc<ScriptedTransport>, backups: Arc<MemoryBackupFactory>) -> BackendDeps {
    deps_with(transport, backups, BackendSettings::default())
}

pub(crate) fn deps_with(
    transport: Arc<ScriptedTransport>,
    backups: Arc<MemoryBackupFactory>,
    settings: BackendSettings,
) -> BackendDeps {
    BackendDeps {
        settings: BackendSettings {
            ping_interval_ms: 3_600_000,
            ..settings
        },
        transport,
        backup_factory: backups,
        metrics: MemoryMetrics::new(),
    }
}

//! 健康检查与备份回放
//!
//! 定时 ping 底层实例,根据结果与备份队列积压切换状态:
//!
//! | ping | 积压 | 状态 (write, inner_write, read) |
//! |------|------|---------------------------------|
//! | 失败 | -    | 达到阈值或首次检查时 (true, false, false) |
//! | 成功 | 查询失败 | (true, false, false),重连队列 |
//! | 成功 | 有   | (true, true, false),启动回放 |
//! | 成功 | 无   | (true, true, true) |
//!
//! 同一时刻最多一个回放任务。

use async_trait::async_trait;
use bytes::Bytes;
use fluxproxy_common::metrics::{BACKEND_BACKUP_COUNT, BACKEND_PANIC};
use fluxproxy_common::{PointsReader, QueryParams};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupData, BackupHandler};
use crate::influxdb::Inner;

impl Inner {
    /// 记录后台任务,顺带清理已结束的句柄
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub(crate) async fn run_health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 首次检查已在启动时同步完成
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("backend {} health loop exit", self.name);
                    self.cancel_recovery();
                    return;
                }
                _ = ticker.tick() => {
                    self.check_health().await;
                }
            }
        }
    }

    /// 单次健康检查
    pub(crate) async fn check_health(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        match self.ping(self.settings.timeout()).await {
            Err(e) => {
                let count = self.invalid_count_inc();
                let checked = self.status.read().checked;
                warn!("backend {} ping failed: {}, invalid count {}", self.name, e, count);
                if count >= self.settings.failure_threshold || !checked {
                    self.set_status(true, false, false);
                    self.cancel_recovery();
                }
            }
            Ok((cost, version)) => {
                debug!("backend {} ping ok, cost {:?}", self.name, cost);
                *self.version.write() = version;
                match self.backup_store().has_data().await {
                    Err(e) => {
                        error!("backend {} check backup failed: {}", self.name, e);
                        self.set_status(true, false, false);
                        self.cancel_recovery();
                        self.reconnect_backup().await;
                        return;
                    }
                    Ok(true) => {
                        self.set_status(true, true, false);
                        self.start_recovery();
                    }
                    Ok(false) => self.set_status(true, true, true),
                }
                self.reset_invalid_count();
            }
        }
        self.report_offset().await;
    }

    async fn reconnect_backup(&self) {
        match self.backup_factory.create(&self.name).await {
            Ok(store) => {
                let old = std::mem::replace(&mut *self.backup.write(), store);
                old.close().await;
                warn!("backend {} backup store reconnected", self.name);
            }
            Err(e) => error!("backend {} reconnect backup store failed: {}", self.name, e),
        }
    }

    pub(crate) fn cancel_recovery(&self) {
        if let Some((id, token)) = self.recovery.lock().take() {
            info!("backend {} cancel recovery {}", self.name, id);
            token.cancel();
            self.status.write().recovery = false;
        }
    }

    /// 启动回放,已有回放时不做任何事
    fn start_recovery(self: &Arc<Self>) {
        let (id, token) = {
            let mut slot = self.recovery.lock();
            if slot.is_some() {
                debug!("backend {} recovery is running", self.name);
                return;
            }
            let id = self.recovery_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let token = self.cancel.child_token();
            *slot = Some((id, token.clone()));
            (id, token)
        };
        self.status.write().recovery = true;

        let inner = self.clone();
        self.track(tokio::spawn(inner.recover(id, token)));
    }

    async fn recover(self: Arc<Self>, id: u64, token: CancellationToken) {
        let count = self.backup_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.counter_inc(BACKEND_BACKUP_COUNT, &[("backend", self.name.as_str())]);

        let start = tokio::time::Instant::now();
        let permitted = self.limiter.backup_disabled() || self.limiter.wait(&token).await;
        info!(
            "backend {} start recovery {}, backup_count:{} rate_limit:{} wait:{:?}",
            self.name,
            id,
            count,
            self.limiter.limit(),
            start.elapsed()
        );

        if permitted {
            let store = self.backup_store();
            match store.pull(&token, self.as_ref()).await {
                Ok(()) if token.is_cancelled() => info!("backend {} recovery {} cancelled", self.name, id),
                Ok(()) => {
                    if self.status.read().inner_write {
                        info!("backend {} recovery {} done, readable now", self.name, id);
                        self.set_status(true, true, true);
                    }
                }
                Err(e) => error!("backend {} pull from {} failed: {}", self.name, store.topic(), e),
            }
        }

        let mut slot = self.recovery.lock();
        if matches!(&*slot, Some((current, _)) if *current == id) {
            *slot = None;
            self.status.write().recovery = false;
        }
    }

    async fn replay(&self, data: &[u8]) {
        if self.limiter.backup_disabled() {
            warn!("backend {} backup disabled, drop recovery data", self.name);
            self.request_metric("recover", "dropped", "");
            return;
        }

        let envelope = match BackupData::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("backend {} decode backup data failed: {}", self.name, e);
                self.request_metric("recover", "decode_error", "");
                return;
            }
        };

        let flow = envelope.flow_id;
        let result = if envelope.is_create_database() {
            let sql = String::from_utf8_lossy(&envelope.query).into_owned();
            self.create_database(flow, &QueryParams::new("", sql), &envelope.header).await
        } else {
            let mut reader = PointsReader::from_bytes(Bytes::clone(&envelope.query));
            self.write_direct(flow, &envelope.url_params, &mut reader, &envelope.header, "recover")
                .await
        };

        match result {
            Ok(resp) if resp.is_error() => {
                warn!("flow:{} backend:{} recovery got {}: {}", flow, self.name, resp.code, resp.result)
            }
            Ok(_) => debug!("flow:{} backend:{} recovery success", flow, self.name),
            Err(e) => error!("flow:{} backend:{} recovery failed: {}", flow, self.name, e),
        }
    }
}

#[async_trait]
impl BackupHandler for Inner {
    async fn handle(&self, data: &[u8]) {
        if let Err(panic) = AssertUnwindSafe(self.replay(data)).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(
                "backend {} panic while recovering data: {}, data: {}",
                self.name,
                message,
                String::from_utf8_lossy(data)
            );
            self.metrics.counter_inc(BACKEND_PANIC, &[("backend", self.name.as_str())]);
        }
    }
}

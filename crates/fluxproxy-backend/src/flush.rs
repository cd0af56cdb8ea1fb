//! 缓冲写入流水线
//!
//! 一个事件循环独占全部 Buffer,负责聚合写入与处理定时通知;
//! 达到刷新条件的 Buffer 经由有界通道交给固定数量的刷新工作协程。
//! 关闭时事件循环把通道中剩余的写入与所有未刷新的 Buffer 交出,
//! 工作协程处理完后随通道关闭退出。

use fluxproxy_common::CopyReader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferData, FlushNotify};
use crate::influxdb::Inner;

struct EventLoop {
    inner: Arc<Inner>,
    buffers: HashMap<String, Buffer>,
    next_id: AtomicU64,
    notify_tx: mpsc::Sender<FlushNotify>,
    flush_tx: mpsc::Sender<Buffer>,
}

impl Inner {
    /// 启动事件循环与刷新工作协程,返回全部任务句柄
    pub(crate) fn spawn_buffer_pipeline(self: &Arc<Self>, data_rx: mpsc::Receiver<BufferData>) -> Vec<JoinHandle<()>> {
        let workers = self.settings.max_flush_concurrency.max(1);
        let (flush_tx, flush_rx) = mpsc::channel::<Buffer>(workers);
        let (notify_tx, notify_rx) = mpsc::channel::<FlushNotify>(workers * 4);
        let flush_rx = Arc::new(Mutex::new(flush_rx));

        let mut handles = Vec::with_capacity(workers + 1);
        for index in 0..workers {
            let inner = self.clone();
            let rx = flush_rx.clone();
            handles.push(tokio::spawn(async move { inner.flush_worker(index, rx).await }));
        }

        let event_loop = EventLoop {
            inner: self.clone(),
            buffers: HashMap::new(),
            next_id: AtomicU64::new(0),
            notify_tx,
            flush_tx,
        };
        handles.push(tokio::spawn(event_loop.run(data_rx, notify_rx)));
        info!("backend {} buffer enabled with {} flush workers", self.name, workers);
        handles
    }

    async fn flush_worker(self: Arc<Self>, index: usize, rx: Arc<Mutex<mpsc::Receiver<Buffer>>>) {
        loop {
            let buffer = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            match buffer {
                Some(buffer) => self.flush_buffer(buffer).await,
                None => {
                    debug!("backend {} flush worker {} exit", self.name, index);
                    return;
                }
            }
        }
    }

    async fn flush_buffer(&self, mut buffer: Buffer) {
        let params = buffer.params().clone();
        let header = buffer.header().clone();
        let points = buffer.point_count();
        let flow = buffer.flows().first().copied().unwrap_or_default();
        debug!(
            "backend {} flush buffer {} with {} points from {} requests",
            self.name,
            buffer.key(),
            points,
            buffer.flows().len()
        );
        match self.write_direct(flow, &params, &mut buffer, &header, "flush").await {
            Ok(resp) if resp.is_error() => warn!(
                "backend {} flush buffer {} got {}: {}",
                self.name,
                buffer.key(),
                resp.code,
                resp.result
            ),
            Ok(_) => {}
            Err(e) => error!("backend {} flush buffer {} failed: {}, flows: {:?}", self.name, buffer.key(), e, buffer.flows()),
        }
    }
}

impl EventLoop {
    async fn run(mut self, mut data_rx: mpsc::Receiver<BufferData>, mut notify_rx: mpsc::Receiver<FlushNotify>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                data = data_rx.recv() => match data {
                    Some(data) => self.on_data(data).await,
                    None => break,
                },
                Some((key, id)) = notify_rx.recv() => self.on_notify(key, id).await,
            }
        }

        // 关闭后不再接收新写入,把已在通道中的数据一并刷出
        data_rx.close();
        while let Some(data) = data_rx.recv().await {
            self.on_data(data).await;
        }
        let remaining: Vec<Buffer> = self.buffers.drain().map(|(_, b)| b).collect();
        info!("backend {} draining {} buffers", self.inner.name, remaining.len());
        for mut buffer in remaining {
            buffer.stop_timer();
            self.dispatch(buffer).await;
        }
        debug!("backend {} buffer event loop exit", self.inner.name);
    }

    async fn on_data(&mut self, data: BufferData) {
        let key = Buffer::key_of(&self.inner.name, &data.params);
        let inner = &self.inner;
        let next_id = &self.next_id;
        let notify_tx = &self.notify_tx;
        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| {
            let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let mut buffer = Buffer::new(id, key.clone(), data.params.clone(), data.header.clone());
            if !inner.cancel.is_cancelled() {
                buffer.start_timer(inner.settings.flush_interval(), notify_tx.clone());
            }
            buffer
        });
        buffer.push(data.flow, data.reader);

        if buffer.point_count() >= self.inner.settings.batch_size {
            if let Some(mut buffer) = self.buffers.remove(&key) {
                buffer.stop_timer();
                self.dispatch(buffer).await;
            }
        }
    }

    async fn on_notify(&mut self, key: String, id: u64) {
        let current = self.buffers.get(&key).map(Buffer::id);
        if current != Some(id) {
            debug!("backend {} ignore stale flush notify {}:{}", self.inner.name, key, id);
            return;
        }
        if let Some(buffer) = self.buffers.remove(&key) {
            self.dispatch(buffer).await;
        }
    }

    async fn dispatch(&self, buffer: Buffer) {
        if let Err(mpsc::error::SendError(buffer)) = self.flush_tx.send(buffer).await {
            warn!("backend {} flush workers gone, flush inline", self.inner.name);
            self.inner.flush_buffer(buffer).await;
        }
    }
}

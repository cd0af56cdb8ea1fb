//! 写入缓冲
//!
//! 同一 (backend, db[, rp]) 的多次写入聚合到一个 Buffer 中,
//! 数据点数达到阈值或定时器到期时整体交给刷新工作协程。
//! Buffer 只由所属后端的事件循环持有和修改,不需要加锁。

use bytes::{Bytes, BytesMut};
use fluxproxy_common::{CopyReader, FlowId, Headers, PointsReader, WriteParams};
use std::io::{self, Read};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 缓冲写入请求
pub(crate) struct BufferData {
    pub flow: FlowId,
    pub params: WriteParams,
    pub header: Headers,
    pub reader: PointsReader,
}

/// 定时刷新通知: (key, buffer id)
pub(crate) type FlushNotify = (String, u64);

/// 单个 key 的写入缓冲
pub struct Buffer {
    id: u64,
    key: String,
    params: WriteParams,
    header: Headers,
    readers: Vec<PointsReader>,
    points: usize,
    flows: Vec<FlowId>,
    /// 首次读取时物化的连续数据
    data: Option<Bytes>,
    pos: usize,
    timer: Option<JoinHandle<()>>,
}

impl Buffer {
    /// 缓冲 key: `backend:db` 或 `backend:db:rp`
    pub fn key_of(backend: &str, params: &WriteParams) -> String {
        if params.rp.is_empty() {
            format!("{}:{}", backend, params.db)
        } else {
            format!("{}:{}:{}", backend, params.db, params.rp)
        }
    }

    pub fn new(id: u64, key: String, params: WriteParams, header: Headers) -> Self {
        Self {
            id,
            key,
            params,
            header,
            readers: Vec::new(),
            points: 0,
            flows: Vec::new(),
            data: None,
            pos: 0,
            timer: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn params(&self) -> &WriteParams {
        &self.params
    }

    pub fn header(&self) -> &Headers {
        &self.header
    }

    pub fn flows(&self) -> &[FlowId] {
        &self.flows
    }

    /// 追加一个写入请求的数据
    pub fn push(&mut self, flow: FlowId, reader: PointsReader) {
        self.points += reader.point_count();
        self.flows.push(flow);
        self.readers.push(reader);
        self.data = None;
        self.pos = 0;
    }

    /// 启动定时刷新,到期后向事件循环发送通知
    pub(crate) fn start_timer(&mut self, interval: Duration, notify: mpsc::Sender<FlushNotify>) {
        self.stop_timer();
        let key = self.key.clone();
        let id = self.id;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = notify.send((key, id)).await;
        }));
    }

    pub fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn materialize(&mut self) -> Bytes {
        if let Some(data) = &self.data {
            return data.clone();
        }
        let data = match self.readers.as_slice() {
            [single] => single.to_bytes(),
            readers => {
                let mut buf = BytesMut::with_capacity(readers.iter().map(|r| r.len()).sum());
                for reader in readers {
                    buf.extend_from_slice(&reader.to_bytes());
                }
                buf.freeze()
            }
        };
        self.data = Some(data.clone());
        data
    }
}

impl Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.materialize();
        let remaining = &data[self.pos.min(data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl CopyReader for Buffer {
    fn seek_zero(&mut self) {
        self.pos = 0;
    }

    fn point_count(&self) -> usize {
        self.points
    }

    fn read_remaining(&mut self) -> io::Result<Bytes> {
        let data = self.materialize();
        let start = self.pos.min(data.len());
        self.pos = data.len();
        Ok(data.slice(start..))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

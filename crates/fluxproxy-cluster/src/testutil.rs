//! 测试辅助: 可编排应答的后端与计数的服务发现

use async_trait::async_trait;
use bytes::Bytes;
use fluxproxy_backend::{Backend, BackendError, BackendResult, HostInfo, Status};
use fluxproxy_common::{
    CopyReader, FlowId, Headers, PointsReader, QueryParams, RawQuery, RawResponse, Response, WriteParams,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::discovery::{ClusterInfo, Discovery, StaticDiscovery, TagInfo};
use crate::ClusterResult;

/// 后端应答脚本
#[derive(Clone)]
pub(crate) enum Reply {
    Ok(Response),
    Network,
    Fail,
    Panic,
}

impl Reply {
    fn run(&self, name: &str) -> BackendResult<Response> {
        match self {
            Reply::Ok(resp) => Ok(resp.clone()),
            Reply::Network => Err(BackendError::Network(format!("{} unreachable", name))),
            Reply::Fail => Err(BackendError::DoQuery(format!("{} failed", name))),
            Reply::Panic => panic!("{} exploded", name),
        }
    }
}

pub(crate) struct MockBackend {
    pub name: String,
    pub readable: AtomicBool,
    pub closed: AtomicBool,
    pub write_reply: Mutex<Reply>,
    pub query_reply: Mutex<Reply>,
    pub writes: Mutex<Vec<Bytes>>,
    pub queries: AtomicUsize,
    pub version: String,
}

impl MockBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            readable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            write_reply: Mutex::new(Reply::Ok(Response::new("", 204))),
            query_reply: Mutex::new(Reply::Ok(Response::new(format!("from {}", name), 200))),
            writes: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            version: format!("1.8-{}", name),
        })
    }

    pub fn set_write(&self, reply: Reply) {
        *self.write_reply.lock() = reply;
    }

    pub fn set_query(&self, reply: Reply) {
        *self.query_reply.lock() = reply;
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub(crate) fn mock(name: &str) -> Arc<dyn Backend> {
    MockBackend::new(name)
}

impl fmt::Display for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock[{}]", self.name)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, _: FlowId, _: &WriteParams, mut reader: PointsReader, _: &Headers) -> BackendResult<Response> {
        let reply = self.write_reply.lock().clone();
        let data = reader.read_remaining()?;
        let resp = reply.run(&self.name)?;
        self.writes.lock().push(data);
        Ok(resp)
    }

    async fn query(&self, _: FlowId, _: &QueryParams, _: &Headers) -> BackendResult<Response> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let reply = self.query_reply.lock().clone();
        reply.run(&self.name)
    }

    async fn create_database(&self, _: FlowId, _: &QueryParams, _: &Headers) -> BackendResult<Response> {
        let reply = self.write_reply.lock().clone();
        reply.run(&self.name)
    }

    async fn raw_query(&self, _: FlowId, _: RawQuery) -> BackendResult<RawResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let reply = self.query_reply.lock().clone();
        let resp = reply.run(&self.name)?;
        Ok(RawResponse {
            status: resp.code,
            headers: Headers::new(),
            body: Bytes::from(resp.result),
        })
    }

    async fn ping(&self, _: Duration) -> BackendResult<(Duration, String)> {
        Ok((Duration::ZERO, self.version.clone()))
    }

    fn readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    fn disabled(&self) -> bool {
        false
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn status(&self) -> Status {
        let mut status = Status::initial();
        status.set(true, true, true);
        status
    }

    fn reset(&self, _: &HostInfo) -> BackendResult<()> {
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self) {}
}

/// 统计路由表拉取次数的服务发现
pub(crate) struct CountingDiscovery {
    inner: StaticDiscovery,
    tag_calls: AtomicUsize,
}

impl CountingDiscovery {
    pub fn new(inner: StaticDiscovery) -> Arc<Self> {
        Arc::new(Self {
            inner,
            tag_calls: AtomicUsize::new(0),
        })
    }

    pub fn tag_calls(&self) -> usize {
        self.tag_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for CountingDiscovery {
    async fn hosts(&self) -> ClusterResult<HashMap<String, HostInfo>> {
        self.inner.hosts().await
    }

    async fn clusters(&self) -> ClusterResult<HashMap<String, ClusterInfo>> {
        self.inner.clusters().await
    }

    async fn tag_infos(&self, cluster: &str) -> ClusterResult<HashMap<String, TagInfo>> {
        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.tag_infos(cluster).await
    }

    fn subscribe(&self, cluster: &str) -> broadcast::Receiver<()> {
        self.inner.subscribe(cluster)
    }
}

//! HTTP 传输层
//!
//! 后端只依赖 `Transport` trait,生产环境使用 reqwest 实现,
//! 测试与演练使用 `ScriptedTransport` 按脚本返回响应。

use async_trait::async_trait;
use bytes::Bytes;
use fluxproxy_common::Headers;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::{BackendError, BackendResult};

/// 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// 发往底层实例的 HTTP 请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// 完整地址,如 `http://127.0.0.1:8086/write`
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 查询参数,空值不发送
    pub fn param(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.query.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// 底层实例的 HTTP 响应
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    /// 连接、超时等网络错误
    #[error("network: {0}")]
    Network(String),

    /// 读取响应体失败
    #[error("read body: {0}")]
    Body(String),

    /// 请求构造失败
    #[error("request: {0}")]
    Request(String),
}

/// HTTP 传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// 基于 reqwest 的传输实现
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| BackendError::Network(format!("build http client failed: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.query(&request.query).timeout(timeout);
        for (name, values) in request.headers.iter() {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::Request(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.append(name.as_str(), v);
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(HttpResponse { status, headers, body })
    }
}

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// 按脚本应答的传输实现
///
/// 记录收到的全部请求,应答由可替换的处理函数决定。
pub struct ScriptedTransport {
    handler: RwLock<Arc<Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: RwLock::new(Arc::new(handler)),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// 所有请求都以指定状态码应答,ping 额外带上版本头
    pub fn healthy() -> Arc<Self> {
        Self::new(|req| {
            if req.url.ends_with("/ping") {
                Ok(HttpResponse::new(204, Bytes::new()).with_header("X-Influxdb-Version", "1.8.10"))
            } else if req.url.ends_with("/write") {
                Ok(HttpResponse::new(204, Bytes::new()))
            } else {
                Ok(HttpResponse::new(200, r#"{"results":[{"statement_id":0}]}"#))
            }
        })
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        *self.handler.write() = Arc::new(handler);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// 路径以 `suffix` 结尾的请求
    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest, _timeout: Duration) -> Result<HttpResponse, TransportError> {
        let handler = self.handler.read().clone();
        let result = handler(&request);
        self.requests.lock().push(request);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_skips_empty_params() {
        let req = HttpRequest::new(Method::Post, "http://127.0.0.1:8086/write")
            .param("db", "db1")
            .param("rp", "")
            .param("precision", "s");
        assert_eq!(req.query.len(), 2);
        assert_eq!(req.query_value("db"), Some("db1"));
        assert_eq!(req.query_value("rp"), None);
    }

    #[tokio::test]
    async fn test_scripted_transport_records() {
        let transport = ScriptedTransport::new(|req| {
            if req.url.ends_with("/query") {
                Err(TransportError::Network("connection refused".into()))
            } else {
                Ok(HttpResponse::new(204, Bytes::new()))
            }
        });

        let ok = transport
            .send(HttpRequest::new(Method::Post, "http://a/write"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok.status, 204);

        let err = transport
            .send(HttpRequest::new(Method::Post, "http://a/query"), Duration::from_secs(1))
            .await;
        assert!(matches!(err, Err(TransportError::Network(_))));
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(transport.requests_to("/write").len(), 1);
    }
}

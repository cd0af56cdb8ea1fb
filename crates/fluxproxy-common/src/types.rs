//! 公共类型定义模块
//!
//! 定义代理层在各组件之间传递的值对象:
//! - FlowId: 请求链路标识
//! - Headers: 可序列化的 HTTP 头集合
//! - WriteParams / QueryParams: 写入与查询参数
//! - Response: 后端响应 {Result, Code}
//! - RawQuery / RawResponse: 列式查询透传

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 请求链路标识,贯穿日志与指标
pub type FlowId = u64;

/// HTTP 头集合
///
/// 头名统一转为小写存储,值保留原始顺序。序列化为 `{name: [values]}`,
/// 以便写入备份信封后可跨进程重启恢复。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置头,覆盖已有值
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// 追加头值
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// 获取第一个值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// # Brief
    /// 按白名单复制头
    ///
    /// 只有白名单内的头会被转发给后端,认证头由后端自行注入。
    ///
    /// # Arguments
    /// * `whitelist` - 允许转发的头名,大小写不敏感
    pub fn filtered<S: AsRef<str>>(&self, whitelist: &[S]) -> Headers {
        let mut out = Headers::new();
        for name in whitelist {
            let key = name.as_ref().to_ascii_lowercase();
            if let Some(values) = self.0.get(&key) {
                out.0.insert(key, values.clone());
            }
        }
        out
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k.as_ref(), v);
        }
        headers
    }
}

/// 写入参数
///
/// 对应行协议写接口的 db/consistency/precision/rp 查询参数。
/// 该结构会写入备份信封,新增字段必须带 `#[serde(default)]`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteParams {
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub consistency: String,
    #[serde(default)]
    pub precision: String,
    #[serde(default)]
    pub rp: String,
}

impl WriteParams {
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for WriteParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "db[{}]consistency[{}]precision[{}]rp[{}]",
            self.db, self.consistency, self.precision, self.rp
        )
    }
}

/// 查询参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub pretty: String,
    #[serde(default)]
    pub chunked: String,
    #[serde(default)]
    pub chunk_size: String,
    /// 查询涉及的表,用于标签路由
    #[serde(default)]
    pub measurement: String,
    /// 参与路由的标签名,为空时不启用标签路由
    #[serde(default)]
    pub tag_names: Vec<String>,
}

impl QueryParams {
    pub fn new(db: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            sql: sql.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "db[{}]sql[{}]epoch[{}]measurement[{}]tag_names[{}]",
            self.db,
            self.sql,
            self.epoch,
            self.measurement,
            self.tag_names.join(",")
        )
    }
}

/// 后端响应
///
/// `code` 反映底层存储的 HTTP 状态码;缓冲写入或进入备份时为合成的成功码。
/// 调用方以 `Err` 区分硬失败,以 `code >= 300` 区分软失败。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub result: String,
    pub code: u16,
}

impl Response {
    pub fn new(result: impl Into<String>, code: u16) -> Self {
        Self {
            result: result.into(),
            code,
        }
    }

    /// 状态码是否表示失败
    pub fn is_error(&self) -> bool {
        self.code >= 300
    }
}

/// 列式查询透传请求
#[derive(Debug, Clone, Default)]
pub struct RawQuery {
    pub headers: Headers,
    pub body: Bytes,
}

/// 列式查询透传响应
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

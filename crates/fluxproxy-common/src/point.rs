//! 行协议数据点扫描与标签路由键
//!
//! 只解析路由需要的部分:表名与标签集合,字段和时间戳原样保留在区间内。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CommonError, CommonResult};
use crate::reader::PointsReader;

/// 标签路由键中键值之间的分隔符
pub const TAG_KV_SEPARATOR: &str = "==";
/// 标签路由键中多个标签之间的分隔符
pub const TAG_SEPARATOR: &str = "###";

/// 标签
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 单个数据点
///
/// `start`/`end` 为该行在原始请求体中的字节区间,包含行尾换行符。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub db: String,
    pub measurement: String,
    pub tags: Vec<Tag>,
    pub start: usize,
    pub end: usize,
}

/// # Brief
/// 扫描行协议请求体
///
/// 跳过空行与 `#` 注释行,为每个数据点记录字节区间并解析表名和标签。
///
/// # Arguments
/// * `db` - 写入的数据库
/// * `body` - 完整请求体
///
/// # Returns
/// 覆盖全部数据点的读取器,以及逐点的解析结果
pub fn parse_points(db: &str, body: Bytes) -> CommonResult<(PointsReader, Vec<Point>)> {
    let mut reader = PointsReader::new(body.clone());
    let mut points = Vec::new();
    let mut start = 0;
    let mut line_no = 0;

    while start < body.len() {
        line_no += 1;
        let end = match body[start..].iter().position(|b| *b == b'\n') {
            Some(pos) => start + pos + 1,
            None => body.len(),
        };
        let line = &body[start..end];
        let content = trim_ascii(line);
        if content.is_empty() || content[0] == b'#' {
            start = end;
            continue;
        }

        let (measurement, tags) = scan_series_key(content).map_err(|reason| {
            CommonError::LineProtocol {
                line: line_no,
                reason,
            }
        })?;
        reader.append_index(start, end)?;
        points.push(Point {
            db: db.to_string(),
            measurement,
            tags,
            start,
            end,
        });
        start = end;
    }

    Ok((reader, points))
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let begin = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(begin);
    &line[begin..end]
}

/// 解析 `measurement[,k=v...]` 部分
fn scan_series_key(line: &[u8]) -> Result<(String, Vec<Tag>), String> {
    let mut pos = 0;
    let measurement = scan_until(line, &mut pos, &[b',', b' ']);
    if measurement.is_empty() {
        return Err("missing measurement".to_string());
    }

    let mut tags = Vec::new();
    while pos < line.len() && line[pos] == b',' {
        pos += 1;
        let key = scan_until(line, &mut pos, &[b'=', b',', b' ']);
        if pos >= line.len() || line[pos] != b'=' {
            return Err(format!("missing tag value for key {}", key));
        }
        pos += 1;
        let value = scan_until(line, &mut pos, &[b',', b' ']);
        if key.is_empty() || value.is_empty() {
            return Err("empty tag key or value".to_string());
        }
        tags.push(Tag::new(key, value));
    }

    Ok((measurement, tags))
}

/// 读取到任一未转义的分隔符为止,并去除转义
fn scan_until(line: &[u8], pos: &mut usize, stops: &[u8]) -> String {
    let mut out = Vec::new();
    while *pos < line.len() {
        let b = line[*pos];
        if b == b'\\' && *pos + 1 < line.len() {
            let next = line[*pos + 1];
            if matches!(next, b',' | b' ' | b'=' | b'\\') {
                out.push(next);
                *pos += 2;
                continue;
            }
        }
        if stops.contains(&b) {
            break;
        }
        out.push(b);
        *pos += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// # Brief
/// 生成标签路由键
///
/// 按 `tag_names` 的顺序取值,同名标签只取第一次出现的值。
/// 格式: `db/measurement/k1==v1###k2==v2`
pub fn tags_key(db: &str, measurement: &str, tag_names: &[String], tags: &[Tag]) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for name in tag_names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        if let Some(tag) = tags.iter().find(|t| &t.key == name) {
            parts.push(format!("{}{}{}", tag.key, TAG_KV_SEPARATOR, tag.value));
        }
    }
    format!("{}/{}/{}", db, measurement, parts.join(TAG_SEPARATOR))
}

/// 某个 db/measurement 下全部路由键的公共前缀
pub fn tags_key_prefix(db: &str, measurement: &str) -> String {
    format!("{}/{}/", db, measurement)
}

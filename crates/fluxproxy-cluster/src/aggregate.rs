//! 多个路由键查询结果的合并
//!
//! 只处理单 series 的元信息查询(如 SHOW TAG VALUES),
//! 按行去重后写回第一个带数据的响应。

use fluxproxy_common::Response;
use serde_json::Value;
use std::collections::HashSet;

use crate::{ClusterError, ClusterResult};

const EMPTY_RESULT: &str = r#"{"results":[{"statement_id":0}]}"#;

fn values_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    doc.get_mut("results")?
        .get_mut(0)?
        .get_mut("series")?
        .get_mut(0)?
        .get_mut("values")?
        .as_array_mut()
}

fn row_key(row: &Value) -> String {
    match row {
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// # Brief
/// 合并多个响应的 series 行
///
/// # Returns
/// 全部为空时返回第一个响应;没有响应时返回空结果
pub fn merge_series_values(responses: Vec<Response>) -> ClusterResult<Response> {
    let Some(first) = responses.first().cloned() else {
        return Ok(Response::new(EMPTY_RESULT, 200));
    };

    let mut template: Option<(Value, u16)> = None;
    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for resp in &responses {
        let mut doc: Value = serde_json::from_str(&resp.result)
            .map_err(|e| ClusterError::QueryFailed(format!("decode result failed: {}", e)))?;
        let Some(values) = values_mut(&mut doc) else {
            continue;
        };
        let mut fresh = false;
        for row in values.drain(..) {
            if seen.insert(row_key(&row)) {
                rows.push(row);
                fresh = true;
            }
        }
        if fresh && template.is_none() {
            template = Some((doc, resp.code));
        }
    }

    let Some((mut doc, code)) = template else {
        return Ok(first);
    };
    if let Some(values) = values_mut(&mut doc) {
        *values = rows;
    }
    let result = serde_json::to_string(&doc)
        .map_err(|e| ClusterError::QueryFailed(format!("encode result failed: {}", e)))?;
    Ok(Response::new(result, code))
}

//! fluxproxy 集群模块
//!
//! 本模块把一组后端组合为逻辑上的一个写入/查询入口:
//! - **RouteCluster**: 按标签分片写入,轮询加故障转移读取,元信息结果合并
//! - **TagInfoManager**: 路由键到后端集合的映射,按需与按通知刷新
//! - **influxql**: 从 WHERE 条件中提取路由用的标签等值条件
//! - **ClusterManager**: 集群定义的差异调和,失败整体回滚
//! - **Discovery**: 拓扑与路由表的来源
//!
//! # 路由键
//!
//! `db/measurement/k1==v1###k2==v2`,标签按配置的标签名顺序排列。

pub mod aggregate;
pub mod balance;
pub mod discovery;
pub mod error;
pub mod influxql;
pub mod manager;
pub mod route_cluster;
pub mod tag_manager;

#[cfg(test)]
mod testutil;

pub use aggregate::merge_series_values;
pub use balance::BalanceMap;
pub use discovery::{ClusterInfo, Discovery, StaticDiscovery, TagInfo, Topology};
pub use error::{ClusterError, ClusterResult};
pub use influxql::{dimension_tags, select_tags};
pub use manager::ClusterManager;
pub use route_cluster::RouteCluster;
pub use tag_manager::TagInfoManager;

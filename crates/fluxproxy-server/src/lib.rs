//! fluxproxy 服务端
//!
//! 进程级入口: 配置加载、日志初始化,以及持有全部组件的 `Proxy` 上下文。
//! 组件之间不存在全局单例,全部依赖经由 `Proxy` 构造时注入。

pub mod config;
pub mod proxy;

pub use config::{BackupConfig, ProxyConfig};
pub use proxy::Proxy;

use fluxproxy_backend::BackendError;
use fluxproxy_cluster::ClusterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// # Brief
/// 初始化日志
///
/// `RUST_LOG` 优先于配置的级别
///
/// # Arguments
/// * `level` - 默认日志级别
/// * `json` - 是否输出 JSON 格式
pub fn init_logging(level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true))
            .init();
    } else {
        registry
            .with(fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true))
            .init();
    }
}

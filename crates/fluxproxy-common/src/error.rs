//! 错误类型定义模块
//!
//! 定义公共层的错误类型 CommonError 和 Result 别名。

use thiserror::Error;

/// 公共层错误类型
#[derive(Error, Debug)]
pub enum CommonError {
    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 反序列化错误
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// 行协议格式错误
    #[error("Invalid line protocol at line {line}: {reason}")]
    LineProtocol { line: usize, reason: String },

    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),
}

/// 公共层 Result 类型别名
pub type CommonResult<T> = Result<T, CommonError>;

//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。

use thiserror::Error;

/// IpGuard 错误类型
#[derive(Error, Debug)]
pub enum IpGuardError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// 封禁错误
    #[error("封禁错误: {0}")]
    BlockError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// 其他错误
    #[error("未知错误: {0}")]
    Other(String),
}

/// 存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// IO错误
    #[error("IO错误: {0}")]
    IoError(String),

    /// 锁超时错误
    #[error("锁超时: {0}")]
    TimeoutError(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializeError(String),
}

/// 决策结果
///
/// `handle_request` / `handle_response` 对单个请求作出的最终决定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 允许
    Allowed,
    /// 拒绝（返回配置的HTTP状态码）
    Blocked {
        /// 响应状态码
        status: u16,
        /// 拒绝原因（规则ID或"blocked"）
        reason: String,
    },
}

impl Decision {
    /// 是否被拒绝
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked { .. })
    }
}

//! 流程引擎错误类型
//!
//! 只有「配置错误」「会话键格式错误」「存储错误」会以 Err 形式返回调用方；
//! 未知 Hook、无法解析的跳转、输入校验失败都在引擎内部就地恢复并记录日志。

use thiserror::Error;

/// 引擎对外可见的错误
#[derive(Error, Debug)]
pub enum FlowError {
    /// 节点图来源缺失、为空或不是合法 JSON（调用方应回退到安全图）
    #[error("Config error: {0}")]
    ConfigError(String),

    /// 会话键无法解析为 `<channel>:<user_key>`
    #[error("Invalid session key: {0}")]
    InvalidSessionKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// 持久化层错误（SQLite / 序列化）
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 持有连接的互斥锁被毒化（其它线程在持锁期间 panic）
    #[error("Connection lock poisoned")]
    LockPoisoned,
}

impl FlowError {
    /// 是否属于用户可重试的错误（适配层据此回复通用的「请再试一次」）
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Storage(_))
    }
}

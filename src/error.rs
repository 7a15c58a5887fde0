//! 同步错误分类

use thiserror::Error;

/// 同步过程中可能出现的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 建立远程会话失败（认证 / 网络）
    #[error("connection failed: {0}")]
    Connection(String),

    /// 远程列目录、读属性或传输失败
    #[error("remote operation failed: {0}")]
    Protocol(String),

    /// 本地磁盘错误
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 协作式取消
    #[error("operation cancelled")]
    Cancelled,

    /// 调度配置缺失或无效
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn protocol(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        SyncError::Protocol(format!("{}: {}", context, err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

//! 事件溯源存储核心统一错误定义
//!
//! 覆盖存储、内部、数据损坏、版本冲突、未知或已删除历史、重复不一致、重试耗尽等
//! 最小必要集合；Journal 产生的错误原样穿过 Engine 交给上层协作方转换。
//!
use crate::id::EventId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HistoryError {
    // --- 存储 ---
    #[error("store error: {reason}")]
    Store { reason: String },

    // --- 不应发生（ID 生成等） ---
    #[error("internal error: {reason}")]
    Internal { reason: String },

    // --- 数据图违反不变量 ---
    #[error("corrupted data: {reason}")]
    Corrupted { reason: String },

    // --- 乐观并发 ---
    #[error("version conflict: stored={stored}, expected={expected}")]
    VersionConflict { stored: EventId, expected: EventId },
    #[error("unknown history: {id}")]
    UnknownHistory { id: Uuid },
    /// 历史已进入 `Deleting`/`Deleted`，不再接受提交；重试无意义
    #[error("history {id} is deleted")]
    HistoryDeleted { id: Uuid },
    #[error("duplicate mismatch: event {id} already stored with different content")]
    DuplicateMismatch { id: EventId },
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<HistoryError>,
    },

    // --- 读取游标 ---
    #[error("cursor not found: history={history}, event={event}")]
    CursorNotFound { history: Uuid, event: EventId },

    // --- 调用方 ---
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("operation cancelled")]
    Cancelled,
}

/// 统一 Result 类型别名
pub type HistoryResult<T> = Result<T, HistoryError>;

impl HistoryError {
    pub fn store(reason: impl Into<String>) -> Self {
        HistoryError::Store {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        HistoryError::Internal {
            reason: reason.into(),
        }
    }

    pub fn corrupted(reason: impl Into<String>) -> Self {
        HistoryError::Corrupted {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        HistoryError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// 是否为可安全重读重试的版本冲突
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, HistoryError::VersionConflict { .. })
    }
}

// 载荷无法解码即视为存储内容损坏
impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Corrupted {
            reason: err.to_string(),
        }
    }
}

/// 长扫描在顶层迭代步之间调用，令牌已取消时中止
pub(crate) fn bail_if_cancelled(cancel: &CancellationToken) -> HistoryResult<()> {
    if cancel.is_cancelled() {
        return Err(HistoryError::Cancelled);
    }
    Ok(())
}

//! 事件标识（EventId）与版本令牌
//!
//! - `EventId`：128 位、按时间可排序的 ULID，零值即“历史起点”哨兵；
//! - `IdGenerator`：以注入时钟为时间源的单调生成器；
//! - `ExpectedVid`：乐观并发的三种比较模式（精确 / 跳过 / 跳过并重试）。
//!
use crate::clock::Clock;
use crate::error::{HistoryError, HistoryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use ulid::{Generator, Ulid};

/// 事件标识：先解析，再按字典序比较即得到时间顺序
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// 历史起点哨兵
    pub const NIL: EventId = EventId(Ulid(0));
    /// 保留令牌：跳过版本比较
    pub const NO_VC: EventId = EventId(Ulid(u128::MAX));
    /// 保留令牌：跳过版本比较，提交冲突时重试
    pub const RETRY_NO_VC: EventId = EventId(Ulid(u128::MAX - 1));

    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Ulid(value))
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// 保留令牌不可作为真实事件标识
    pub fn is_reserved(&self) -> bool {
        *self == Self::NO_VC || *self == Self::RETRY_NO_VC
    }

    /// 标识中嵌入的创建时间（毫秒精度）
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0.timestamp_ms() as i64).unwrap_or_default()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EventId {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(EventId)
            .map_err(|e| HistoryError::invalid_argument(format!("event id {s:?}: {e}")))
    }
}

impl From<Ulid> for EventId {
    fn from(value: Ulid) -> Self {
        Self(value)
    }
}

/// 单调 ID 生成器
///
/// 同一毫秒内（或时钟回拨时）在上一个标识基础上递增，保证进程内严格递增。
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn generate(&self) -> HistoryResult<EventId> {
        let now = SystemTime::from(self.clock.now());
        let mut generator = self
            .inner
            .lock()
            .map_err(|_| HistoryError::internal("id generator lock poisoned"))?;
        generator
            .generate_from_datetime(now)
            .map(EventId)
            .map_err(|e| HistoryError::internal(format!("id generation failed: {e}")))
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

/// 期望版本（Vid）比较模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVid {
    /// 状态 Vid 必须与给定值一致
    Exact(EventId),
    /// 跳过比较
    NoCheck,
    /// 跳过比较，提交遇到版本冲突时有限次重试
    NoCheckRetry,
}

impl From<EventId> for ExpectedVid {
    fn from(value: EventId) -> Self {
        match value {
            EventId::NO_VC => ExpectedVid::NoCheck,
            EventId::RETRY_NO_VC => ExpectedVid::NoCheckRetry,
            vid => ExpectedVid::Exact(vid),
        }
    }
}

impl From<ExpectedVid> for EventId {
    fn from(value: ExpectedVid) -> Self {
        match value {
            ExpectedVid::Exact(vid) => vid,
            ExpectedVid::NoCheck => EventId::NO_VC,
            ExpectedVid::NoCheckRetry => EventId::RETRY_NO_VC,
        }
    }
}

//! 持久化记录模型
//!
//! 每个聚合命名空间包含三类逻辑记录：
//! - 原始事件 `Event`：不可变、内容寻址；
//! - 历史控制记录 `Refs`：head / epoch / tail / phase 等指针；
//! - 索引条目 `IndexEntry`：以 UUID‖EventId 打包键物化的序号行，支持按历史连续区间扫描。
//!
use crate::id::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 不可变事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// 前一个事件；`EventId::NIL` 表示历史起点
    pub parent: EventId,
    pub payload: Vec<u8>,
}

impl Event {
    /// 待提交事件，标识与父链接由 `Journal::commit` 补齐
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: EventId::NIL,
            parent: EventId::NIL,
            payload,
        }
    }

    pub fn link(&self) -> EventLink {
        EventLink {
            id: self.id,
            parent: self.parent,
        }
    }
}

/// 事件图中的一条边（GC 扫描只需要它）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLink {
    pub id: EventId,
    pub parent: EventId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Active,
    Deleting,
    Deleted,
}

/// 已物化到索引的序号；`Unspecified` 强制下一次读取时惰性重建
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Serial {
    #[default]
    Unspecified,
    At(u64),
}

impl Serial {
    pub fn value(&self) -> Option<u64> {
        match self {
            Serial::Unspecified => None,
            Serial::At(serial) => Some(*serial),
        }
    }
}

/// 纪元推进审计记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochLogEntry {
    pub epoch: EventId,
    pub time: DateTime<Utc>,
}

/// 历史控制记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refs {
    pub id: Uuid,
    pub head: EventId,
    /// 最老可重放事件的父事件
    pub epoch: EventId,
    pub epoch_log: Vec<EpochLogEntry>,
    /// GC 仍需保留的最老事件
    pub tail: EventId,
    pub serial: Serial,
    pub phase: Phase,
    /// 进入 `Deleting` 的时间
    pub dtime: Option<DateTime<Utc>>,
}

impl Refs {
    pub fn new(id: Uuid, head: EventId) -> Self {
        Self {
            id,
            head,
            epoch: EventId::NIL,
            epoch_log: Vec::new(),
            tail: EventId::NIL,
            serial: Serial::Unspecified,
            phase: Phase::Active,
            dtime: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    pub fn last_epoch_time(&self) -> Option<DateTime<Utc>> {
        self.epoch_log.last().map(|e| e.time)
    }
}

/// 打包索引键：UUID（16 字节）‖ EventId（16 字节），按字节序排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey([u8; 32]);

impl IndexKey {
    pub fn new(history: Uuid, event: EventId) -> Self {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(history.as_bytes());
        key[16..].copy_from_slice(&event.to_bytes());
        Self(key)
    }

    /// 某历史键区间的下界（含）
    pub fn first(history: Uuid) -> Self {
        Self::new(history, EventId::NIL)
    }

    /// 某历史键区间的上界（含）
    pub fn last(history: Uuid) -> Self {
        Self::new(history, EventId::from_u128(u128::MAX))
    }

    pub fn history(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.0[..16]);
        Uuid::from_bytes(bytes)
    }

    pub fn event(&self) -> EventId {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.0[16..]);
        EventId::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// 索引条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub parent: EventId,
    pub serial: u64,
    pub payload: Vec<u8>,
}

impl IndexEntry {
    pub fn new(history: Uuid, event: &Event, serial: u64) -> Self {
        Self {
            key: IndexKey::new(history, event.id),
            parent: event.parent,
            serial,
            payload: event.payload.clone(),
        }
    }

    pub fn into_event(self) -> Event {
        Event {
            id: self.key.event(),
            parent: self.parent,
            payload: self.payload,
        }
    }
}

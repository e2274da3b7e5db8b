//! 聚合行为（Behavior）协议
//!
//! 每种聚合类型由协作方实现的唯一领域扩展点：
//! - `new_state` 创建空状态；
//! - `new_advancer` 创建一次重放所用的折叠器；
//! - `tell` 将命令转换为事件（不改变状态）；
//! - `encode_event` / `decode_event` 决定事件载荷格式，默认 JSON。
//!
use crate::error::{HistoryError, HistoryResult};
use crate::id::EventId;
use serde::{Serialize, de::DeserializeOwned};
use std::error::Error;
use uuid::Uuid;

/// 把事件按顺序折叠进状态
pub trait Advancer<S, E>: Send {
    fn advance(&mut self, state: &mut S, id: EventId, event: E);

    /// 一批事件折叠完成后调用
    fn finish(&mut self, _state: &mut S) {}
}

/// 以闭包实现的折叠器
pub struct FnAdvancer<F>(pub F);

impl<S, E, F> Advancer<S, E> for FnAdvancer<F>
where
    F: FnMut(&mut S, EventId, E) + Send,
{
    fn advance(&mut self, state: &mut S, id: EventId, event: E) {
        (self.0)(state, id, event)
    }
}

pub trait Behavior: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;
    type Event: Serialize + DeserializeOwned + Send + 'static;
    /// 重试模式下命令可能被执行多次
    type Command: Clone + Send + Sync;
    type Error: Error + Send + Sync + 'static;
    type Advancer: Advancer<Self::State, Self::Event>;

    fn new_state(&self, id: Uuid) -> Self::State;

    fn new_advancer(&self) -> Self::Advancer;

    /// 执行命令，返回产生的事件；空列表表示无操作
    fn tell(
        &self,
        state: &Self::State,
        command: Self::Command,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    fn encode_event(&self, event: &Self::Event) -> HistoryResult<Vec<u8>> {
        serde_json::to_vec(event)
            .map_err(|e| HistoryError::internal(format!("event encoding failed: {e}")))
    }

    fn decode_event(&self, payload: &[u8]) -> HistoryResult<Self::Event> {
        Ok(serde_json::from_slice(payload)?)
    }
}

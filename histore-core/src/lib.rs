//! 事件溯源存储内核（histore-core）
//!
//! 为“以事件历史为唯一事实来源”的服务提供持久化内核：
//! - 事件日志（`journal`）：只追加、内容寻址、以条件更新实现乐观并发
//! - 命令引擎（`engine`）：重放 → 行为决策 → 提交 → 折叠，带状态缓存与三种版本模式
//! - 裁剪（`trimmer`）与垃圾回收（`gc`）：按保留策略推进 epoch / tail，并分阶段回收事件与索引
//! - 变更通知（`notifier`）：单任务串行化的订阅表与非阻塞广播
//! - 周期维护（`maintenance`）：按固定间隔调度裁剪与回收
//!
//! 跨进程协调只依赖存储上的单文档 CAS，不存在全局锁；存储后端通过 `store::Store` 注入。
//!
//! 典型用法：
//! 1. 为聚合实现 `Behavior`（以及可选的 `RetentionPolicy`）；
//! 2. 以 `Journal::builder()` 组装日志，再构建 `Engine` 执行命令；
//! 3. 使用 `Maintenance` 周期运行 `Trimmer` 与 `GarbageCollector`。
//!
pub mod behavior;
pub mod clock;
pub mod engine;
pub mod error;
pub mod gc;
pub mod id;
pub mod journal;
pub mod maintenance;
pub mod model;
pub mod notifier;
pub mod retention;
pub mod store;
pub mod trimmer;

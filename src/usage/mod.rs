//! 进程内用量统计与封禁名单。
//!
//! 每个身份一条记录：分钟桶、自然日桶各用 2 槽环形缓冲，外加历史总量计数，
//! 内存占用与运行时长无关。数据不落盘，重启即清空。

mod record;
mod store;
mod types;

pub use store::{MemoryUsageStore, UsageStore};
pub use types::{LimitKind, Limits, UsageSnapshot, resolve_identity};

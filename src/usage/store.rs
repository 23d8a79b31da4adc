use crate::usage::record::UsageRecord;
use crate::usage::types::{LimitKind, Limits, UsageSnapshot};
use dashmap::{DashMap, DashSet};

/// 用量与封禁状态的存储接口。
///
/// 准入逻辑只依赖该接口；`now` 一律为 unix 秒。
pub trait UsageStore: Send + Sync + std::fmt::Debug {
    fn is_daily_limit_exceeded(&self, identity: &str, now: i64) -> bool;

    fn is_minute_limit_exceeded(&self, identity: &str, now: i64) -> bool;

    /// 当前分钟桶与当前自然日桶各 +1（同一身份内线性一致）。
    fn record(&self, identity: &str, now: i64);

    /// 在同一临界区内完成限额检查与计数；超限时不计数。
    fn try_reserve(&self, identity: &str, now: i64) -> Result<(), LimitKind>;

    fn snapshot(&self, identity: &str, now: i64) -> UsageSnapshot;

    /// 清空该身份的全部计数并解除封禁（幂等）。
    fn reset(&self, identity: &str);

    fn block(&self, identity: &str);

    fn unblock(&self, identity: &str);

    fn is_blocked(&self, identity: &str) -> bool;
}

/// 进程内存储：按身份分片加锁（DashMap 的 entry guard 即单身份临界区）。
#[derive(Debug)]
pub struct MemoryUsageStore {
    limits: Limits,
    records: DashMap<String, UsageRecord>,
    blocked: DashSet<String>,
}

impl MemoryUsageStore {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            records: DashMap::new(),
            blocked: DashSet::new(),
        }
    }

    fn exceeded(&self, rec: &UsageRecord, now: i64) -> Option<LimitKind> {
        if rec.requests_today(now) >= self.limits.daily {
            return Some(LimitKind::Daily);
        }
        if rec.requests_this_minute(now) >= self.limits.minute {
            return Some(LimitKind::Minute);
        }
        None
    }
}

impl UsageStore for MemoryUsageStore {
    fn is_daily_limit_exceeded(&self, identity: &str, now: i64) -> bool {
        let today = self
            .records
            .get(identity)
            .map(|rec| rec.requests_today(now))
            .unwrap_or(0);
        today >= self.limits.daily
    }

    fn is_minute_limit_exceeded(&self, identity: &str, now: i64) -> bool {
        let this_minute = self
            .records
            .get(identity)
            .map(|rec| rec.requests_this_minute(now))
            .unwrap_or(0);
        this_minute >= self.limits.minute
    }

    fn record(&self, identity: &str, now: i64) {
        self.records
            .entry(identity.to_string())
            .or_default()
            .record(now);
    }

    fn try_reserve(&self, identity: &str, now: i64) -> Result<(), LimitKind> {
        let mut rec = self.records.entry(identity.to_string()).or_default();
        if let Some(kind) = self.exceeded(&rec, now) {
            return Err(kind);
        }
        rec.record(now);
        Ok(())
    }

    fn snapshot(&self, identity: &str, now: i64) -> UsageSnapshot {
        let mut snap = self
            .records
            .get(identity)
            .map(|rec| UsageSnapshot {
                total_requests: rec.total_requests(),
                requests_this_minute: rec.requests_this_minute(now),
                requests_today: rec.requests_today(now),
                is_blocked: false,
            })
            .unwrap_or_default();
        snap.is_blocked = self.is_blocked(identity);
        snap
    }

    fn reset(&self, identity: &str) {
        self.records.remove(identity);
        self.blocked.remove(identity);
    }

    fn block(&self, identity: &str) {
        self.blocked.insert(identity.to_string());
    }

    fn unblock(&self, identity: &str) {
        self.blocked.remove(identity);
    }

    fn is_blocked(&self, identity: &str) -> bool {
        self.blocked.contains(identity)
    }
}

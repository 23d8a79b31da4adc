//! 准入控制：封禁优先于限流，限流先看自然日再看分钟。

use crate::usage::{LimitKind, UsageSnapshot, UsageStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    DeniedBlocked,
    DeniedRateLimited(LimitKind),
}

impl AdmissionDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    store: Arc<dyn UsageStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// 只读判定；放行后调用方需自行 `record`。
    ///
    /// 判定与计数是两步操作：大量并发请求可能同时通过判定，导致计数略超上限。
    pub fn admit(&self, identity: &str, now: i64) -> AdmissionDecision {
        if self.store.is_blocked(identity) {
            return AdmissionDecision::DeniedBlocked;
        }
        if self.store.is_daily_limit_exceeded(identity, now) {
            return AdmissionDecision::DeniedRateLimited(LimitKind::Daily);
        }
        if self.store.is_minute_limit_exceeded(identity, now) {
            return AdmissionDecision::DeniedRateLimited(LimitKind::Minute);
        }
        AdmissionDecision::Allowed
    }

    pub fn record(&self, identity: &str, now: i64) {
        self.store.record(identity, now);
    }

    /// 判定并在放行时原子地占用一个名额（请求路径使用）。
    pub fn admit_and_record(&self, identity: &str, now: i64) -> AdmissionDecision {
        if self.store.is_blocked(identity) {
            return AdmissionDecision::DeniedBlocked;
        }
        match self.store.try_reserve(identity, now) {
            Ok(()) => AdmissionDecision::Allowed,
            Err(kind) => AdmissionDecision::DeniedRateLimited(kind),
        }
    }

    pub fn block(&self, identity: &str) {
        self.store.block(identity);
        tracing::info!(identity, "用户已封禁");
    }

    pub fn unblock(&self, identity: &str) {
        self.store.unblock(identity);
        tracing::info!(identity, "用户已解除封禁");
    }

    pub fn reset(&self, identity: &str) {
        self.store.reset(identity);
        tracing::info!(identity, "用户用量统计已重置");
    }

    pub fn usage(&self, identity: &str, now: i64) -> UsageSnapshot {
        self.store.snapshot(identity, now)
    }
}

use crate::usage::types::{day_index, minute_index};

/// 环形缓冲的槽位数：当前窗口 + 上一个窗口。
const SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    index: i64,
    count: u32,
}

/// 按窗口编号取模定位槽位的计数器；槽位标签与查询窗口不一致即视为 0。
#[derive(Debug, Clone, Default)]
pub struct BucketRing {
    slots: [Option<Slot>; SLOTS],
}

impl BucketRing {
    fn position(index: i64) -> usize {
        index.rem_euclid(SLOTS as i64) as usize
    }

    pub fn count(&self, index: i64) -> u32 {
        match self.slots[Self::position(index)] {
            Some(slot) if slot.index == index => slot.count,
            _ => 0,
        }
    }

    pub fn increment(&mut self, index: i64) -> u32 {
        let slot = &mut self.slots[Self::position(index)];
        match slot {
            Some(s) if s.index == index => {
                s.count = s.count.saturating_add(1);
                s.count
            }
            // 旧窗口的槽位被复用：覆盖标签，从 1 开始计数。
            _ => {
                *slot = Some(Slot { index, count: 1 });
                1
            }
        }
    }
}

/// 单个身份的用量记录。
#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    minutes: BucketRing,
    days: BucketRing,
    total: u64,
}

impl UsageRecord {
    pub fn requests_this_minute(&self, now: i64) -> u32 {
        self.minutes.count(minute_index(now))
    }

    pub fn requests_today(&self, now: i64) -> u32 {
        self.days.count(day_index(now))
    }

    /// 所有自然日计数之和（槽位被复用后仍保留历史总量）。
    pub fn total_requests(&self) -> u64 {
        self.total
    }

    pub fn record(&mut self, now: i64) {
        self.minutes.increment(minute_index(now));
        self.days.increment(day_index(now));
        self.total = self.total.saturating_add(1);
    }
}

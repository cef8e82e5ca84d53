use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::{Ms, SlotTime};
use crate::observability;
use crate::policy::Clock;

pub type OccupiedSlots = Arc<BTreeSet<SlotTime>>;
/// Confirmed appointment count per day of a month, days with none omitted.
pub type MonthCounts = Arc<Vec<(NaiveDate, u32)>>;

struct Entry<V> {
    stored_at: Ms,
    value: V,
}

/// Short-lived read-side memo of occupancy. Never consulted for write decisions.
pub struct AvailabilityCache {
    days: DashMap<NaiveDate, Entry<OccupiedSlots>>,
    months: DashMap<(i32, u32), Entry<MonthCounts>>,
    ttl_ms: Ms,
    clock: Arc<dyn Clock>,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            days: DashMap::new(),
            months: DashMap::new(),
            ttl_ms: ttl.as_millis() as Ms,
            clock,
        }
    }

    fn fresh(&self, stored_at: Ms) -> bool {
        self.clock.now_ms() - stored_at < self.ttl_ms
    }

    fn record(hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        metrics::counter!(observability::CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
    }

    pub fn get(&self, date: NaiveDate) -> Option<OccupiedSlots> {
        let hit = self
            .days
            .get(&date)
            .filter(|e| self.fresh(e.stored_at))
            .map(|e| e.value.clone());
        Self::record(hit.is_some());
        hit
    }

    pub fn put(&self, date: NaiveDate, occupied: OccupiedSlots) {
        let stored_at = self.clock.now_ms();
        self.days.insert(date, Entry { stored_at, value: occupied });
    }

    pub fn get_month(&self, year: i32, month: u32) -> Option<MonthCounts> {
        let hit = self
            .months
            .get(&(year, month))
            .filter(|e| self.fresh(e.stored_at))
            .map(|e| e.value.clone());
        Self::record(hit.is_some());
        hit
    }

    pub fn put_month(&self, year: i32, month: u32, counts: MonthCounts) {
        let stored_at = self.clock.now_ms();
        self.months.insert((year, month), Entry { stored_at, value: counts });
    }

    pub fn invalidate_all(&self) {
        self.days.clear();
        self.months.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ManualClock;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 10).unwrap()
    }

    fn occupied(times: &[(u32, u32)]) -> OccupiedSlots {
        Arc::new(times.iter().map(|&(h, m)| SlotTime::from_hm(h, m).unwrap()).collect())
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = AvailabilityCache::new(Duration::from_secs(300), clock.clone());

        assert!(cache.get(day()).is_none());
        cache.put(day(), occupied(&[(14, 0)]));
        assert_eq!(cache.get(day()).unwrap().len(), 1);

        clock.advance(chrono::Duration::seconds(299));
        assert!(cache.get(day()).is_some());
        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.get(day()).is_none());
    }

    #[test]
    fn last_writer_wins() {
        let cache = AvailabilityCache::new(Duration::from_secs(300), Arc::new(ManualClock::new(0)));
        cache.put(day(), occupied(&[(9, 0)]));
        cache.put(day(), occupied(&[(9, 0), (9, 30)]));
        assert_eq!(cache.get(day()).unwrap().len(), 2);
    }

    #[test]
    fn invalidate_all_clears_days_and_months() {
        let cache = AvailabilityCache::new(Duration::from_secs(300), Arc::new(ManualClock::new(0)));
        cache.put(day(), occupied(&[(9, 0)]));
        cache.put_month(2025, 10, Arc::new(vec![(day(), 1)]));
        assert!(cache.get_month(2025, 10).is_some());

        cache.invalidate_all();
        assert!(cache.get(day()).is_none());
        assert!(cache.get_month(2025, 10).is_none());
    }
}

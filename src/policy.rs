use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};

use crate::engine::EngineError;
use crate::limits::MAX_HORIZON_DAYS;
use crate::model::{self, Ms, Slot, SlotTime};

// ── Clock ────────────────────────────────────────────────────────

/// Source of "now" for every time-window decision.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Settable clock for tests and simulations.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: Ms) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: Ms) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

// ── Policy ───────────────────────────────────────────────────────

/// Business rules of one shop. All hours are local to `utc_offset_minutes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub cancel_lead_hours: u32,
    pub modify_lead_hours: u32,
    pub max_modifications: u32,
    pub max_active_per_owner: u32,
    pub booking_horizon_days: u32,
    pub slot_minutes: u32,
    pub open_hour: u32,
    pub close_hour: u32,
    pub open_weekdays: Vec<Weekday>,
    pub utc_offset_minutes: i32,
    pub reminder_lead_hours: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cancel_lead_hours: 1,
            modify_lead_hours: 2,
            max_modifications: 2,
            max_active_per_owner: 3,
            booking_horizon_days: 120,
            slot_minutes: 30,
            open_hour: 9,
            close_hour: 18,
            open_weekdays: vec![
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
            utc_offset_minutes: -180,
            reminder_lead_hours: 24,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), String> {
        if self.open_hour >= self.close_hour || self.close_hour > 24 {
            return Err(format!(
                "opening hours {}..{} are not a valid range",
                self.open_hour, self.close_hour
            ));
        }
        if self.slot_minutes == 0 || self.slot_minutes > (self.close_hour - self.open_hour) * 60 {
            return Err(format!("slot length {} does not fit the day", self.slot_minutes));
        }
        if self.booking_horizon_days == 0 || self.booking_horizon_days > MAX_HORIZON_DAYS {
            return Err(format!(
                "booking horizon must be 1..={MAX_HORIZON_DAYS} days, got {}",
                self.booking_horizon_days
            ));
        }
        if self.open_weekdays.is_empty() {
            return Err("at least one open weekday is required".into());
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(format!("utc offset {} out of range", self.utc_offset_minutes));
        }
        if self.max_active_per_owner == 0 {
            return Err("max active appointments per owner must be at least 1".into());
        }
        Ok(())
    }

    /// Every bookable start time of a business day, ascending.
    pub fn slot_grid(&self) -> Vec<SlotTime> {
        let close = self.close_hour * 60;
        let mut grid = Vec::new();
        let mut t = self.open_hour * 60;
        while t < close {
            if let Some(st) = SlotTime::from_minutes(t) {
                grid.push(st);
            }
            t += self.slot_minutes;
        }
        grid
    }

    pub fn is_on_grid(&self, t: SlotTime) -> bool {
        let m = t.minutes();
        let open = self.open_hour * 60;
        m >= open && m < self.close_hour * 60 && (m - open) % self.slot_minutes == 0
    }

    /// Shop-local wall clock for an instant.
    pub fn local_time(&self, at: Ms) -> NaiveDateTime {
        let utc = DateTime::from_timestamp_millis(at)
            .map(|d| d.naive_utc())
            .unwrap_or_default();
        utc + Duration::minutes(self.utc_offset_minutes as i64)
    }

    pub fn local_now(&self, clock: &dyn Clock) -> NaiveDateTime {
        self.local_time(clock.now_ms())
    }

    /// Inverse of `local_time`.
    pub fn to_instant(&self, local: NaiveDateTime) -> Ms {
        (local - Duration::minutes(self.utc_offset_minutes as i64))
            .and_utc()
            .timestamp_millis()
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        is_business_day(date, &self.open_weekdays)
    }

    /// Grid check for caller-supplied slots.
    pub fn check_on_grid(&self, slot: &Slot) -> Result<(), EngineError> {
        if self.is_on_grid(slot.start) {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "{} is not a bookable start time (grid {:02}:00-{:02}:00 every {} min)",
                slot.start, self.open_hour, self.close_hour, self.slot_minutes
            )))
        }
    }
}

/// `today <= date <= today + horizon_days`.
pub fn is_within_booking_horizon(date: NaiveDate, now: NaiveDateTime, horizon_days: u32) -> bool {
    let today = now.date();
    date >= today && date <= today + Duration::days(horizon_days as i64)
}

pub fn is_business_day(date: NaiveDate, open_weekdays: &[Weekday]) -> bool {
    open_weekdays.contains(&date.weekday())
}

/// Signed hours from `now` until the slot starts. Negative once it has begun.
pub fn hours_until(date: NaiveDate, time: SlotTime, now: NaiveDateTime) -> f64 {
    let starts = date.and_time(time.to_naive_time());
    (starts - now).num_milliseconds() as f64 / 3_600_000.0
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    model::parse_date(s)
        .ok_or_else(|| EngineError::InvalidArgument(format!("malformed date {s:?}, expected YYYY-MM-DD")))
}

pub fn parse_time(s: &str) -> Result<SlotTime, EngineError> {
    SlotTime::parse(s)
        .ok_or_else(|| EngineError::InvalidArgument(format!("malformed time {s:?}, expected HH:MM")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn at(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
        d(y, m, day).and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn default_grid_runs_nine_to_half_five() {
        let grid = Policy::default().slot_grid();
        assert_eq!(grid.len(), 18);
        assert_eq!(grid.first().unwrap().to_string(), "09:00");
        assert_eq!(grid.last().unwrap().to_string(), "17:30");
    }

    #[test]
    fn grid_membership() {
        let p = Policy::default();
        assert!(p.is_on_grid(SlotTime::from_hm(9, 0).unwrap()));
        assert!(p.is_on_grid(SlotTime::from_hm(17, 30).unwrap()));
        assert!(!p.is_on_grid(SlotTime::from_hm(18, 0).unwrap()));
        assert!(!p.is_on_grid(SlotTime::from_hm(8, 30).unwrap()));
        assert!(!p.is_on_grid(SlotTime::from_hm(10, 15).unwrap()));
    }

    #[test]
    fn horizon_is_inclusive_at_both_ends() {
        let now = at(2025, 10, 10, 11, 0);
        assert!(is_within_booking_horizon(d(2025, 10, 10), now, 120));
        assert!(is_within_booking_horizon(d(2026, 2, 7), now, 120));
        assert!(!is_within_booking_horizon(d(2026, 2, 8), now, 120));
        assert!(!is_within_booking_horizon(d(2025, 10, 9), now, 120));
    }

    #[test]
    fn business_days_default_tuesday_to_saturday() {
        let p = Policy::default();
        // 2025-10-10 is a Friday
        assert!(p.is_business_day(d(2025, 10, 10)));
        assert!(p.is_business_day(d(2025, 10, 11)));
        assert!(!p.is_business_day(d(2025, 10, 12)));
        assert!(!p.is_business_day(d(2025, 10, 13)));
        assert!(p.is_business_day(d(2025, 10, 14)));
    }

    #[test]
    fn hours_until_is_signed() {
        let now = at(2025, 10, 10, 11, 0);
        let t = SlotTime::from_hm(14, 0).unwrap();
        assert_eq!(hours_until(d(2025, 10, 10), t, now), 3.0);
        let t = SlotTime::from_hm(10, 30).unwrap();
        assert_eq!(hours_until(d(2025, 10, 10), t, now), -0.5);
    }

    #[test]
    fn local_time_round_trips_through_offset() {
        let p = Policy::default();
        let local = at(2025, 10, 10, 11, 0);
        let ms = p.to_instant(local);
        // 11:00 at UTC-3 is 14:00 UTC
        let utc = DateTime::from_timestamp_millis(ms).unwrap().naive_utc();
        assert_eq!(utc, at(2025, 10, 10, 14, 0));
        assert_eq!(p.local_time(ms), local);
    }

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::seconds(2));
        assert_eq!(clock.now_ms(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn validate_rejects_bad_combinations() {
        assert!(Policy::default().validate().is_ok());

        let p = Policy { open_hour: 18, close_hour: 9, ..Policy::default() };
        assert!(p.validate().is_err());
        let p = Policy { slot_minutes: 0, ..Policy::default() };
        assert!(p.validate().is_err());
        let p = Policy { open_weekdays: vec![], ..Policy::default() };
        assert!(p.validate().is_err());
        let p = Policy { booking_horizon_days: MAX_HORIZON_DAYS + 1, ..Policy::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn malformed_inputs_are_invalid_argument() {
        assert!(matches!(parse_date("2025/10/10"), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(parse_time("2pm"), Err(EngineError::InvalidArgument(_))));
        assert_eq!(parse_time("14:00").unwrap(), SlotTime::from_hm(14, 0).unwrap());
    }
}

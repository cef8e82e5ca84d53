use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};

use super::*;
use crate::cache::OccupiedSlots;

/// One day of the monthly calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayOccupancy {
    pub date: NaiveDate,
    pub booked: u32,
    pub capacity: u32,
}

impl Engine {
    fn occupied_on(&self, date: NaiveDate) -> OccupiedSlots {
        if let Some(hit) = self.cache.get(date) {
            return hit;
        }
        let seen = self.ledger.version();
        let occupied: BTreeSet<SlotTime> = self
            .ledger
            .query::<Appointment>(|a| a.is_confirmed() && a.slot.date == date)
            .into_iter()
            .map(|a| a.slot.start)
            .collect();
        let occupied = Arc::new(occupied);
        self.remember_day(date, occupied.clone(), seen);
        occupied
    }

    /// Cache a day read at ledger version `seen`, unless a commit landed since:
    /// its invalidation may already have run, and the view would outlive it.
    pub(super) fn remember_day(&self, date: NaiveDate, occupied: OccupiedSlots, seen: u64) {
        if self.ledger.version() == seen {
            self.cache.put(date, occupied);
        }
    }

    /// Start times still free on `date`. Empty for closed, blocked, past or
    /// out-of-horizon days. Read-side only: booking re-checks in the ledger.
    pub fn list_available_slots(&self, date: NaiveDate) -> Vec<SlotTime> {
        let now = self.local_now();
        if date < now.date()
            || !self.policy.is_business_day(date)
            || !policy::is_within_booking_horizon(date, now, self.policy.booking_horizon_days)
            || !self.ledger.query::<BlockedDate>(|b| b.date == date).is_empty()
        {
            return Vec::new();
        }
        let occupied = self.occupied_on(date);
        self.policy
            .slot_grid()
            .into_iter()
            .filter(|t| !occupied.contains(t))
            .filter(|t| Slot::new(date, *t).starts_at() > now)
            .collect()
    }

    /// The owner's confirmed appointments from today on, soonest first.
    pub fn list_active_appointments(&self, owner_id: &str) -> Vec<Appointment> {
        let today = self.local_now().date();
        let mut out = self.ledger.query::<Appointment>(|a| {
            a.owner_id == owner_id && a.is_confirmed() && a.slot.date >= today
        });
        out.sort_by_key(|a| a.slot);
        out
    }

    pub fn list_waitlist(&self, owner_id: &str) -> Vec<WaitlistEntry> {
        self.waitlist.list_for(owner_id)
    }

    /// Operator agenda: every appointment on `date` in any status, by start time.
    pub fn list_day(&self, date: NaiveDate) -> Vec<Appointment> {
        let mut out = self.ledger.query::<Appointment>(|a| a.slot.date == date);
        out.sort_by_key(|a| (a.slot.start, a.created_at));
        out
    }

    /// Confirmed counts for each business day of a month.
    pub fn month_occupancy(&self, year: i32, month: u32) -> Result<Vec<DayOccupancy>, EngineError> {
        let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return Err(EngineError::InvalidArgument(format!(
                "no such month {year}-{month:02}"
            )));
        };

        let counts = match self.cache.get_month(year, month) {
            Some(hit) => hit,
            None => {
                let seen = self.ledger.version();
                let mut per_day: BTreeMap<NaiveDate, u32> = BTreeMap::new();
                for a in self.ledger.query::<Appointment>(|a| {
                    a.is_confirmed() && a.slot.date.year() == year && a.slot.date.month() == month
                }) {
                    *per_day.entry(a.slot.date).or_default() += 1;
                }
                let counts = Arc::new(per_day.into_iter().collect::<Vec<_>>());
                if self.ledger.version() == seen {
                    self.cache.put_month(year, month, counts.clone());
                }
                counts
            }
        };

        let capacity = self.policy.slot_grid().len() as u32;
        Ok(first
            .iter_days()
            .take_while(|d| d.month() == month)
            .filter(|d| self.policy.is_business_day(*d))
            .map(|date| DayOccupancy {
                date,
                booked: counts
                    .iter()
                    .find(|(d, _)| *d == date)
                    .map(|(_, n)| *n)
                    .unwrap_or(0),
                capacity,
            })
            .collect())
    }

    pub fn list_blocked_dates(&self) -> Vec<BlockedDate> {
        let mut out = self.ledger.query::<BlockedDate>(|_| true);
        out.sort_by_key(|b| b.date);
        out
    }

    /// Whole catalog, retired services included.
    pub fn list_services(&self) -> Vec<Service> {
        self.ledger.query::<Service>(|_| true)
    }

    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.ledger.get::<Appointment>(id)
    }
}

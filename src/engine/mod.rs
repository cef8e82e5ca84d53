mod admin;
mod booking;
mod error;
mod queries;

pub use error::{DateRejection, EngineError};
pub use queries::DayOccupancy;

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::ledger::{Ledger, Txn};
use crate::limits::*;
use crate::model::*;
use crate::notify::{NotificationDispatcher, Notice, Outbox};
use crate::observability;
use crate::policy::{self, Clock, Policy};
use crate::waitlist::WaitlistCoordinator;

/// One shop's reservation engine: the ledger, the rules, and the side-effect plumbing.
pub struct Engine {
    pub(crate) ledger: Arc<Ledger>,
    pub policy: Policy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache: AvailabilityCache,
    pub waitlist: WaitlistCoordinator,
    outbox: Outbox,
    /// Freed slots whose waitlist promotion failed. Drained by the sweeper.
    pending_promotions: Mutex<VecDeque<Slot>>,
}

impl Engine {
    /// Replay the shop's ledger and start its WAL writer and notice dispatcher.
    pub fn new(
        wal_path: &Path,
        policy: Policy,
        cache_ttl: Duration,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> io::Result<Self> {
        policy
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ledger = Arc::new(Ledger::open(wal_path)?);
        let (outbox, _dispatcher) = Outbox::spawn(dispatcher);
        Ok(Self {
            waitlist: WaitlistCoordinator::new(ledger.clone(), clock.clone()),
            cache: AvailabilityCache::new(cache_ttl, clock.clone()),
            ledger,
            policy,
            clock,
            outbox,
            pending_promotions: Mutex::new(VecDeque::new()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn local_now(&self) -> NaiveDateTime {
        self.policy.local_now(self.clock.as_ref())
    }

    fn post(&self, notice: Notice) {
        self.outbox.post(notice);
    }

    /// Reject slots that cannot take a new booking right now.
    fn check_bookable(&self, slot: &Slot, now: NaiveDateTime) -> Result<(), EngineError> {
        let reject = |reason| EngineError::InvalidDate {
            date: slot.date,
            reason,
        };
        let today = now.date();
        if slot.date < today {
            return Err(reject(DateRejection::Past));
        }
        if slot.starts_at() <= now {
            return Err(reject(DateRejection::AlreadyStarted));
        }
        if !self.policy.is_business_day(slot.date) {
            return Err(reject(DateRejection::ClosedWeekday));
        }
        if !policy::is_within_booking_horizon(slot.date, now, self.policy.booking_horizon_days) {
            return Err(reject(DateRejection::BeyondHorizon));
        }
        Ok(())
    }

    /// Service lookup for a new booking or waitlist entry.
    fn active_service(&self, service_id: &str) -> Result<Service, EngineError> {
        match self.ledger.get::<Service>(&service_id.to_string()) {
            Some(s) if s.active => Ok(s),
            _ => Err(EngineError::UnknownService(service_id.to_string())),
        }
    }

    // ── Waitlist façade ──────────────────────────────────────────

    pub async fn enroll(
        &self,
        id: Ulid,
        waiter: &Owner,
        slot: Slot,
        service_id: &str,
    ) -> Result<Ulid, EngineError> {
        validate_owner(waiter)?;
        self.policy.check_on_grid(&slot)?;
        self.check_bookable(&slot, self.local_now())?;
        let service = self.active_service(service_id)?;
        self.waitlist.enroll(id, waiter, slot, &service).await
    }

    pub async fn withdraw(&self, id: Ulid, caller_id: &str) -> Result<(), EngineError> {
        self.waitlist.withdraw(id, caller_id).await
    }

    /// Offer a freed slot to its waitlist. On failure the slot is queued for the sweeper.
    async fn offer_freed_slot(&self, slot: Slot) {
        match self.waitlist.promote_next(slot).await {
            Ok(Some(entry)) => {
                metrics::counter!(observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
                self.post(Notice::WaitlistPromoted { entry });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%slot, "waitlist promotion failed, queued for retry: {e}");
                self.queue_promotion(slot).await;
            }
        }
    }

    async fn queue_promotion(&self, slot: Slot) {
        let mut pending = self.pending_promotions.lock().await;
        if pending.len() >= MAX_PENDING_PROMOTIONS
            && let Some(dropped) = pending.pop_front()
        {
            warn!(slot = %dropped, "pending promotion queue full, dropping oldest");
        }
        pending.push_back(slot);
        metrics::gauge!(observability::PENDING_PROMOTIONS).set(pending.len() as f64);
    }

    pub async fn pending_promotion_count(&self) -> usize {
        self.pending_promotions.lock().await.len()
    }

    /// Re-attempt queued promotions. Returns how many went through.
    pub async fn retry_pending_promotions(&self) -> usize {
        let slots: Vec<Slot> = self.pending_promotions.lock().await.drain(..).collect();
        let mut done = 0;
        for slot in slots {
            match self.waitlist.promote_next(slot).await {
                Ok(promoted) => {
                    done += 1;
                    if let Some(entry) = promoted {
                        metrics::counter!(observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
                        self.post(Notice::WaitlistPromoted { entry });
                    }
                }
                Err(e) => {
                    warn!(%slot, "promotion retry failed: {e}");
                    self.queue_promotion(slot).await;
                }
            }
        }
        let left = self.pending_promotion_count().await;
        metrics::gauge!(observability::PENDING_PROMOTIONS).set(left as f64);
        done
    }

    /// Post a reminder for every confirmed appointment starting within the reminder window.
    pub async fn send_due_reminders(&self) -> Result<usize, EngineError> {
        let now = self.local_now();
        let window = self.policy.reminder_lead_hours as f64;
        let due = self.ledger.query::<Appointment>(|a| {
            let h = policy::hours_until(a.slot.date, a.slot.start, now);
            a.is_confirmed() && a.reminded_at.is_none() && h > 0.0 && h <= window
        });

        let stamp = self.now();
        let mut sent = 0;
        for a in due {
            let id = a.id;
            let marked = self
                .ledger
                .atomic(|txn| {
                    let Some(current) = txn.get::<Appointment>(&id) else {
                        return Ok::<_, EngineError>(None);
                    };
                    if !current.is_confirmed() || current.reminded_at.is_some() {
                        return Ok(None);
                    }
                    let reminded = Appointment {
                        reminded_at: Some(stamp),
                        ..current
                    };
                    txn.put(reminded.clone());
                    Ok(Some(reminded))
                })
                .await?;
            if let Some(appointment) = marked {
                sent += 1;
                self.post(Notice::Reminder { appointment });
            }
        }
        if sent > 0 {
            metrics::counter!(observability::REMINDERS_TOTAL).increment(sent as u64);
            info!(sent, "reminders posted");
        }
        Ok(sent)
    }

    pub async fn compact(&self) -> Result<(), EngineError> {
        self.ledger.compact().await?;
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.ledger.appends_since_compact().await
    }
}

/// Confirmed appointments holding `slot`, as seen by `txn`.
fn holders(txn: &mut Txn<'_>, slot: Slot) -> Vec<Appointment> {
    txn.query::<Appointment>(move |a| a.occupies(&slot))
}

fn is_blocked(txn: &mut Txn<'_>, date: NaiveDate) -> bool {
    !txn.query::<BlockedDate>(move |b| b.date == date).is_empty()
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_owner(owner: &Owner) -> Result<(), EngineError> {
    check_len(&owner.id, MAX_OWNER_ID_LEN, "owner id too long")?;
    check_len(&owner.name, MAX_NAME_LEN, "name too long")?;
    check_len(&owner.email, MAX_EMAIL_LEN, "email too long")?;
    if owner.id.trim().is_empty() {
        return Err(EngineError::InvalidArgument("owner id is required".into()));
    }
    if owner.name.trim().is_empty() {
        return Err(EngineError::InvalidArgument("name is required".into()));
    }
    if !is_plausible_email(owner.email.trim()) {
        return Err(EngineError::InvalidArgument(format!(
            "{:?} is not a valid email address",
            owner.email
        )));
    }
    Ok(())
}

/// `local@domain.tld`, no whitespace, TLD of two or more characters.
fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && tld.chars().count() >= 2,
        None => false,
    }
}

use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::ledger::Ledger;
use crate::model::*;
use crate::policy::Clock;

/// Waitlist bookkeeping for taken slots.
///
/// Promotion marks exactly one waiter per freed slot: the FIFO query is part of
/// the promoting transaction's read set, so a racing promotion for the same slot
/// either sees the first one's write or is forced to re-run.
pub struct WaitlistCoordinator {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
}

impl WaitlistCoordinator {
    pub fn new(ledger: Arc<Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// Put `waiter` in line for `slot`. The slot must currently be taken.
    pub async fn enroll(
        &self,
        id: Ulid,
        waiter: &Owner,
        slot: Slot,
        service: &Service,
    ) -> Result<Ulid, EngineError> {
        let now = self.clock.now_ms();
        let entry = WaitlistEntry {
            id,
            waiter_id: waiter.id.clone(),
            waiter_name: waiter.name.trim().to_string(),
            waiter_email: waiter.email.trim().to_string(),
            slot,
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            notified: false,
            created_at: now,
            notified_at: None,
        };

        self.ledger
            .atomic(|txn| {
                if txn.get::<WaitlistEntry>(&id).is_some() {
                    return Err(EngineError::AlreadyExists(id));
                }
                let waiter_id = entry.waiter_id.clone();
                let waiting = txn.query::<WaitlistEntry>(move |e| {
                    e.slot == slot && e.waiter_id == waiter_id && !e.notified
                });
                if !waiting.is_empty() {
                    return Err(EngineError::AlreadyEnrolled(slot));
                }
                if txn.query::<Appointment>(move |a| a.occupies(&slot)).is_empty() {
                    return Err(EngineError::InvalidArgument(format!(
                        "slot {slot} is free, book it instead"
                    )));
                }
                txn.put(entry.clone());
                Ok(())
            })
            .await?;

        info!(%id, waiter = %waiter.id, %slot, "waitlist enrolled");
        Ok(id)
    }

    /// Notify the longest-waiting entry for `slot`, if any.
    pub async fn promote_next(&self, slot: Slot) -> Result<Option<WaitlistEntry>, EngineError> {
        let now = self.clock.now_ms();
        let promoted = self
            .ledger
            .atomic(|txn| {
                let waiting = txn.query::<WaitlistEntry>(move |e| e.slot == slot && !e.notified);
                let Some(first) = waiting.into_iter().min_by_key(|e| (e.created_at, e.id)) else {
                    return Ok::<_, EngineError>(None);
                };
                let entry = WaitlistEntry {
                    notified: true,
                    notified_at: Some(now),
                    ..first
                };
                txn.put(entry.clone());
                Ok(Some(entry))
            })
            .await?;

        match &promoted {
            Some(e) => info!(id = %e.id, waiter = %e.waiter_id, %slot, "waitlist promoted"),
            None => debug!(%slot, "freed slot has no waiters"),
        }
        Ok(promoted)
    }

    /// Remove an entry. Absent entries are a no-op.
    pub async fn withdraw(&self, id: Ulid, caller_id: &str) -> Result<(), EngineError> {
        let removed = self
            .ledger
            .atomic(|txn| {
                let Some(entry) = txn.get::<WaitlistEntry>(&id) else {
                    return Ok(false);
                };
                if entry.waiter_id != caller_id {
                    return Err(EngineError::Forbidden(id));
                }
                txn.delete::<WaitlistEntry>(id);
                Ok(true)
            })
            .await?;
        if removed {
            info!(%id, "waitlist entry withdrawn");
        } else {
            debug!(%id, "withdraw of absent entry");
        }
        Ok(())
    }

    /// Entries of one waiter, oldest first.
    pub fn list_for(&self, waiter_id: &str) -> Vec<WaitlistEntry> {
        let mut entries = self.ledger.query::<WaitlistEntry>(|e| e.waiter_id == waiter_id);
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }
}

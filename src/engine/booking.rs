use tracing::{debug, info};
use ulid::Ulid;

use super::*;

impl Engine {
    /// Reserve `slot` for `owner`. The slot check, the owner's active count and
    /// the insert commit together, so no slot is ever confirmed twice.
    pub async fn book(
        &self,
        id: Ulid,
        owner: &Owner,
        slot: Slot,
        service_id: &str,
    ) -> Result<Ulid, EngineError> {
        validate_owner(owner)?;
        check_len(service_id, MAX_SERVICE_ID_LEN, "service id too long")?;
        self.policy.check_on_grid(&slot)?;
        let now = self.local_now();
        self.check_bookable(&slot, now)?;

        let today = now.date();
        let limit = self.policy.max_active_per_owner;
        let created_at = self.now();

        let result = self
            .ledger
            .atomic(|txn| {
                if txn.get::<Appointment>(&id).is_some() {
                    return Err(EngineError::AlreadyExists(id));
                }
                let service = match txn.get::<Service>(&service_id.to_string()) {
                    Some(s) if s.active => s,
                    _ => return Err(EngineError::UnknownService(service_id.to_string())),
                };
                if is_blocked(txn, slot.date) {
                    return Err(EngineError::InvalidDate {
                        date: slot.date,
                        reason: DateRejection::Blocked,
                    });
                }
                let owner_id = owner.id.clone();
                let active = txn
                    .query::<Appointment>(move |a| {
                        a.owner_id == owner_id && a.is_confirmed() && a.slot.date >= today
                    })
                    .len();
                if active >= limit as usize {
                    return Err(EngineError::ActiveLimitExceeded {
                        owner_id: owner.id.clone(),
                        limit,
                    });
                }
                if !holders(txn, slot).is_empty() {
                    return Err(EngineError::SlotTaken(slot));
                }

                let mut client = txn
                    .get::<ClientRecord>(&owner.id)
                    .unwrap_or_else(|| ClientRecord::new(owner.id.clone()));
                client.bookings_made += 1;
                txn.put(client);

                let appointment = Appointment {
                    id,
                    owner_id: owner.id.clone(),
                    owner_name: owner.name.trim().to_string(),
                    owner_email: owner.email.trim().to_string(),
                    slot,
                    service: service.snapshot(),
                    status: AppointmentStatus::Confirmed,
                    created_at,
                    cancelled_at: None,
                    cancelled_by: None,
                    modification_count: 0,
                    previous_slot: None,
                    reminded_at: None,
                };
                txn.put(appointment.clone());
                Ok(appointment)
            })
            .await;

        let appointment = match result {
            Ok(a) => a,
            Err(e) => {
                if let EngineError::SlotTaken(_) = e {
                    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        self.cache.invalidate_all();
        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!(%id, owner = %owner.id, %slot, service = %appointment.service.service_id, "booked");
        self.post(Notice::BookingConfirmed { appointment });
        Ok(id)
    }

    /// Cancel an appointment and offer its slot to the waitlist.
    ///
    /// Clients may only cancel their own appointments and only with enough
    /// notice; operators may cancel anything. Cancelling twice is a no-op.
    pub async fn cancel(&self, id: Ulid, caller_id: &str, actor: Actor) -> Result<(), EngineError> {
        let now = self.local_now();
        let stamp = self.now();
        let lead = self.policy.cancel_lead_hours;

        let cancelled = self
            .ledger
            .atomic(|txn| {
                let Some(appt) = txn.get::<Appointment>(&id) else {
                    return Err(EngineError::NotFound(id));
                };
                if actor == Actor::Client && appt.owner_id != caller_id {
                    return Err(EngineError::Forbidden(id));
                }
                match appt.status {
                    AppointmentStatus::Cancelled => return Ok(None),
                    AppointmentStatus::Completed => {
                        return Err(EngineError::InvalidState {
                            id,
                            status: appt.status,
                        });
                    }
                    AppointmentStatus::Confirmed => {}
                }
                if actor == Actor::Client {
                    let hours_left = policy::hours_until(appt.slot.date, appt.slot.start, now);
                    if hours_left < lead as f64 {
                        return Err(EngineError::LeadTimeViolation {
                            id,
                            required_hours: lead,
                            hours_left,
                        });
                    }
                }
                let cancelled = Appointment {
                    status: AppointmentStatus::Cancelled,
                    cancelled_at: Some(stamp),
                    cancelled_by: Some(actor),
                    ..appt
                };
                txn.put(cancelled.clone());
                Ok(Some(cancelled))
            })
            .await?;

        let Some(appointment) = cancelled else {
            debug!(%id, "cancel of already-cancelled appointment");
            return Ok(());
        };

        self.cache.invalidate_all();
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "actor" => actor.as_str()).increment(1);
        info!(%id, by = actor.as_str(), slot = %appointment.slot, "cancelled");
        let slot = appointment.slot;
        self.post(Notice::BookingCancelled { appointment, actor });
        if slot.starts_at() > now {
            self.offer_freed_slot(slot).await;
        }
        Ok(())
    }

    /// Move a confirmed appointment to `new_slot`. Returns the updated appointment.
    pub async fn modify(
        &self,
        id: Ulid,
        caller_id: &str,
        new_slot: Slot,
    ) -> Result<Appointment, EngineError> {
        self.policy.check_on_grid(&new_slot)?;
        let now = self.local_now();
        let lead = self.policy.modify_lead_hours;
        let max = self.policy.max_modifications;

        let result = self
            .ledger
            .atomic(|txn| {
                let Some(appt) = txn.get::<Appointment>(&id) else {
                    return Err(EngineError::NotFound(id));
                };
                if appt.owner_id != caller_id {
                    return Err(EngineError::Forbidden(id));
                }
                if !appt.is_confirmed() {
                    return Err(EngineError::InvalidState {
                        id,
                        status: appt.status,
                    });
                }
                if appt.modification_count >= max {
                    return Err(EngineError::ModificationLimitExceeded { id, limit: max });
                }
                let hours_left = policy::hours_until(appt.slot.date, appt.slot.start, now);
                if hours_left < lead as f64 {
                    return Err(EngineError::LeadTimeViolation {
                        id,
                        required_hours: lead,
                        hours_left,
                    });
                }
                if new_slot == appt.slot {
                    return Err(EngineError::InvalidArgument(format!(
                        "appointment {id} is already at {new_slot}"
                    )));
                }
                self.check_bookable(&new_slot, now)?;
                if is_blocked(txn, new_slot.date) {
                    return Err(EngineError::InvalidDate {
                        date: new_slot.date,
                        reason: DateRejection::Blocked,
                    });
                }
                if holders(txn, new_slot).iter().any(|a| a.id != id) {
                    return Err(EngineError::SlotTaken(new_slot));
                }

                let old = appt.slot;
                let moved = Appointment {
                    slot: new_slot,
                    previous_slot: Some(old),
                    modification_count: appt.modification_count + 1,
                    reminded_at: None,
                    ..appt
                };
                txn.put(moved.clone());
                Ok((moved, old))
            })
            .await;

        let (appointment, old) = match result {
            Ok(r) => r,
            Err(e) => {
                if let EngineError::SlotTaken(_) = e {
                    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        self.cache.invalidate_all();
        metrics::counter!(observability::MODIFICATIONS_TOTAL).increment(1);
        info!(%id, from = %old, to = %new_slot, count = appointment.modification_count, "modified");
        self.post(Notice::BookingModified {
            appointment: appointment.clone(),
            from: old,
        });
        self.offer_freed_slot(old).await;
        Ok(appointment)
    }
}

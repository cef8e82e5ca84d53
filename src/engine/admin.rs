use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use super::*;

impl Engine {
    /// Load the default catalog into a shop that has no services yet.
    pub async fn seed_catalog(&self) -> Result<(), EngineError> {
        let seeded = self
            .ledger
            .atomic(|txn| {
                if !txn.query::<Service>(|_| true).is_empty() {
                    return Ok::<_, EngineError>(false);
                }
                for service in default_services() {
                    txn.put(service);
                }
                Ok(true)
            })
            .await?;
        if seeded {
            info!("seeded default service catalog");
        }
        Ok(())
    }

    /// Close `date` to new bookings. Existing appointments are left alone.
    /// Blocking an already-blocked date returns the existing block's id.
    pub async fn block_date(&self, id: Ulid, date: NaiveDate, reason: &str) -> Result<Ulid, EngineError> {
        check_len(reason, MAX_REASON_LEN, "reason too long")?;
        let blocked_at = self.now();
        let reason = reason.trim().to_string();

        let block_id = self
            .ledger
            .atomic(|txn| {
                if txn.get::<BlockedDate>(&id).is_some() {
                    return Err(EngineError::AlreadyExists(id));
                }
                if let Some(existing) = txn.query::<BlockedDate>(move |b| b.date == date).first() {
                    return Ok(existing.id);
                }
                txn.put(BlockedDate {
                    id,
                    date,
                    reason: reason.clone(),
                    blocked_at,
                });
                Ok(id)
            })
            .await?;

        self.cache.invalidate_all();
        info!(id = %block_id, %date, "date blocked");
        Ok(block_id)
    }

    pub async fn unblock_date(&self, id: Ulid) -> Result<(), EngineError> {
        let date = self
            .ledger
            .atomic(|txn| {
                let Some(block) = txn.get::<BlockedDate>(&id) else {
                    return Err(EngineError::NotFound(id));
                };
                txn.delete::<BlockedDate>(id);
                Ok(block.date)
            })
            .await?;

        self.cache.invalidate_all();
        info!(%id, %date, "date unblocked");
        Ok(())
    }

    /// Create or replace a catalog entry. Existing appointments keep their snapshot.
    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        check_len(&service.id, MAX_SERVICE_ID_LEN, "service id too long")?;
        check_len(&service.name, MAX_NAME_LEN, "service name too long")?;
        if service.id.is_empty()
            || !service
                .id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(EngineError::InvalidArgument(format!(
                "service id {:?} must be a lowercase slug",
                service.id
            )));
        }
        if service.name.trim().is_empty() {
            return Err(EngineError::InvalidArgument("service name is required".into()));
        }
        if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::InvalidArgument(format!(
                "duration must be 1..={MAX_SERVICE_DURATION_MINUTES} minutes"
            )));
        }
        if service.price > MAX_SERVICE_PRICE {
            return Err(EngineError::InvalidArgument(format!(
                "price must be at most {MAX_SERVICE_PRICE}"
            )));
        }

        let id = service.id.clone();
        self.ledger.set(service).await?;
        info!(service = %id, "service saved");
        Ok(())
    }

    /// Take a service off the menu. Idempotent.
    pub async fn retire_service(&self, service_id: &str) -> Result<(), EngineError> {
        let retired = self
            .ledger
            .update::<Service>(&service_id.to_string(), |s| s.active = false)
            .await?;
        if retired.is_none() {
            return Err(EngineError::UnknownService(service_id.to_string()));
        }
        info!(service = %service_id, "service retired");
        Ok(())
    }

    /// Mark a confirmed appointment as served. Only once it has started.
    pub async fn complete(&self, id: Ulid) -> Result<(), EngineError> {
        let now = self.local_now();
        self.ledger
            .atomic(|txn| {
                let Some(appt) = txn.get::<Appointment>(&id) else {
                    return Err(EngineError::NotFound(id));
                };
                match appt.status {
                    AppointmentStatus::Completed => return Ok(()),
                    AppointmentStatus::Cancelled => {
                        return Err(EngineError::InvalidState {
                            id,
                            status: appt.status,
                        });
                    }
                    AppointmentStatus::Confirmed => {}
                }
                if appt.slot.starts_at() > now {
                    return Err(EngineError::InvalidArgument(format!(
                        "appointment {id} has not started yet"
                    )));
                }
                txn.put(Appointment {
                    status: AppointmentStatus::Completed,
                    ..appt
                });
                Ok(())
            })
            .await?;
        self.cache.invalidate_all();
        info!(%id, "completed");
        Ok(())
    }
}

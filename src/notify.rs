use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{Actor, Appointment, Slot, WaitlistEntry};
use crate::observability;

/// Something worth telling a client about. Posted after the ledger commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    BookingConfirmed {
        appointment: Appointment,
    },
    BookingCancelled {
        appointment: Appointment,
        actor: Actor,
    },
    BookingModified {
        appointment: Appointment,
        from: Slot,
    },
    WaitlistPromoted {
        entry: WaitlistEntry,
    },
    Reminder {
        appointment: Appointment,
    },
}

impl Notice {
    pub fn label(&self) -> &'static str {
        match self {
            Notice::BookingConfirmed { .. } => "booking_confirmed",
            Notice::BookingCancelled { .. } => "booking_cancelled",
            Notice::BookingModified { .. } => "booking_modified",
            Notice::WaitlistPromoted { .. } => "waitlist_promoted",
            Notice::Reminder { .. } => "reminder",
        }
    }
}

#[derive(Debug)]
pub struct DispatchError(pub String);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Delivery channel to clients (email, push, ...). Implementations live outside the engine.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify_booking_confirmed(&self, appointment: &Appointment) -> Result<(), DispatchError>;

    async fn notify_booking_cancelled(
        &self,
        appointment: &Appointment,
        actor: Actor,
    ) -> Result<(), DispatchError>;

    async fn notify_waitlist_promoted(&self, entry: &WaitlistEntry) -> Result<(), DispatchError>;

    async fn notify_booking_modified(
        &self,
        _appointment: &Appointment,
        _from: Slot,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn notify_reminder(&self, _appointment: &Appointment) -> Result<(), DispatchError> {
        Ok(())
    }
}

async fn deliver(dispatcher: &dyn NotificationDispatcher, notice: &Notice) -> Result<(), DispatchError> {
    match notice {
        Notice::BookingConfirmed { appointment } => {
            dispatcher.notify_booking_confirmed(appointment).await
        }
        Notice::BookingCancelled { appointment, actor } => {
            dispatcher.notify_booking_cancelled(appointment, *actor).await
        }
        Notice::BookingModified { appointment, from } => {
            dispatcher.notify_booking_modified(appointment, *from).await
        }
        Notice::WaitlistPromoted { entry } => dispatcher.notify_waitlist_promoted(entry).await,
        Notice::Reminder { appointment } => dispatcher.notify_reminder(appointment).await,
    }
}

/// Fire-and-forget queue between the engine and the dispatcher worker.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Outbox {
    /// Create an outbox and start the worker that drains it into `dispatcher`.
    pub fn spawn(dispatcher: Arc<dyn NotificationDispatcher>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_dispatcher(rx, dispatcher));
        (Self { tx }, handle)
    }

    /// Never blocks and never fails the caller.
    pub fn post(&self, notice: Notice) {
        if let Err(e) = self.tx.send(notice) {
            debug!(notice = e.0.label(), "outbox closed, notice dropped");
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Notice>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) {
    while let Some(notice) = rx.recv().await {
        if let Err(e) = deliver(dispatcher.as_ref(), &notice).await {
            metrics::counter!(observability::NOTIFY_FAILURES_TOTAL, "notice" => notice.label())
                .increment(1);
            warn!(notice = notice.label(), "{e}");
        }
    }
}

/// Writes each notice to the log as one JSON line. The server's default dispatcher.
pub struct LogDispatcher;

impl LogDispatcher {
    fn emit(notice: Notice) -> Result<(), DispatchError> {
        let json = serde_json::to_string(&notice).map_err(|e| DispatchError(e.to_string()))?;
        info!(target: "chairbook::notice", "{json}");
        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify_booking_confirmed(&self, appointment: &Appointment) -> Result<(), DispatchError> {
        Self::emit(Notice::BookingConfirmed {
            appointment: appointment.clone(),
        })
    }

    async fn notify_booking_cancelled(
        &self,
        appointment: &Appointment,
        actor: Actor,
    ) -> Result<(), DispatchError> {
        Self::emit(Notice::BookingCancelled {
            appointment: appointment.clone(),
            actor,
        })
    }

    async fn notify_waitlist_promoted(&self, entry: &WaitlistEntry) -> Result<(), DispatchError> {
        Self::emit(Notice::WaitlistPromoted { entry: entry.clone() })
    }

    async fn notify_booking_modified(
        &self,
        appointment: &Appointment,
        from: Slot,
    ) -> Result<(), DispatchError> {
        Self::emit(Notice::BookingModified {
            appointment: appointment.clone(),
            from,
        })
    }

    async fn notify_reminder(&self, appointment: &Appointment) -> Result<(), DispatchError> {
        Self::emit(Notice::Reminder {
            appointment: appointment.clone(),
        })
    }
}

/// Captures notices in memory. For tests.
#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub notices: Mutex<Vec<Notice>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingDispatcher {
        fn push(&self, notice: Notice) -> Result<(), DispatchError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DispatchError("smtp down".into()));
            }
            self.notices.lock().unwrap().push(notice);
            Ok(())
        }

        pub fn labels(&self) -> Vec<&'static str> {
            self.notices.lock().unwrap().iter().map(Notice::label).collect()
        }

        /// Poll until at least `n` notices arrived or a second passed.
        pub async fn wait_for(&self, n: usize) -> Vec<Notice> {
            for _ in 0..100 {
                {
                    let got = self.notices.lock().unwrap();
                    if got.len() >= n {
                        return got.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn notify_booking_confirmed(&self, a: &Appointment) -> Result<(), DispatchError> {
            self.push(Notice::BookingConfirmed { appointment: a.clone() })
        }

        async fn notify_booking_cancelled(
            &self,
            a: &Appointment,
            actor: Actor,
        ) -> Result<(), DispatchError> {
            self.push(Notice::BookingCancelled { appointment: a.clone(), actor })
        }

        async fn notify_waitlist_promoted(&self, e: &WaitlistEntry) -> Result<(), DispatchError> {
            self.push(Notice::WaitlistPromoted { entry: e.clone() })
        }

        async fn notify_booking_modified(
            &self,
            a: &Appointment,
            from: Slot,
        ) -> Result<(), DispatchError> {
            self.push(Notice::BookingModified { appointment: a.clone(), from })
        }

        async fn notify_reminder(&self, a: &Appointment) -> Result<(), DispatchError> {
            self.push(Notice::Reminder { appointment: a.clone() })
        }
    }
}

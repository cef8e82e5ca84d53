use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;

/// Calendar days are `NaiveDate` everywhere; this is the one wire/text format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Start of a slot, in minutes after local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

impl SlotTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self((hour * 60 + minute) as u16))
        } else {
            None
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::from_hm(minutes / 60, minutes % 60)
    }

    /// Strict `HH:MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (h, m) = s.split_once(':')?;
        if h.len() != 2 || m.len() != 2 {
            return None;
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::from_hm(h.parse().ok()?, m.parse().ok()?)
    }

    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    pub fn to_naive_time(self) -> NaiveTime {
        // hour < 24 and minute < 60 by construction
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// A `(date, start)` pair on the grid: the unit of booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: SlotTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start: SlotTime) -> Self {
        Self { date, start }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start.to_naive_time())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format(DATE_FORMAT), self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }
}

/// Who is acting on an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    Client,
    Operator,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Actor::Client => "client",
            Actor::Operator => "operator",
        }
    }
}

/// Identity and contact details supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Owner {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Denormalized copy of a service taken at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service_id: String,
    pub name: String,
    pub duration_minutes: u32,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub duration_minutes: u32,
    pub price: u64,
    pub active: bool,
}

impl Service {
    pub fn new(id: &str, name: &str, duration_minutes: u32, price: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            duration_minutes,
            price,
            active: true,
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: self.id.clone(),
            name: self.name.clone(),
            duration_minutes: self.duration_minutes,
            price: self.price,
        }
    }
}

/// Catalog a new shop starts with.
pub fn default_services() -> Vec<Service> {
    vec![
        Service::new("corte", "Corte de Cabello", 30, 2000),
        Service::new("corte-barba", "Corte + Barba", 45, 2800),
        Service::new("color", "Coloración", 90, 5000),
        Service::new("alisado", "Alisado", 120, 8000),
        Service::new("tratamiento", "Tratamiento Capilar", 60, 3500),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub owner_id: String,
    pub owner_name: String,
    pub owner_email: String,
    pub slot: Slot,
    pub service: ServiceSnapshot,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<Actor>,
    pub modification_count: u32,
    /// Where the appointment sat before its last modification.
    pub previous_slot: Option<Slot>,
    pub reminded_at: Option<Ms>,
}

impl Appointment {
    pub fn is_confirmed(&self) -> bool {
        self.status == AppointmentStatus::Confirmed
    }

    /// True when this appointment holds `slot`.
    pub fn occupies(&self, slot: &Slot) -> bool {
        self.is_confirmed() && self.slot == *slot
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub waiter_id: String,
    pub waiter_name: String,
    pub waiter_email: String,
    pub slot: Slot,
    pub service_id: String,
    pub service_name: String,
    pub notified: bool,
    pub created_at: Ms,
    pub notified_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDate {
    pub id: Ulid,
    pub date: NaiveDate,
    pub reason: String,
    pub blocked_at: Ms,
}

/// Per-owner booking counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub bookings_made: u64,
}

impl ClientRecord {
    pub fn new(id: String) -> Self {
        Self { id, bookings_made: 0 }
    }
}

// ── Ledger records ───────────────────────────────────────────────

/// The ledger's collections. Declaration order is the commit lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    Appointments,
    Waitlist,
    BlockedDates,
    Services,
    Clients,
}

impl Collection {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Appointments => "appointments",
            Collection::Waitlist => "waitlist",
            Collection::BlockedDates => "blocked_dates",
            Collection::Services => "services",
            Collection::Clients => "clients",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Appointment(Appointment),
    Waitlist(WaitlistEntry),
    BlockedDate(BlockedDate),
    Service(Service),
    Client(ClientRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKey {
    Appointment(Ulid),
    Waitlist(Ulid),
    BlockedDate(Ulid),
    Service(String),
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    Put(Record),
    Remove(RecordKey),
}

impl Write {
    pub fn collection(&self) -> Collection {
        match self {
            Write::Put(Record::Appointment(_)) | Write::Remove(RecordKey::Appointment(_)) => {
                Collection::Appointments
            }
            Write::Put(Record::Waitlist(_)) | Write::Remove(RecordKey::Waitlist(_)) => {
                Collection::Waitlist
            }
            Write::Put(Record::BlockedDate(_)) | Write::Remove(RecordKey::BlockedDate(_)) => {
                Collection::BlockedDates
            }
            Write::Put(Record::Service(_)) | Write::Remove(RecordKey::Service(_)) => {
                Collection::Services
            }
            Write::Put(Record::Client(_)) | Write::Remove(RecordKey::Client(_)) => {
                Collection::Clients
            }
        }
    }
}

/// One committed transaction. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub version: u64,
    pub writes: Vec<Write>,
}

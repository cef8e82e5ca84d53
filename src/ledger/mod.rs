mod txn;

pub use txn::Txn;

use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_TXN_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

#[derive(Debug)]
pub enum LedgerError {
    /// Read set changed before commit. Retried by `atomic`.
    Conflict,
    Unavailable(String),
    /// Still conflicting after `MAX_TXN_ATTEMPTS` attempts.
    Contention,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Conflict => write!(f, "transaction conflict"),
            LedgerError::Unavailable(e) => write!(f, "ledger unavailable: {e}"),
            LedgerError::Contention => {
                write!(f, "transaction aborted after {MAX_TXN_ATTEMPTS} conflicting attempts")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

// ── Documents ────────────────────────────────────────────────────

/// A typed ledger collection member.
pub trait Document: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static;
    const COLLECTION: Collection;

    fn key(&self) -> Self::Key;
    fn table(ledger: &Ledger) -> &Table<Self>;
    fn into_record(self) -> Record;
    fn from_record(record: &Record) -> Option<&Self>;
    fn remove_key(key: Self::Key) -> RecordKey;
}

macro_rules! document {
    ($ty:ty, $key:ty, $coll:ident, $variant:ident, $field:ident, |$d:ident| $k:expr) => {
        impl Document for $ty {
            type Key = $key;
            const COLLECTION: Collection = Collection::$coll;

            fn key(&self) -> $key {
                let $d = self;
                $k
            }
            fn table(ledger: &Ledger) -> &Table<Self> {
                &ledger.$field
            }
            fn into_record(self) -> Record {
                Record::$variant(self)
            }
            fn from_record(record: &Record) -> Option<&Self> {
                match record {
                    Record::$variant(d) => Some(d),
                    _ => None,
                }
            }
            fn remove_key(key: $key) -> RecordKey {
                RecordKey::$variant(key)
            }
        }
    };
}

document!(Appointment, Ulid, Appointments, Appointment, appointments, |d| d.id);
document!(WaitlistEntry, Ulid, Waitlist, Waitlist, waitlist, |d| d.id);
document!(BlockedDate, Ulid, BlockedDates, BlockedDate, blocked_dates, |d| d.id);
document!(Service, String, Services, Service, services, |d| d.id.clone());
document!(ClientRecord, String, Clients, Client, clients, |d| d.id.clone());

#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// Version of the commit that last wrote this document.
    pub version: u64,
    pub doc: T,
}

pub struct Table<T: Document> {
    rows: DashMap<T::Key, Versioned<T>>,
}

impl<T: Document> Table<T> {
    fn new() -> Self {
        Self { rows: DashMap::new() }
    }

    pub fn get(&self, key: &T::Key) -> Option<Versioned<T>> {
        self.rows.get(key).map(|r| r.value().clone())
    }

    pub fn version_of(&self, key: &T::Key) -> Option<u64> {
        self.rows.get(key).map(|r| r.version)
    }

    /// Matching rows ordered by key.
    pub fn scan(&self, pred: &(dyn Fn(&T) -> bool + Send + Sync)) -> Vec<Versioned<T>> {
        let mut out: Vec<(T::Key, Versioned<T>)> = self
            .rows
            .iter()
            .filter(|r| pred(&r.value().doc))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.into_iter().map(|(_, v)| v).collect()
    }

    fn fingerprint(&self, pred: &(dyn Fn(&T) -> bool + Send + Sync)) -> Vec<(T::Key, u64)> {
        let mut out: Vec<(T::Key, u64)> = self
            .rows
            .iter()
            .filter(|r| pred(&r.value().doc))
            .map(|r| (r.key().clone(), r.version))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn put(&self, version: u64, doc: T) {
        self.rows.insert(doc.key(), Versioned { version, doc });
    }

    fn remove(&self, key: &T::Key) {
        self.rows.remove(key);
    }

    fn snapshot_into(&self, out: &mut Vec<Write>) {
        let mut docs: Vec<T> = self.rows.iter().map(|r| r.value().doc.clone()).collect();
        docs.sort_by_key(|d| d.key());
        out.extend(docs.into_iter().map(|d| Write::Put(d.into_record())));
    }
}

// ── Group-commit WAL channel ─────────────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then pays one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't ride along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Ledger ───────────────────────────────────────────────────────

/// Durable document store with optimistic multi-collection transactions.
///
/// Reads never lock. A transaction records what it read (point reads with the
/// version seen, and predicate queries with the exact rows matched) and buffers
/// its writes. At commit the commit locks of every touched collection are taken
/// in `Collection` order, the read set is re-checked against current state, and
/// only then is the commit logged and applied.
pub struct Ledger {
    pub(crate) appointments: Table<Appointment>,
    pub(crate) waitlist: Table<WaitlistEntry>,
    pub(crate) blocked_dates: Table<BlockedDate>,
    pub(crate) services: Table<Service>,
    pub(crate) clients: Table<ClientRecord>,
    version: AtomicU64,
    commit_locks: [Mutex<()>; 5],
    wal_tx: mpsc::Sender<WalCommand>,
    #[cfg(test)]
    fail_commits_to: std::sync::Mutex<Option<Collection>>,
}

impl Ledger {
    /// Replay the log at `path` and start its writer task. Needs a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let commits = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            appointments: Table::new(),
            waitlist: Table::new(),
            blocked_dates: Table::new(),
            services: Table::new(),
            clients: Table::new(),
            version: AtomicU64::new(0),
            commit_locks: Default::default(),
            wal_tx,
            #[cfg(test)]
            fail_commits_to: std::sync::Mutex::new(None),
        };

        let mut max_version = 0;
        for commit in commits {
            max_version = max_version.max(commit.version);
            for write in commit.writes {
                ledger.apply(commit.version, write);
            }
        }
        ledger.version.store(max_version, Ordering::SeqCst);
        debug!(path = %path.display(), version = max_version, "ledger replayed");
        Ok(ledger)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn apply(&self, version: u64, write: Write) {
        match write {
            Write::Put(Record::Appointment(d)) => self.appointments.put(version, d),
            Write::Put(Record::Waitlist(d)) => self.waitlist.put(version, d),
            Write::Put(Record::BlockedDate(d)) => self.blocked_dates.put(version, d),
            Write::Put(Record::Service(d)) => self.services.put(version, d),
            Write::Put(Record::Client(d)) => self.clients.put(version, d),
            Write::Remove(RecordKey::Appointment(k)) => self.appointments.remove(&k),
            Write::Remove(RecordKey::Waitlist(k)) => self.waitlist.remove(&k),
            Write::Remove(RecordKey::BlockedDate(k)) => self.blocked_dates.remove(&k),
            Write::Remove(RecordKey::Service(k)) => self.services.remove(&k),
            Write::Remove(RecordKey::Client(k)) => self.clients.remove(&k),
        }
    }

    async fn wal_append(&self, commit: Commit) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| LedgerError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    // ── Plain store operations ───────────────────────────────────

    pub fn get<T: Document>(&self, key: &T::Key) -> Option<T> {
        T::table(self).get(key).map(|v| v.doc)
    }

    pub fn query<T: Document>(&self, pred: impl Fn(&T) -> bool + Send + Sync) -> Vec<T> {
        T::table(self).scan(&pred).into_iter().map(|v| v.doc).collect()
    }

    pub async fn set<T: Document>(&self, doc: T) -> Result<(), LedgerError> {
        self.atomic(|txn| {
            txn.put(doc.clone());
            Ok::<_, LedgerError>(())
        })
        .await
    }

    /// Read-modify-write of one document. `None` when it does not exist.
    pub async fn update<T: Document>(
        &self,
        key: &T::Key,
        mut f: impl FnMut(&mut T) + Send,
    ) -> Result<Option<T>, LedgerError> {
        self.atomic(|txn| {
            let Some(mut doc) = txn.get::<T>(key) else {
                return Ok(None);
            };
            f(&mut doc);
            txn.put(doc.clone());
            Ok(Some(doc))
        })
        .await
    }

    pub async fn delete<T: Document>(&self, key: T::Key) -> Result<(), LedgerError> {
        self.atomic(|txn| {
            txn.delete::<T>(key.clone());
            Ok::<_, LedgerError>(())
        })
        .await
    }

    /// Run `f` as one optimistic transaction, re-running it on conflict.
    ///
    /// `f` must be free of side effects: it may run several times and only the
    /// last run's writes are committed. An `Err` from `f` aborts without writing.
    pub async fn atomic<R, E, F>(&self, mut f: F) -> Result<R, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<R, E> + Send,
        E: From<LedgerError>,
    {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let mut txn = Txn::new(self);
            let out = f(&mut txn)?;
            match self.commit(txn).await {
                Ok(()) => return Ok(out),
                Err(LedgerError::Conflict) => {
                    metrics::counter!(observability::LEDGER_CONFLICTS_TOTAL).increment(1);
                    debug!(attempt, "transaction conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts = MAX_TXN_ATTEMPTS, "transaction gave up under contention");
        Err(LedgerError::Contention.into())
    }

    async fn commit(&self, txn: Txn<'_>) -> Result<(), LedgerError> {
        let (reads, writes) = txn.into_parts();
        if writes.is_empty() {
            return Ok(());
        }

        let mut collections: Vec<Collection> = reads
            .iter()
            .map(|r| r.collection)
            .chain(writes.iter().map(Write::collection))
            .collect();
        collections.sort();
        collections.dedup();

        #[cfg(test)]
        {
            let failing = *self.fail_commits_to.lock().unwrap();
            if let Some(failing) = failing
                && writes.iter().any(|w| w.collection() == failing)
            {
                return Err(LedgerError::Unavailable(format!(
                    "injected failure on {}",
                    failing.as_str()
                )));
            }
        }

        let mut guards = Vec::with_capacity(collections.len());
        for c in &collections {
            guards.push(self.commit_locks[c.index()].lock().await);
        }

        if !reads.iter().all(|r| (r.still_valid)(self)) {
            return Err(LedgerError::Conflict);
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let commit = Commit { version, writes };
        self.wal_append(commit.clone()).await?;
        for write in commit.writes {
            self.apply(version, write);
        }
        metrics::counter!(observability::LEDGER_COMMITS_TOTAL).increment(1);
        Ok(())
    }

    /// Rewrite the log as a single snapshot commit. Blocks all commits while it runs.
    pub async fn compact(&self) -> Result<(), LedgerError> {
        let mut guards = Vec::with_capacity(self.commit_locks.len());
        for lock in &self.commit_locks {
            guards.push(lock.lock().await);
        }

        let mut writes = Vec::new();
        self.appointments.snapshot_into(&mut writes);
        self.waitlist.snapshot_into(&mut writes);
        self.blocked_dates.snapshot_into(&mut writes);
        self.services.snapshot_into(&mut writes);
        self.clients.snapshot_into(&mut writes);
        let snapshot = Commit {
            version: self.version(),
            writes,
        };

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| LedgerError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Make every later commit that writes `collection` fail as if the log were down.
    #[cfg(test)]
    pub(crate) fn fail_commits_to(&self, collection: Option<Collection>) {
        *self.fail_commits_to.lock().unwrap() = collection;
    }
}

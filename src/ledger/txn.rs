use std::sync::Arc;

use crate::model::{Collection, Write};

use super::{Document, Ledger};

pub(super) struct Read {
    pub(super) collection: Collection,
    pub(super) still_valid: Box<dyn Fn(&Ledger) -> bool + Send + Sync>,
}

/// One attempt of an optimistic transaction.
///
/// Reads go to committed state (overlaid with this transaction's own writes)
/// and are remembered for validation. Writes are buffered until commit.
pub struct Txn<'a> {
    ledger: &'a Ledger,
    reads: Vec<Read>,
    writes: Vec<Write>,
}

impl<'a> Txn<'a> {
    pub(super) fn new(ledger: &'a Ledger) -> Self {
        Self {
            ledger,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub(super) fn into_parts(self) -> (Vec<Read>, Vec<Write>) {
        (self.reads, self.writes)
    }

    pub fn get<T: Document>(&mut self, key: &T::Key) -> Option<T> {
        let table = T::table(self.ledger);
        let seen = table.get(key);
        let seen_version = seen.as_ref().map(|v| v.version);
        let k = key.clone();
        self.reads.push(Read {
            collection: T::COLLECTION,
            still_valid: Box::new(move |l| T::table(l).version_of(&k) == seen_version),
        });

        let mut doc = seen.map(|v| v.doc);
        let removed = T::remove_key(key.clone());
        for w in self.writes.iter().filter(|w| w.collection() == T::COLLECTION) {
            match w {
                Write::Put(rec) => {
                    if let Some(d) = T::from_record(rec)
                        && d.key() == *key
                    {
                        doc = Some(d.clone());
                    }
                }
                Write::Remove(rk) => {
                    if *rk == removed {
                        doc = None;
                    }
                }
            }
        }
        doc
    }

    /// All documents matching `pred`, ordered by key.
    ///
    /// The exact set of matching rows is part of the read set, so a concurrent
    /// commit that adds, removes, or changes a match aborts this transaction.
    pub fn query<T: Document>(
        &mut self,
        pred: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Vec<T> {
        let pred = Arc::new(pred);
        let table = T::table(self.ledger);
        let rows = table.scan(pred.as_ref());
        let seen: Vec<(T::Key, u64)> = rows.iter().map(|v| (v.doc.key(), v.version)).collect();

        let check = pred.clone();
        self.reads.push(Read {
            collection: T::COLLECTION,
            still_valid: Box::new(move |l| T::table(l).fingerprint(check.as_ref()) == seen),
        });

        let mut docs: Vec<T> = rows.into_iter().map(|v| v.doc).collect();
        for w in self.writes.iter().filter(|w| w.collection() == T::COLLECTION) {
            match w {
                Write::Put(rec) => {
                    if let Some(d) = T::from_record(rec) {
                        let key = d.key();
                        docs.retain(|x| x.key() != key);
                        if (*pred)(d) {
                            docs.push(d.clone());
                        }
                    }
                }
                Write::Remove(rk) => docs.retain(|x| T::remove_key(x.key()) != *rk),
            }
        }
        docs.sort_by_key(|d| d.key());
        docs
    }

    pub fn put<T: Document>(&mut self, doc: T) {
        self.writes.push(Write::Put(doc.into_record()));
    }

    pub fn delete<T: Document>(&mut self, key: T::Key) {
        self.writes.push(Write::Remove(T::remove_key(key)));
    }
}

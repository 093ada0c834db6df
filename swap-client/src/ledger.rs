//! De-duplicated store of lock lifecycle events.
//!
//! Only the reconciliation engine owns a [`Ledger`]; everything else sees the
//! sorted snapshot returned by [`Ledger::view`].

use std::collections::HashMap;

use swap_common::{IdentityKey, LockEvent, LockKind, TimestampSource};

/// How an entry reached the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Live,
    Backfill,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    event: LockEvent,
    /// Arrival order, used to break timestamp ties
    seq: u64,
    source: EntrySource,
}

/// Lock events keyed by identity; at most one entry per key
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    index: HashMap<IdentityKey, usize>,
    next_seq: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&LockEvent> {
        self.index.get(key).map(|&i| &self.entries[i].event)
    }

    /// Sequence number the next inserted entry will receive
    pub fn high_water_mark(&self) -> u64 {
        self.next_seq
    }

    /// Merge `events`, returning those whose identity was not yet present.
    ///
    /// An already present entry is kept; it only picks up block metadata it
    /// was missing.
    pub fn merge<I>(&mut self, events: I, source: EntrySource) -> Vec<LockEvent>
    where
        I: IntoIterator<Item = LockEvent>,
    {
        let mut inserted = Vec::new();
        for event in events {
            let key = event.identity();
            match self.index.get(&key) {
                Some(&i) => enrich(&mut self.entries[i].event, &event),
                None => {
                    self.index.insert(key, self.entries.len());
                    self.entries.push(LedgerEntry {
                        event: event.clone(),
                        seq: self.next_seq,
                        source,
                    });
                    self.next_seq += 1;
                    inserted.push(event);
                }
            }
        }
        inserted
    }

    /// Replace the contents wholesale with a backfill result.
    ///
    /// Live entries that arrived at or after `live_since` are carried into the
    /// new contents, since the backfill may have been issued before they were
    /// mined. Entries of `unread` kinds, which the backfill could not query,
    /// are carried as well. Returns the events whose identity was absent
    /// before the swap.
    pub fn replace_with_backfill(
        &mut self,
        backfill: Vec<LockEvent>,
        live_since: u64,
        unread: &[LockKind],
    ) -> Vec<LockEvent> {
        let previous = std::mem::take(&mut self.index);
        let carried: Vec<LedgerEntry> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|entry| {
                (entry.source == EntrySource::Live && entry.seq >= live_since) || unread.contains(&entry.event.kind)
            })
            .collect();

        let mut replacement = Ledger {
            next_seq: self.next_seq,
            ..Ledger::default()
        };
        replacement.merge(backfill, EntrySource::Backfill);
        for entry in carried {
            let key = entry.event.identity();
            match replacement.index.get(&key) {
                Some(&i) => enrich(&mut replacement.entries[i].event, &entry.event),
                None => {
                    replacement.index.insert(key, replacement.entries.len());
                    replacement.entries.push(entry);
                }
            }
        }
        *self = replacement;

        self.entries
            .iter()
            .filter(|entry| !previous.contains_key(&entry.event.identity()))
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Drop every entry not matching `keep`
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&LockEvent) -> bool,
    {
        self.entries.retain(|entry| keep(&entry.event));
        self.reindex();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Events sorted by `observed_at` descending; ties keep arrival order
    pub fn view(&self) -> Vec<LockEvent> {
        let mut ordered: Vec<&LedgerEntry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| {
            b.event
                .observed_at
                .cmp(&a.event.observed_at)
                .then(a.seq.cmp(&b.seq))
        });
        ordered.into_iter().map(|entry| entry.event.clone()).collect()
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.event.identity(), i))
            .collect();
    }
}

/// Fill in block metadata an existing entry lacks
fn enrich(existing: &mut LockEvent, incoming: &LockEvent) {
    if existing.block_number.is_none() {
        existing.block_number = incoming.block_number;
    }
    if existing.tx_hash.is_none() {
        existing.tx_hash = incoming.tx_hash;
    }
    if existing.log_index.is_none() {
        existing.log_index = incoming.log_index;
    }
    if existing.timestamp_source == TimestampSource::Ingestion && incoming.timestamp_source == TimestampSource::Block {
        existing.observed_at = incoming.observed_at;
        existing.timestamp_source = TimestampSource::Block;
    }
}

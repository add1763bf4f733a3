//! The table of requests awaiting a response.
//!
//! Each entry pairs a correlation id with the epoch of the context it was
//! posted to and a single-use sender. Settling an entry removes it, so an
//! entry is resolved at most once whether by a response, a timeout, a
//! context failure or abandonment.

use std::collections::HashMap;

use futures::channel::oneshot;

use crate::channel::ChannelError;

/// Outcome delivered to a waiting request.
pub type Outcome<T> = Result<T, ChannelError>;

#[derive(Debug)]
struct Entry<T> {
    epoch: u64,
    sender: oneshot::Sender<Outcome<T>>,
}

/// Pending requests keyed by correlation id.
#[derive(Debug)]
pub struct PendingTable<T> {
    entries: HashMap<u64, Entry<T>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PendingTable<T> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for a context of the given epoch and return the
    /// receiving half. Re-registering an id replaces the old entry, whose
    /// receiver then observes cancellation.
    pub fn insert(&mut self, id: u64, epoch: u64) -> oneshot::Receiver<Outcome<T>> {
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(id, Entry { epoch, sender });
        receiver
    }

    /// Epoch the entry was registered under.
    #[must_use]
    pub fn epoch_of(&self, id: u64) -> Option<u64> {
        self.entries.get(&id).map(|e| e.epoch)
    }

    /// Resolve and remove `id`. Returns `false` if there was no entry or
    /// its receiver has already gone away.
    pub fn settle(&mut self, id: u64, outcome: Outcome<T>) -> bool {
        self.entries
            .remove(&id)
            .is_some_and(|entry| entry.sender.send(outcome).is_ok())
    }

    /// Remove `id` without resolving it.
    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Reject every entry registered under `epoch`. Returns how many
    /// entries were removed.
    pub fn reject_epoch(&mut self, epoch: u64, error: &ChannelError) -> usize {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.epoch == epoch)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                let _ = entry.sender.send(Err(error.clone()));
            }
        }
        ids.len()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

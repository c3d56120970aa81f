use std::collections::VecDeque;

use crate::envelope::{Envelope, EnvelopeId};

/// Bounded holding area for envelopes that cannot be sent yet.
///
/// Entries are kept in submission order (ascending [`EnvelopeId`]) no matter
/// when they arrive: an envelope that was in flight when connectivity dropped
/// lands ahead of one created offline afterwards.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit an envelope. A full queue hands it back untouched so the caller
    /// can reject it.
    pub fn insert(&mut self, mut envelope: Envelope) -> Result<(), Envelope> {
        if self.is_full() || !envelope.mark_queued() {
            return Err(envelope);
        }
        let id = envelope.id();
        let at = self.entries.partition_point(|queued| queued.id() < id);
        self.entries.insert(at, envelope);
        Ok(())
    }

    /// Take everything queued right now, oldest first.
    pub fn take_all(&mut self) -> Vec<Envelope> {
        self.entries.drain(..).collect()
    }

    pub fn remove(&mut self, id: EnvelopeId) -> Option<Envelope> {
        let at = self.entries.iter().position(|queued| queued.id() == id)?;
        self.entries.remove(at)
    }

    pub fn contains(&self, id: EnvelopeId) -> bool {
        self.entries.iter().any(|queued| queued.id() == id)
    }

    pub fn ids(&self) -> Vec<EnvelopeId> {
        self.entries.iter().map(Envelope::id).collect()
    }
}

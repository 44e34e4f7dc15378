//! FIFO of pending acknowledgments with per-type pausing.

use std::collections::{HashMap, VecDeque};

use crate::message::UpdateAck;

/// A FIFO of [`UpdateAck`]s where each type URL can be paused.
///
/// Pausing is reference counted: a type is paused until every `pause` has
/// been matched by a `resume`. ACKs of a paused type stay queued, and
/// [`front`](Self::front) and [`pop_front`](Self::pop_front) skip over them
/// while preserving the order of everything else.
#[derive(Debug, Default)]
pub struct PausableAckQueue {
    storage: VecDeque<UpdateAck>,
    pauses: HashMap<String, usize>,
}

impl PausableAckQueue {
    /// Create an empty queue with nothing paused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an ACK to the back of the queue.
    pub fn push(&mut self, ack: UpdateAck) {
        self.storage.push_back(ack);
    }

    /// Number of queued ACKs, paused types included.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Returns true if nothing at all is queued.
    ///
    /// A queue holding only ACKs of paused types is not empty, but has no
    /// [`front`](Self::front).
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The oldest ACK whose type is not paused.
    pub fn front(&self) -> Option<&UpdateAck> {
        self.storage.iter().find(|ack| !self.paused(&ack.type_url))
    }

    /// Remove and return the oldest ACK whose type is not paused.
    pub fn pop_front(&mut self) -> Option<UpdateAck> {
        let pos = self
            .storage
            .iter()
            .position(|ack| !self.paused(&ack.type_url))?;
        self.storage.remove(pos)
    }

    /// Pause `type_url`. Nestable.
    pub fn pause(&mut self, type_url: &str) {
        *self.pauses.entry(type_url.to_owned()).or_default() += 1;
    }

    /// Undo one [`pause`](Self::pause) of `type_url`.
    ///
    /// # Panics
    ///
    /// Panics if `type_url` is not paused.
    pub fn resume(&mut self, type_url: &str) {
        let count = self.pauses.get_mut(type_url).filter(|count| **count > 0);
        let Some(count) = count else {
            panic!("resume() called on {type_url}, which is not paused");
        };
        *count -= 1;
        if *count == 0 {
            self.pauses.remove(type_url);
        }
    }

    /// Returns true if `type_url` has outstanding pauses.
    pub fn paused(&self, type_url: &str) -> bool {
        self.pauses.get(type_url).is_some_and(|count| *count > 0)
    }
}

//! Per-connection request routing
//!
//! A connection that multiplexes several queries needs to route each
//! incoming delivery to the callback of the request it belongs to.
//! [`RequestMap`] keeps those callbacks in an arena owned by the connection;
//! a [`RequestId`] is a slot index plus a generation, so an id that outlived
//! its request can never reach the slot's next occupant.

use crate::sentinel::Sentinel;
use crate::source::Callback;
use std::fmt;

/// Handle of a pending request inside one [`RequestMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}.{}", self.index, self.generation)
    }
}

struct Slot<I> {
    generation: u32,
    callback: Option<Callback<I>>,
}

/// Arena of pending request callbacks
pub struct RequestMap<I> {
    slots: Vec<Slot<I>>,
    free: Vec<u32>,
    pending: usize,
}

impl<I> Default for RequestMap<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> RequestMap<I> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pending: 0,
        }
    }

    /// Store `callback` and return the id deliveries must be addressed to
    pub fn register(&mut self, callback: Callback<I>) -> RequestId {
        self.pending += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.callback = Some(callback);
            return RequestId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            callback: Some(callback),
        });
        RequestId {
            index,
            generation: 0,
        }
    }

    /// Route one sentinel to its request. A terminal sentinel retires the
    /// request. Returns false for unknown or retired ids.
    pub fn deliver(&mut self, id: RequestId, sentinel: Sentinel<I>) -> bool {
        let terminal = sentinel.is_terminal();
        let Some(callback) = self.callback_mut(id) else {
            log::debug!("dropping {} delivery for stale request {}", sentinel.kind(), id);
            return false;
        };
        callback(sentinel);
        if terminal {
            self.retire(id);
        }
        true
    }

    /// Forget a request; later deliveries for it are dropped
    pub fn cancel(&mut self, id: RequestId) -> bool {
        if self.callback_mut(id).is_none() {
            return false;
        }
        log::debug!("cancelling request {}", id);
        self.retire(id);
        true
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |slot| slot.generation == id.generation && slot.callback.is_some())
    }

    /// Number of outstanding requests
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    fn callback_mut(&mut self, id: RequestId) -> Option<&mut Callback<I>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.callback.as_mut()
    }

    fn retire(&mut self, id: RequestId) {
        let slot = &mut self.slots[id.index as usize];
        // Dropping the callback closes the stream side if the request never finished.
        slot.callback = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.pending -= 1;
    }
}

//! CPort OUT request pool
//!
//! A fixed set of slots tracked by a free-index stack under a short-held
//! mutex, so acquire and release are O(1). When the stack is empty, overflow
//! requests are handed out up to a configured limit; they are never returned
//! to the fixed pool, only forgotten once complete.
//!
//! Every checkout bumps the slot's generation. A slot reference from an older
//! checkout no longer matches, which is what makes stale cookies and
//! duplicate completions harmless.

use common::{OutSlot, SlotKind};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Owned by an in-flight send
    Busy,
    /// Completion is being reported; not yet free
    Completing,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    /// Indices of free slots; the top is handed out next
    free: Vec<u16>,
    overflow: HashMap<u32, SlotState>,
    next_serial: u32,
    retired: bool,
}

/// Result of [`OutPool::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Pooled(OutSlot),
    /// The pool was empty and an overflow request was allocated
    Overflow(OutSlot),
}

/// Result of [`OutPool::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// The slot does not name a current checkout
    NotHeld,
    /// Back on the free stack
    Pooled,
    /// The request is gone: an overflow request, or a pooled slot
    /// finishing after the pool was retired
    Dropped,
}

impl Acquired {
    pub fn slot(self) -> OutSlot {
        match self {
            Acquired::Pooled(slot) | Acquired::Overflow(slot) => slot,
        }
    }
}

#[derive(Debug)]
pub struct OutPool {
    state: Mutex<PoolState>,
    capacity: usize,
    max_overflow: usize,
}

impl OutPool {
    pub fn new(capacity: usize, max_overflow: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Free,
            })
            .collect();
        // Reversed so slot 0 is handed out first
        let free = (0..capacity as u16).rev().collect();

        Self {
            state: Mutex::new(PoolState {
                slots,
                free,
                overflow: HashMap::new(),
                next_serial: 0,
                retired: false,
            }),
            capacity,
            max_overflow,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check out a request; `None` once the pool and overflow are exhausted
    /// or the pool has been retired
    pub fn acquire(&self) -> Option<Acquired> {
        let mut state = self.lock();
        if state.retired {
            return None;
        }

        if let Some(index) = state.free.pop() {
            let slot = &mut state.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = SlotState::Busy;
            return Some(Acquired::Pooled(OutSlot {
                kind: SlotKind::Pool(index),
                generation: slot.generation,
            }));
        }

        if state.overflow.len() >= self.max_overflow {
            return None;
        }

        let mut serial = state.next_serial;
        while state.overflow.contains_key(&serial) {
            serial = serial.wrapping_add(1);
        }
        state.next_serial = serial.wrapping_add(1);
        state.overflow.insert(serial, SlotState::Busy);

        Some(Acquired::Overflow(OutSlot {
            kind: SlotKind::Overflow(serial),
            generation: 0,
        }))
    }

    fn state_of(state: &PoolState, slot: OutSlot) -> Option<SlotState> {
        match slot.kind {
            SlotKind::Pool(index) => state
                .slots
                .get(index as usize)
                .filter(|s| s.generation == slot.generation)
                .map(|s| s.state),
            SlotKind::Overflow(serial) => state.overflow.get(&serial).copied(),
        }
    }

    fn set_state(state: &mut PoolState, slot: OutSlot, new: SlotState) {
        match slot.kind {
            SlotKind::Pool(index) => {
                if let Some(s) = state.slots.get_mut(index as usize) {
                    s.state = new;
                }
            }
            SlotKind::Overflow(serial) => {
                if let Some(s) = state.overflow.get_mut(&serial) {
                    *s = new;
                }
            }
        }
    }

    /// Whether `slot` still names an in-flight send
    pub fn is_in_flight(&self, slot: OutSlot) -> bool {
        Self::state_of(&self.lock(), slot) == Some(SlotState::Busy)
    }

    /// Claim the right to report `slot`'s completion
    ///
    /// Succeeds once per checkout; any later call for the same checkout
    /// returns false.
    pub fn begin_complete(&self, slot: OutSlot) -> bool {
        let mut state = self.lock();
        if Self::state_of(&state, slot) != Some(SlotState::Busy) {
            return false;
        }
        Self::set_state(&mut state, slot, SlotState::Completing);
        true
    }

    /// Return `slot` to the pool (or drop the overflow request)
    pub fn release(&self, slot: OutSlot) -> Released {
        let mut state = self.lock();
        match Self::state_of(&state, slot) {
            Some(SlotState::Busy) | Some(SlotState::Completing) => {}
            _ => return Released::NotHeld,
        }

        match slot.kind {
            SlotKind::Pool(index) => {
                Self::set_state(&mut state, slot, SlotState::Free);
                if state.retired {
                    Released::Dropped
                } else {
                    state.free.push(index);
                    Released::Pooled
                }
            }
            SlotKind::Overflow(serial) => {
                state.overflow.remove(&serial);
                Released::Dropped
            }
        }
    }

    /// Every send currently in flight
    pub fn in_flight_slots(&self) -> Vec<OutSlot> {
        let state = self.lock();
        let pooled = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Busy)
            .map(|(i, s)| OutSlot {
                kind: SlotKind::Pool(i as u16),
                generation: s.generation,
            });
        let overflow = state
            .overflow
            .iter()
            .filter(|(_, s)| **s == SlotState::Busy)
            .map(|(serial, _)| OutSlot {
                kind: SlotKind::Overflow(*serial),
                generation: 0,
            });
        pooled.chain(overflow).collect()
    }

    /// Requests checked out (busy or completing)
    pub fn in_flight(&self) -> usize {
        let state = self.lock();
        let pooled = state
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count();
        pooled + state.overflow.len()
    }

    /// Overflow requests currently allocated
    pub fn overflow_in_use(&self) -> usize {
        self.lock().overflow.len()
    }

    /// Stop handing out requests; returns the number of pooled slots freed
    ///
    /// Slots still checked out are not counted. Each is reported as
    /// [`Released::Dropped`] if it is released later.
    pub fn retire(&self) -> usize {
        let mut state = self.lock();
        if state.retired {
            return 0;
        }
        state.retired = true;
        state.free.clear();
        state
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Free)
            .count()
    }
}

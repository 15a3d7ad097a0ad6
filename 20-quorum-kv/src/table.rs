//! Fixed-size integer table shared by every worker of a server.
//!
//! Keys map to slots by `key % len`. Distinct keys landing on the same slot
//! alias each other; there is no probing.
//!
//! Each slot carries an advisory write lock tagged with the message ID of the
//! PUT that took it. Acquisition never waits: a caller that loses the race is
//! told the slot is busy and must decide for itself what to do about it.

use parking_lot::Mutex;
use thiserror::Error;

use crate::codec::MessageId;

/// A GET hit a slot that is held by an in-flight PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("slot {slot} is locked by message {holder}")]
pub struct Locked {
    pub slot: usize,
    pub holder: MessageId,
}

#[derive(Debug, Default)]
struct Slot {
    value: i32,
    holder: Option<MessageId>,
}

pub struct Table {
    slots: Box<[Mutex<Slot>]>,
}

impl Table {
    /// Creates a zeroed table. `len` must be non-zero.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "table needs at least one slot");
        Self {
            slots: (0..len).map(|_| Mutex::new(Slot::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_index(&self, key: u16) -> usize {
        usize::from(key) % self.slots.len()
    }

    fn slot(&self, key: u16) -> &Mutex<Slot> {
        &self.slots[self.slot_index(key)]
    }

    /// Reads a slot unless a PUT currently holds it.
    pub fn get(&self, key: u16) -> Result<i32, Locked> {
        let slot = self.slot(key).lock();
        match slot.holder {
            Some(holder) => Err(Locked {
                slot: self.slot_index(key),
                holder,
            }),
            None => Ok(slot.value),
        }
    }

    /// Takes the slot's write lock for `holder`. Returns `false` if any
    /// message, `holder` included, already has it.
    pub fn try_lock(&self, key: u16, holder: MessageId) -> bool {
        let mut slot = self.slot(key).lock();
        if slot.holder.is_some() {
            return false;
        }
        slot.holder = Some(holder);
        true
    }

    /// Stores `value` if `holder` owns the slot's lock. The lock stays held.
    pub fn write(&self, key: u16, holder: MessageId, value: i32) -> bool {
        let mut slot = self.slot(key).lock();
        if slot.holder != Some(holder) {
            return false;
        }
        slot.value = value;
        true
    }

    /// Releases the slot if `holder` owns it.
    pub fn unlock(&self, key: u16, holder: MessageId) -> bool {
        let mut slot = self.slot(key).lock();
        if slot.holder != Some(holder) {
            return false;
        }
        slot.holder = None;
        true
    }

    /// Write followed by unlock, with no window for a GET to observe the
    /// slot in between.
    pub fn commit(&self, key: u16, holder: MessageId, value: i32) -> bool {
        let mut slot = self.slot(key).lock();
        if slot.holder != Some(holder) {
            return false;
        }
        slot.value = value;
        slot.holder = None;
        true
    }

    pub fn is_locked(&self, key: u16) -> bool {
        self.slot(key).lock().holder.is_some()
    }

    /// Copies every slot's value, locked or not.
    pub fn snapshot(&self) -> Vec<i32> {
        self.slots.iter().map(|slot| slot.lock().value).collect()
    }

    pub fn locked_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().holder.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn keys_alias_by_modulus() {
        let table = Table::new(4);
        assert_eq!(table.slot_index(1), 1);
        assert_eq!(table.slot_index(5), 1);

        assert!(table.try_lock(1, 10));
        assert!(table.commit(1, 10, 42));
        assert_eq!(table.get(5), Ok(42));
        assert_eq!(table.snapshot(), vec![0, 42, 0, 0]);
    }

    #[test]
    fn get_is_refused_while_locked() {
        let table = Table::new(4);
        assert_eq!(table.get(2), Ok(0));
        assert!(table.try_lock(2, 7));
        assert_eq!(table.get(2), Err(Locked { slot: 2, holder: 7 }));
        assert!(table.unlock(2, 7));
        assert_eq!(table.get(2), Ok(0));
    }

    #[test]
    fn only_the_holder_can_write_or_release() {
        let table = Table::new(4);
        assert!(table.try_lock(3, 1));
        assert!(!table.try_lock(3, 2));
        assert!(!table.try_lock(3, 1));

        assert!(!table.write(3, 2, 99));
        assert!(!table.unlock(3, 2));
        assert!(!table.commit(3, 2, 99));
        assert!(table.is_locked(3));

        assert!(table.write(3, 1, 5));
        assert!(table.is_locked(3));
        assert!(table.unlock(3, 1));
        assert!(!table.is_locked(3));
        assert_eq!(table.get(3), Ok(5));
    }

    #[test]
    fn abort_leaves_value_untouched() {
        let table = Table::new(2);
        assert!(table.try_lock(0, 1));
        assert!(table.commit(0, 1, 11));
        assert!(table.try_lock(0, 2));
        assert!(table.unlock(0, 2));
        assert_eq!(table.get(0), Ok(11));
        assert_eq!(table.locked_slots(), 0);
    }

    #[test]
    fn concurrent_lockers_get_exactly_one_winner() {
        let table = Arc::new(Table::new(8));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16u16)
            .map(|holder| {
                let table = Arc::clone(&table);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if table.try_lock(5, holder) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("locker thread panicked");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(table.locked_slots(), 1);
    }
}

//! Host-side table of references exposed by an embedded context.
//!
//! Handles are `generation << 20 | index`. Freeing a slot bumps its
//! generation so stale handles stop resolving, and a slot whose generation
//! would overflow is retired for good. A handle value is therefore never
//! issued twice during the lifetime of a table.

use scriptdomain_api::RefHandle;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: i32 = (1 << INDEX_BITS) - 1;
const MAX_GENERATION: u32 = (1 << (31 - INDEX_BITS)) - 1;
/// Slot 0 is never used so that handle 0 stays null
const MAX_SLOTS: usize = INDEX_MASK as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live { generation: u32, engine_ref: i32 },
    Free { generation: u32 },
    Retired,
}

/// Outcome of a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRemoval {
    /// The handle was live and now no longer resolves
    Released,
    /// The handle was unknown or had already been removed
    AlreadyReleased,
}

#[derive(Debug, Default)]
pub struct RefTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new handle for an engine-side reference
    ///
    /// Returns `None` only when every slot has been retired or the table is
    /// full.
    pub fn insert(&mut self, engine_ref: i32) -> Option<RefHandle> {
        let (index, generation) = match self.free.pop() {
            Some(index) => match self.slots[index] {
                Slot::Free { generation } => (index, generation),
                _ => unreachable!("free list points at a non-free slot"),
            },
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return None;
                }
                self.slots.push(Slot::Free { generation: 0 });
                (self.slots.len() - 1, 0)
            }
        };

        self.slots[index] = Slot::Live {
            generation,
            engine_ref,
        };
        self.live += 1;
        Some(encode(index, generation))
    }

    /// Engine-side reference for a live handle
    pub fn resolve(&self, handle: RefHandle) -> Option<i32> {
        let (index, generation) = decode(handle)?;
        match self.slots.get(index) {
            Some(Slot::Live {
                generation: live_gen,
                engine_ref,
            }) if *live_gen == generation => Some(*engine_ref),
            _ => None,
        }
    }

    /// Invalidate a handle, returning the engine reference it pointed at
    pub fn remove(&mut self, handle: RefHandle) -> Option<i32> {
        let engine_ref = self.resolve(handle)?;
        let (index, generation) = decode(handle)?;
        self.release_slot(index, generation);
        Some(engine_ref)
    }

    /// Invalidate every live handle, returning how many there were
    pub fn clear(&mut self) -> usize {
        let released = self.live;
        for index in 0..self.slots.len() {
            if let Slot::Live { generation, .. } = self.slots[index] {
                self.release_slot(index, generation);
            }
        }
        released
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    fn release_slot(&mut self, index: usize, generation: u32) {
        self.live -= 1;
        if generation >= MAX_GENERATION {
            self.slots[index] = Slot::Retired;
        } else {
            self.slots[index] = Slot::Free {
                generation: generation + 1,
            };
            self.free.push(index);
        }
    }
}

fn encode(index: usize, generation: u32) -> RefHandle {
    // Slot indexes are offset by one so that no handle encodes to zero
    let raw = ((generation as i32) << INDEX_BITS) | (index as i32 + 1);
    RefHandle(raw)
}

fn decode(handle: RefHandle) -> Option<(usize, u32)> {
    if handle.is_null() {
        return None;
    }
    let raw = handle.raw();
    let index = (raw & INDEX_MASK) as usize;
    if index == 0 {
        return None;
    }
    Some((index - 1, (raw >> INDEX_BITS) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let mut table = RefTable::new();
        let a = table.insert(10).unwrap();
        let b = table.insert(11).unwrap();

        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(table.resolve(a), Some(10));
        assert_eq!(table.resolve(b), Some(11));
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_removed_handle_stops_resolving() {
        let mut table = RefTable::new();
        let handle = table.insert(5).unwrap();

        assert_eq!(table.remove(handle), Some(5));
        assert_eq!(table.resolve(handle), None);
        assert_eq!(table.remove(handle), None); // Already removed
    }

    #[test]
    fn test_reused_slot_gets_fresh_handle() {
        let mut table = RefTable::new();
        let old = table.insert(1).unwrap();
        table.remove(old);

        let new = table.insert(2).unwrap();
        assert_ne!(old, new);
        assert_eq!(table.resolve(old), None);
        assert_eq!(table.resolve(new), Some(2));
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let mut table = RefTable::new();
        let mut issued = std::collections::HashSet::new();

        for _ in 0..=MAX_GENERATION {
            let handle = table.insert(0).unwrap();
            assert!(issued.insert(handle), "handle {} issued twice", handle);
            table.remove(handle);
        }

        // The first slot is retired, so the next handle comes from a new slot
        let next = table.insert(0).unwrap();
        assert!(issued.insert(next));
        assert_eq!(decode(next), Some((1, 0)));
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut table = RefTable::new();
        let handles: Vec<_> = (0..4).map(|r| table.insert(r).unwrap()).collect();

        assert_eq!(table.clear(), 4);
        assert_eq!(table.live_count(), 0);
        for handle in handles {
            assert_eq!(table.resolve(handle), None);
        }
    }

    #[test]
    fn test_garbage_handles_never_resolve() {
        let mut table = RefTable::new();
        table.insert(1).unwrap();

        assert_eq!(table.resolve(RefHandle::NULL), None);
        assert_eq!(table.resolve(RefHandle(-7)), None);
        assert_eq!(table.resolve(RefHandle(1 << INDEX_BITS)), None);
        assert_eq!(table.resolve(RefHandle(999)), None);
    }
}

//! The in-memory tablet slot cache: a fixed-size array of tablet buffers,
//! reference counted so a tablet in active use is never evicted out from
//! under its caller, with round-robin victim selection when every slot is
//! full.
//!
//! This module only knows about slots and pin counts. It has no notion of
//! "this tablet came from disk" or "this tablet needs writing back" — that
//! coordination lives one level up, in [`crate::database::Database`], which
//! is the only thing allowed to evict a slot (since eviction may require a
//! write-back).

use crate::error::{EngineError, Result};
use crate::tablet::Tablet;

/// Pin count of an occupied slot plus one, so that `0` unambiguously means
/// "free". A slot with `status == 1` is occupied but unpinned and is the
/// only kind of slot eligible for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Free,
    Occupied { pins: u32 },
}

struct Slot {
    status: Status,
    id: Option<u32>,
    tablet: Option<Tablet>,
}

/// Round-robin tablet slot cache. `N_SLOTS` tablet-sized buffers, each
/// holding at most one tablet at a time.
pub struct SlotCache {
    slots: Vec<Slot>,
    cursor: usize,
}

impl SlotCache {
    pub fn new(n_slots: usize) -> SlotCache {
        let mut slots = Vec::with_capacity(n_slots);
        for _ in 0..n_slots {
            slots.push(Slot {
                status: Status::Free,
                id: None,
                tablet: None,
            });
        }
        SlotCache { slots, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Scans for a tablet already resident by id. Mirrors `virg_db_findslot`.
    pub fn find_by_id(&self, id: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.id == Some(id))
    }

    pub fn id_at(&self, idx: usize) -> Option<u32> {
        self.slots[idx].id
    }

    pub fn get(&self, idx: usize) -> Option<&Tablet> {
        self.slots[idx].tablet.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Tablet> {
        self.slots[idx].tablet.as_mut()
    }

    pub fn is_pinned(&self, idx: usize) -> bool {
        matches!(self.slots[idx].status, Status::Occupied { pins } if pins > 0)
    }

    pub fn pin(&mut self, idx: usize) {
        match &mut self.slots[idx].status {
            Status::Occupied { pins } => *pins += 1,
            Status::Free => unreachable!("pinning a free slot"),
        }
    }

    pub fn unpin(&mut self, idx: usize) {
        match &mut self.slots[idx].status {
            Status::Occupied { pins } if *pins > 0 => *pins -= 1,
            Status::Occupied { .. } => {}
            Status::Free => unreachable!("unpinning a free slot"),
        }
    }

    /// Finds a slot to hold a newly loaded or newly created tablet: an
    /// empty slot if one exists, otherwise the next unpinned slot walking
    /// round-robin from the cursor. Returns `AllPinned` if every slot is
    /// currently pinned. Does not evict anything itself — it's the caller's
    /// job to write back whatever tablet currently occupies the returned
    /// slot, if any, before calling [`SlotCache::occupy`].
    pub fn find_victim(&mut self) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.status == Status::Free) {
            return Ok(idx);
        }

        let n = self.slots.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if matches!(self.slots[idx].status, Status::Occupied { pins: 0 }) {
                self.cursor = (idx + 1) % n;
                return Ok(idx);
            }
        }

        log::warn!("slot cache exhausted: all {n} slots are pinned");
        Err(EngineError::AllPinned)
    }

    /// Evicts whatever tablet is currently in `idx` (if any) and returns it
    /// to the caller, who is responsible for writing it back to disk before
    /// the bytes are discarded.
    pub fn evict(&mut self, idx: usize) -> Option<Tablet> {
        let slot = &mut self.slots[idx];
        slot.status = Status::Free;
        slot.id = None;
        slot.tablet.take()
    }

    /// Installs `tablet` into `idx`, pinned once on behalf of the caller
    /// that requested it.
    pub fn occupy(&mut self, idx: usize, id: u32, tablet: Tablet) {
        self.slots[idx] = Slot {
            status: Status::Occupied { pins: 1 },
            id: Some(id),
            tablet: Some(tablet),
        };
    }

    /// Drops a resident tablet without writing it back; used when closing
    /// a database cleanly (the caller has already flushed everything it
    /// wants kept) and when removing a tablet that's being deleted outright.
    pub fn clear(&mut self, idx: usize) {
        self.slots[idx] = Slot {
            status: Status::Free,
            id: None,
            tablet: None,
        };
    }

    pub fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != Status::Free)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::VirgType;

    #[test]
    fn find_victim_prefers_free_slots_first() {
        let mut cache = SlotCache::new(2);
        let idx = cache.find_victim().unwrap();
        let config = Config::small();
        cache.occupy(idx, 1, Tablet::create(&config, 1, VirgType::Int, Some(0)));
        let idx2 = cache.find_victim().unwrap();
        assert_ne!(idx, idx2);
    }

    #[test]
    fn find_victim_fails_when_all_pinned() {
        let mut cache = SlotCache::new(1);
        let config = Config::small();
        let idx = cache.find_victim().unwrap();
        cache.occupy(idx, 1, Tablet::create(&config, 1, VirgType::Int, Some(0)));
        assert!(matches!(cache.find_victim(), Err(EngineError::AllPinned)));
    }

    #[test]
    fn unpinned_slot_becomes_eligible_again() {
        let mut cache = SlotCache::new(1);
        let config = Config::small();
        let idx = cache.find_victim().unwrap();
        cache.occupy(idx, 1, Tablet::create(&config, 1, VirgType::Int, Some(0)));
        cache.unpin(idx);
        let idx2 = cache.find_victim().unwrap();
        assert_eq!(idx, idx2);
    }

    #[test]
    fn find_by_id_locates_resident_tablet() {
        let mut cache = SlotCache::new(2);
        let config = Config::small();
        let idx = cache.find_victim().unwrap();
        cache.occupy(idx, 42, Tablet::create(&config, 42, VirgType::Int, Some(0)));
        assert_eq!(cache.find_by_id(42), Some(idx));
        assert_eq!(cache.find_by_id(99), None);
    }
}

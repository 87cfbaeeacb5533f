//! Generational resource handles.
//!
//! A [`Handle`] is a 64-bit value that packs a *generation* counter in the
//! high 32 bits and a slot *index* in the low 32 bits. The generation is
//! bumped every time a slot is recycled, so a handle kept past its release is
//! detected as stale instead of silently addressing whatever reused the slot.
//!
//! Handles are split across two owners:
//!
//! - [`HandleAllocator`] is shared (`Arc`) between producers and the consumer.
//!   Producers [`reserve`](HandleAllocator::reserve) handles synchronously when
//!   they enqueue a creation command, before the object exists.
//! - [`HandleTable`] lives inside a backend that is owned by the consumer
//!   thread. It maps live handles to consumer-owned objects and is the only
//!   path that returns a slot to the allocator, so releases are always
//!   performed by the consumer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem_sync::mutex::Mutex;

use crate::HandleError;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A generational resource handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// The sentinel for "no resource". Never returned by an allocator.
    pub const INVALID: Handle = Handle(u64::MAX);

    /// Construct a handle from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this is anything other than [`Handle::INVALID`].
    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}v{})", self.index(), self.generation())
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}v{}", self.index(), self.generation())
        } else {
            f.write_str("invalid")
        }
    }
}

// ---------------------------------------------------------------------------
// HandleAllocator
// ---------------------------------------------------------------------------

/// Largest slot count an allocator can manage. Index `u32::MAX` is never
/// handed out, which keeps every live handle distinct from the sentinel.
pub const MAX_SLOTS: u32 = u32::MAX - 1;

#[derive(Debug, Default)]
struct AllocatorState {
    /// Current generation for each index slot.
    generations: Vec<u32>,
    /// Whether the slot is currently reserved.
    live: Vec<bool>,
    /// Free-list of recyclable indices (FIFO queue).
    free: VecDeque<u32>,
}

/// Hands out and recycles [`Handle`]s with generational tracking.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
#[derive(Debug)]
pub struct HandleAllocator {
    state: Mutex<AllocatorState>,
    max_slots: u32,
}

impl HandleAllocator {
    /// Create an allocator that manages at most `max_slots` live handles.
    pub fn new(max_slots: u32) -> Self {
        Self {
            state: Mutex::new("handle_allocator", AllocatorState::default()),
            max_slots: max_slots.min(MAX_SLOTS),
        }
    }

    /// Maximum number of simultaneously live handles.
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Reserve a fresh handle.
    ///
    /// Reuses the oldest freed slot (its generation was bumped on release) or
    /// grows the table. Fails with [`HandleError::Exhausted`] when every slot
    /// is live.
    pub fn reserve(&self) -> Result<Handle, HandleError> {
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop_front() {
            state.live[index as usize] = true;
            return Ok(Handle::new(index, state.generations[index as usize]));
        }
        if state.generations.len() >= self.max_slots as usize {
            return Err(HandleError::Exhausted {
                capacity: self.max_slots,
            });
        }
        let index = state.generations.len() as u32;
        state.generations.push(0);
        state.live.push(true);
        Ok(Handle::new(index, 0))
    }

    /// Whether `handle` is currently reserved with a matching generation.
    pub fn is_live(&self, handle: Handle) -> bool {
        let state = self.state.lock();
        Self::matches(&state, handle)
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.state.lock().live.iter().filter(|&&l| l).count()
    }

    /// Return a handle's slot to the free list, bumping its generation.
    ///
    /// Crate-private: only [`HandleTable`] (consumer side) and the submitter
    /// (for a reservation that was never published) may recycle.
    pub(crate) fn recycle(&self, handle: Handle) -> bool {
        let mut state = self.state.lock();
        if !Self::matches(&state, handle) {
            return false;
        }
        let idx = handle.index() as usize;
        state.live[idx] = false;
        state.generations[idx] = state.generations[idx].wrapping_add(1);
        state.free.push_back(handle.index());
        true
    }

    fn matches(state: &AllocatorState, handle: Handle) -> bool {
        let idx = handle.index() as usize;
        idx < state.generations.len()
            && state.live[idx]
            && state.generations[idx] == handle.generation()
    }
}

// ---------------------------------------------------------------------------
// HandleTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: T,
}

/// Consumer-owned map from live handles to objects.
///
/// Every lookup checks the handle's generation, so stale handles resolve to
/// nothing.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<Slot<T>>>,
    allocator: Arc<HandleAllocator>,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table backed by `allocator`.
    pub fn new(allocator: Arc<HandleAllocator>) -> Self {
        Self {
            slots: Vec::new(),
            allocator,
            len: 0,
        }
    }

    /// The allocator this table releases into.
    pub fn allocator(&self) -> &Arc<HandleAllocator> {
        &self.allocator
    }

    /// Bind `value` to a reserved handle.
    ///
    /// Fails if the handle is not live in the allocator (stale, released or
    /// never reserved) or already has an object bound.
    pub fn insert(&mut self, handle: Handle, value: T) -> Result<(), HandleError> {
        if !self.allocator.is_live(handle) {
            return Err(HandleError::Stale { handle });
        }
        let idx = handle.index() as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        if self.slots[idx].is_some() {
            return Err(HandleError::Occupied { handle });
        }
        self.slots[idx] = Some(Slot {
            generation: handle.generation(),
            value,
        });
        self.len += 1;
        Ok(())
    }

    /// Whether `handle` is bound to an object.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// The object bound to `handle`, if the generation matches.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index() as usize) {
            Some(Some(slot)) if slot.generation == handle.generation() => Some(&slot.value),
            _ => None,
        }
    }

    /// Mutable access to the object bound to `handle`.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index() as usize) {
            Some(Some(slot)) if slot.generation == handle.generation() => Some(&mut slot.value),
            _ => None,
        }
    }

    /// Unbind and return the object, and recycle the handle.
    ///
    /// Returns `None` for stale handles, which are left untouched.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let idx = handle.index() as usize;
        let matches = matches!(
            self.slots.get(idx),
            Some(Some(slot)) if slot.generation == handle.generation()
        );
        if !matches {
            return None;
        }
        let slot = self.slots[idx].take()?;
        self.len -= 1;
        self.allocator.recycle(handle);
        Some(slot.value)
    }

    /// Release a handle whether or not an object was ever bound to it.
    ///
    /// This covers creation commands that failed on the consumer: the
    /// producer still holds a reserved handle and eventually releases it.
    /// Returns the object if one was bound, and whether the handle was live.
    pub fn release(&mut self, handle: Handle) -> (Option<T>, bool) {
        if let Some(value) = self.remove(handle) {
            return (Some(value), true);
        }
        (None, self.allocator.recycle(handle))
    }

    /// Number of bound objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no objects are bound.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over `(handle, object)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.as_ref()
                .map(|s| (Handle::new(idx as u32, s.generation), &s.value))
        })
    }

    /// Iterate mutably over `(handle, object)` pairs in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(idx, slot)| {
            slot.as_mut()
                .map(|s| (Handle::new(idx as u32, s.generation), &mut s.value))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max: u32) -> HandleTable<&'static str> {
        HandleTable::new(Arc::new(HandleAllocator::new(max)))
    }

    #[test]
    fn reserve_unique_handles() {
        let alloc = HandleAllocator::new(1000);
        let handles: Vec<Handle> = (0..100).map(|_| alloc.reserve().unwrap()).collect();
        let mut indices: Vec<u32> = handles.iter().map(|h| h.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert!(handles.iter().all(|h| h.is_valid()));
    }

    #[test]
    fn generation_increments_on_recycle() {
        let mut t = table(8);
        let h0 = t.allocator().reserve().unwrap();
        t.insert(h0, "a").unwrap();
        assert_eq!(t.remove(h0), Some("a"));
        let h1 = t.allocator().reserve().unwrap();
        assert_eq!(h1.index(), h0.index());
        assert_eq!(h1.generation(), h0.generation() + 1);
        assert_ne!(h0, h1);
    }

    #[test]
    fn stale_handle_resolves_to_nothing() {
        let mut t = table(8);
        let old = t.allocator().reserve().unwrap();
        t.insert(old, "old").unwrap();
        t.remove(old);
        let new = t.allocator().reserve().unwrap();
        t.insert(new, "new").unwrap();

        assert_eq!(t.get(old), None);
        assert!(t.get_mut(old).is_none());
        assert_eq!(t.remove(old), None);
        assert_eq!(t.get(new), Some(&"new"));
    }

    #[test]
    fn insert_rejects_stale_and_occupied() {
        let mut t = table(8);
        let h = t.allocator().reserve().unwrap();
        t.insert(h, "x").unwrap();
        assert!(matches!(t.insert(h, "y"), Err(HandleError::Occupied { .. })));
        t.remove(h);
        assert!(matches!(t.insert(h, "z"), Err(HandleError::Stale { .. })));
        assert!(matches!(
            t.insert(Handle::INVALID, "w"),
            Err(HandleError::Stale { .. })
        ));
    }

    #[test]
    fn release_recycles_reserved_but_empty_slot() {
        let mut t = table(1);
        let h = t.allocator().reserve().unwrap();
        assert!(t.allocator().reserve().is_err());
        assert_eq!(t.release(h), (None, true));
        assert_eq!(t.release(h), (None, false));
        assert!(t.allocator().reserve().is_ok());
    }

    #[test]
    fn exhaustion_is_reported() {
        let alloc = HandleAllocator::new(2);
        alloc.reserve().unwrap();
        alloc.reserve().unwrap();
        assert!(matches!(
            alloc.reserve(),
            Err(HandleError::Exhausted { capacity: 2 })
        ));
    }

    #[test]
    fn iter_reports_live_objects_in_slot_order() {
        let mut t = table(8);
        let a = t.allocator().reserve().unwrap();
        let b = t.allocator().reserve().unwrap();
        let c = t.allocator().reserve().unwrap();
        t.insert(a, "a").unwrap();
        t.insert(b, "b").unwrap();
        t.insert(c, "c").unwrap();
        t.remove(b);
        let seen: Vec<_> = t.iter().collect();
        assert_eq!(seen, vec![(a, &"a"), (c, &"c")]);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn handle_roundtrip_and_sentinel() {
        let h = Handle::new(42, 7);
        assert_eq!(h.index(), 42);
        assert_eq!(h.generation(), 7);
        assert_eq!(Handle::from_raw(h.to_raw()), h);
        assert!(!Handle::INVALID.is_valid());
        assert_eq!(Handle::default(), Handle::INVALID);
        assert_eq!(format!("{:?}", Handle::INVALID), "Handle(invalid)");
        assert_eq!(format!("{h}"), "42v7");
    }
}

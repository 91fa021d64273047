//! In-memory dedupe index: hash-ordered and locator-ordered maps over one
//! slot arena, with an arena-linked LRU list.
//!
//! Every entry lives in exactly one slot. The two `BTreeMap`s and the recency
//! list only store [`EntryHandle`]s into that arena, so all three views are
//! updated together and can never disagree about membership.
//!
//! The index is not thread-safe on its own; [`crate::DedupEngine`] serializes
//! access behind its lock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::ContentHash;
use crate::error::{DedupError, DedupResult};

/// Physical extent a dedupe entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Extent start address. 0 is reserved as "no extent".
    pub locator: u64,
    /// Extent length in bytes.
    pub length: u64,
}

impl Extent {
    /// Create an extent reference.
    pub fn new(locator: u64, length: u64) -> Self {
        Self { locator, length }
    }
}

/// Copy of one index entry. Never a handle into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// Content hash of the block stored at `extent`.
    pub hash: ContentHash,
    /// Where the block lives.
    pub extent: Extent,
}

/// Result of [`DedupIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new entry was linked at the recency head.
    Inserted,
    /// Another entry already maps this hash; the new one was dropped.
    DuplicateHash,
    /// Another entry already covers this extent; the new one was dropped.
    DuplicateLocator,
}

/// Stable handle of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EntryHandle(u32);

impl EntryHandle {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

struct Slot {
    entry: DedupEntry,
    /// Towards the head (more recently used).
    prev: Option<EntryHandle>,
    /// Towards the tail (less recently used).
    next: Option<EntryHandle>,
}

/// Bounded-by-caller dedupe index. See the module docs.
#[derive(Default)]
pub struct DedupIndex {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<u32>,
    by_hash: BTreeMap<ContentHash, EntryHandle>,
    by_locator: BTreeMap<u64, EntryHandle>,
    head: Option<EntryHandle>,
    tail: Option<EntryHandle>,
}

impl DedupIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.by_locator.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.by_locator.is_empty()
    }

    /// Insert a new hash → extent mapping at the recency head.
    ///
    /// The locator constraint is checked before the hash constraint. On a
    /// duplicate nothing is changed. Fails only when the arena cannot grow.
    pub fn insert(&mut self, hash: &ContentHash, extent: Extent) -> DedupResult<InsertOutcome> {
        if self.by_locator.contains_key(&extent.locator) {
            return Ok(InsertOutcome::DuplicateLocator);
        }
        if self.by_hash.contains_key(hash) {
            return Ok(InsertOutcome::DuplicateHash);
        }

        let handle = self.alloc_slot(DedupEntry {
            hash: hash.clone(),
            extent,
        })?;
        self.by_locator.insert(extent.locator, handle);
        self.by_hash.insert(hash.clone(), handle);
        self.link_head(handle);
        Ok(InsertOutcome::Inserted)
    }

    /// Look up by hash and promote the hit to the recency head.
    pub fn find_by_hash(&mut self, hash: &ContentHash) -> Option<DedupEntry> {
        let handle = *self.by_hash.get(hash)?;
        self.unlink(handle);
        self.link_head(handle);
        self.entry(handle).cloned()
    }

    /// Look up by locator without touching recency.
    pub fn find_by_locator(&self, locator: u64) -> Option<DedupEntry> {
        let handle = *self.by_locator.get(&locator)?;
        self.entry(handle).cloned()
    }

    /// Remove the entry for `locator`. Returns false if there was none.
    pub fn remove_by_locator(&mut self, locator: u64) -> bool {
        match self.by_locator.get(&locator).copied() {
            Some(handle) => self.remove_handle(handle).is_some(),
            None => false,
        }
    }

    /// Remove and return the least-recently-touched entry.
    pub fn evict_tail(&mut self) -> Option<DedupEntry> {
        let tail = self.tail?;
        self.remove_handle(tail)
    }

    /// Copies of every entry from most to least recently touched.
    pub fn recency_order(&self) -> Vec<DedupEntry> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let Some(slot) = self.slot(handle) else { break };
            out.push(slot.entry.clone());
            cursor = slot.next;
        }
        out
    }

    /// Drop every entry and release the arena.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn alloc_slot(&mut self, entry: DedupEntry) -> DedupResult<EntryHandle> {
        let slot = Slot {
            entry,
            prev: None,
            next: None,
        };
        if let Some(free) = self.free_slots.pop() {
            self.slots[free as usize] = Some(slot);
            return Ok(EntryHandle(free));
        }
        let raw = u32::try_from(self.slots.len()).map_err(|_| DedupError::ResourceExhausted)?;
        self.slots
            .try_reserve(1)
            .map_err(|_| DedupError::ResourceExhausted)?;
        self.slots.push(Some(slot));
        Ok(EntryHandle(raw))
    }

    fn remove_handle(&mut self, handle: EntryHandle) -> Option<DedupEntry> {
        self.unlink(handle);
        let slot = self.slots.get_mut(handle.idx())?.take()?;
        self.by_locator.remove(&slot.entry.extent.locator);
        self.by_hash.remove(&slot.entry.hash);
        self.free_slots.push(handle.0);
        Some(slot.entry)
    }

    fn link_head(&mut self, handle: EntryHandle) {
        let old_head = self.head;
        if let Some(slot) = self.slot_mut(handle) {
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head.and_then(|h| self.slot_mut(h)) {
            Some(old) => old.prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
    }

    fn unlink(&mut self, handle: EntryHandle) {
        let Some((prev, next)) = self.slot(handle).map(|s| (s.prev, s.next)) else {
            return;
        };
        match prev.and_then(|p| self.slot_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
        if let Some(slot) = self.slot_mut(handle) {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn entry(&self, handle: EntryHandle) -> Option<&DedupEntry> {
        self.slot(handle).map(|s| &s.entry)
    }

    fn slot(&self, handle: EntryHandle) -> Option<&Slot> {
        self.slots.get(handle.idx())?.as_ref()
    }

    fn slot_mut(&mut self, handle: EntryHandle) -> Option<&mut Slot> {
        self.slots.get_mut(handle.idx())?.as_mut()
    }
}

impl std::fmt::Debug for DedupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupIndex")
            .field("entries", &self.len())
            .field("arena_slots", &self.slots.len())
            .field("free_slots", &self.free_slots.len())
            .finish()
    }
}

//! Bounded frame cache.
//!
//! [`FrameCache`] keeps decoded raw + binarized buffer pairs for recently
//! touched layer indices, loading lazily from the [`LayerStore`] and
//! evicting least-recently-used entries once a memory budget is reached.
//! The binarization (and the optional raw-buffer discard when anti-aliasing
//! is stripped) is a post-load transform fixed at construction and applied
//! to every freshly loaded entry.
//!
//! One index may be pinned at a time - the window seed the stacking loop
//! will read next - so it survives the eviction triggered by prefetching
//! its successor. Evicted slots drop their buffers immediately; borrowed
//! frames are only valid until the next [`FrameCache::fetch`].

use crate::buffer::{Frame, BINARIZE_THRESHOLD};
use crate::store::LayerStore;
use crate::{Error, Result};
use std::collections::HashMap;

/// Post-load transform: maps a freshly decoded raw buffer to the pair of
/// buffers the cache retains (`None` raw means the binarized buffer stands
/// in for it).
pub type LoadTransform = Box<dyn Fn(Frame) -> (Option<Frame>, Frame) + Send + Sync>;

/// One resident cache entry.
pub struct CacheSlot {
    raw: Option<Frame>,
    binarized: Frame,
    last_access: u64,
}

impl CacheSlot {
    /// The raw buffer, or the binarized buffer when the raw one was
    /// discarded at load time.
    #[inline]
    pub fn raw(&self) -> &Frame {
        self.raw.as_ref().unwrap_or(&self.binarized)
    }

    /// The thresholded comparison buffer.
    #[inline]
    pub fn binarized(&self) -> &Frame {
        &self.binarized
    }
}

/// Bounded LRU cache of decoded layer buffers.
pub struct FrameCache<'a> {
    store: &'a LayerStore,
    slots: HashMap<usize, CacheSlot>,
    capacity: usize,
    clock: u64,
    pinned: Option<usize>,
    transform: LoadTransform,
}

impl<'a> FrameCache<'a> {
    /// Create a cache over `store` bounded by `ram_budget` bytes.
    ///
    /// Capacity is the budget divided by the per-entry footprint (one or
    /// two single-channel buffers at the store resolution, depending on
    /// `strip_antialiasing`), with a floor of two entries so the scan can
    /// always hold a comparison pair.
    pub fn new(store: &'a LayerStore, ram_budget: usize, strip_antialiasing: bool) -> Self {
        let transform: LoadTransform = if strip_antialiasing {
            Box::new(|raw: Frame| (None, raw.threshold(BINARIZE_THRESHOLD)))
        } else {
            Box::new(|raw: Frame| {
                let binarized = raw.threshold(BINARIZE_THRESHOLD);
                (Some(raw), binarized)
            })
        };
        let slots_per_entry = if strip_antialiasing { 1 } else { 2 };
        Self::with_transform(store, ram_budget, slots_per_entry, transform)
    }

    /// Create a cache with an explicit per-entry buffer count and post-load
    /// transform.
    pub fn with_transform(
        store: &'a LayerStore,
        ram_budget: usize,
        slots_per_entry: usize,
        transform: LoadTransform,
    ) -> Self {
        let (w, h) = store.resolution();
        let entry_bytes = (w * h * slots_per_entry).max(1);
        // Floor of two: the scan always compares a window tail against its
        // successor, so a pair must fit regardless of the budget.
        let capacity = (ram_budget / entry_bytes).max(2);
        Self {
            store,
            slots: HashMap::new(),
            capacity,
            clock: 0,
            pinned: None,
            transform,
        }
    }

    /// Maximum number of resident entries.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently resident entries.
    #[inline]
    pub fn resident_count(&self) -> usize {
        self.slots.len()
    }

    /// Pin `index` so it survives eviction; replaces any previous pin.
    pub fn pin(&mut self, index: usize) {
        self.pinned = Some(index);
    }

    /// Ensure `index` is resident, loading and evicting as needed.
    pub fn fetch(&mut self, index: usize) -> Result<()> {
        if index >= self.store.layer_count() {
            return Err(Error::Project(format!(
                "layer index {index} out of range ({} layers)",
                self.store.layer_count()
            )));
        }
        self.clock += 1;
        let clock = self.clock;
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.last_access = clock;
            return Ok(());
        }
        while self.slots.len() >= self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
        let (raw, binarized) = (self.transform)(self.store.buffer(index).clone());
        self.slots.insert(
            index,
            CacheSlot {
                raw,
                binarized,
                last_access: clock,
            },
        );
        Ok(())
    }

    /// Borrow a resident slot without touching the access order.
    pub fn slot(&self, index: usize) -> Option<&CacheSlot> {
        self.slots.get(&index)
    }

    /// Fetch and borrow the raw buffer for `index`.
    pub fn get(&mut self, index: usize) -> Result<&Frame> {
        self.fetch(index)?;
        Ok(self.slots[&index].raw())
    }

    /// Fetch and borrow the (raw, binarized) pair for `index`.
    pub fn get_pair(&mut self, index: usize) -> Result<(&Frame, &Frame)> {
        self.fetch(index)?;
        let slot = &self.slots[&index];
        Ok((slot.raw(), slot.binarized()))
    }

    /// Fetch two indices and borrow both slots. `keep` is pinned first so
    /// loading `other` cannot evict it.
    pub fn fetch_pair(&mut self, keep: usize, other: usize) -> Result<(&CacheSlot, &CacheSlot)> {
        self.pin(keep);
        self.fetch(keep)?;
        self.fetch(other)?;
        let a = self.slots.get(&keep).ok_or_else(|| evicted(keep))?;
        let b = self.slots.get(&other).ok_or_else(|| evicted(other))?;
        Ok((a, b))
    }

    /// Drop the least-recently-used non-pinned slot. Returns false when
    /// nothing is evictable (everything resident is pinned).
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|(&i, _)| Some(i) != self.pinned)
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(&i, _)| i);
        match victim {
            Some(i) => {
                // Dropping the slot releases both buffers right here.
                self.slots.remove(&i);
                true
            }
            None => false,
        }
    }
}

fn evicted(index: usize) -> Error {
    Error::Project(format!("cache entry {index} evicted while in use"))
}

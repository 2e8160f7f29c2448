//! Per-delta BAT cache.
//!
//! Caches the delta's Block Allocation Table at page granularity. Pages are
//! demand-loaded, dirtied in place, and written back by the metadata
//! pipeline; only clean, unpinned pages are evictable. The page lock is
//! never held across device I/O.

use parking_lot::Mutex;
use ploop_block::ByteDevice;
use ploop_error::{PloopError, Result};
use ploop_ondisk::{BatGeometry, PageVerdict, decode_bat_page, encode_bat_page};
use ploop_types::{BAT_PAGE_SIZE, ClusterShift, Generation};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Lifecycle of one cached BAT page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Clean,
    Dirty,
    /// Snapshotted by an in-flight commit transaction. A `set_entry` during
    /// this window re-dirties the page for the next transaction.
    Writing,
}

#[derive(Debug)]
struct PageSlot {
    entries: Vec<u32>,
    state: PageState,
    pins: u32,
    last_use: u64,
}

#[derive(Debug)]
struct BatCacheState {
    pages: HashMap<u32, PageSlot>,
    lru_tick: u64,
    dirty_pages: usize,
}

impl BatCacheState {
    fn touch(&mut self, page: u32) {
        self.lru_tick = self.lru_tick.wrapping_add(1);
        let tick = self.lru_tick;
        if let Some(slot) = self.pages.get_mut(&page) {
            slot.last_use = tick;
        }
    }

    /// Drop clean, unpinned pages until residency fits `limit`.
    fn evict_to_limit(&mut self, limit: usize) -> usize {
        let mut evicted = 0_usize;
        while self.pages.len() > limit {
            let candidate = self
                .pages
                .iter()
                .filter(|(_, slot)| slot.state == PageState::Clean && slot.pins == 0)
                .min_by_key(|(_, slot)| slot.last_use)
                .map(|(&page, _)| page);
            let Some(page) = candidate else { break };
            self.pages.remove(&page);
            evicted += 1;
        }
        evicted
    }
}

/// Outcome of a `set_entry` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatUpdate {
    /// Page that now carries the entry.
    pub page: u32,
    /// Whether this call moved the page from clean to dirty.
    pub newly_dirtied: bool,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatCacheStats {
    pub resident_pages: usize,
    pub dirty_pages: usize,
}

/// In-memory image of one delta's BAT.
#[derive(Debug)]
pub struct BatCache {
    device: Arc<dyn ByteDevice>,
    geometry: Mutex<BatGeometry>,
    /// Highest durably committed generation; the stamp bound applied when
    /// decoding pages read from disk.
    decode_generation: AtomicU64,
    state: Mutex<BatCacheState>,
    resident_limit: usize,
}

impl BatCache {
    pub fn new(
        device: Arc<dyn ByteDevice>,
        geometry: BatGeometry,
        durable_generation: Generation,
        resident_limit: usize,
    ) -> Self {
        Self {
            device,
            geometry: Mutex::new(geometry),
            decode_generation: AtomicU64::new(durable_generation.0),
            state: Mutex::new(BatCacheState {
                pages: HashMap::new(),
                lru_tick: 0,
                dirty_pages: 0,
            }),
            resident_limit: resident_limit.max(1),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> BatGeometry {
        *self.geometry.lock()
    }

    #[must_use]
    pub fn durable_generation(&self) -> Generation {
        Generation(self.decode_generation.load(Ordering::Acquire))
    }

    /// Record that `generation` is durable on disk; later page loads accept
    /// stamps up to it.
    pub fn set_durable_generation(&self, generation: Generation) {
        self.decode_generation
            .fetch_max(generation.0, Ordering::AcqRel);
    }

    /// Read the raw BAT entry for `entry_idx`, loading its page on miss.
    pub fn entry(&self, entry_idx: u32) -> Result<u32> {
        let geometry = self.geometry();
        if entry_idx >= geometry.bat_entries {
            return Err(PloopError::Format(format!(
                "BAT entry {entry_idx} out of range ({} entries)",
                geometry.bat_entries
            )));
        }
        let (page, slot_idx) = geometry.locate(entry_idx);

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.pages.get(&page) {
                let value = slot.entries[slot_idx];
                state.touch(page);
                return Ok(value);
            }
        }

        let entries = self.load_page(&geometry, page)?;
        let value = entries[slot_idx];

        let mut state = self.state.lock();
        // Another thread may have loaded (and even dirtied) the page while
        // we read; its copy wins.
        if let Some(slot) = state.pages.get(&page) {
            let value = slot.entries[slot_idx];
            state.touch(page);
            return Ok(value);
        }
        state.lru_tick = state.lru_tick.wrapping_add(1);
        let tick = state.lru_tick;
        state.pages.insert(
            page,
            PageSlot {
                entries,
                state: PageState::Clean,
                pins: 0,
                last_use: tick,
            },
        );
        let evicted = state.evict_to_limit(self.resident_limit);
        if evicted > 0 {
            trace!(target: "ploop::bat", event = "pages_evicted", evicted);
        }
        Ok(value)
    }

    /// Update the BAT entry for `entry_idx`, dirtying its page.
    pub fn set_entry(&self, entry_idx: u32, value: u32) -> Result<BatUpdate> {
        let geometry = self.geometry();
        if entry_idx >= geometry.bat_entries {
            return Err(PloopError::Format(format!(
                "BAT entry {entry_idx} out of range ({} entries)",
                geometry.bat_entries
            )));
        }
        let (page, slot_idx) = geometry.locate(entry_idx);

        loop {
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if let Some(slot) = state.pages.get_mut(&page) {
                    slot.entries[slot_idx] = value;
                    let newly_dirtied = match slot.state {
                        // `Writing` means a commit snapshot is already
                        // taken; this change rides the next transaction.
                        PageState::Clean | PageState::Writing => {
                            slot.state = PageState::Dirty;
                            true
                        }
                        PageState::Dirty => false,
                    };
                    if newly_dirtied {
                        state.dirty_pages += 1;
                    }
                    state.touch(page);
                    let evicted = state.evict_to_limit(self.resident_limit);
                    if evicted > 0 {
                        trace!(target: "ploop::bat", event = "pages_evicted", evicted);
                    }
                    trace!(
                        target: "ploop::bat",
                        event = "bat_entry_set",
                        entry = entry_idx,
                        value,
                        page,
                        newly_dirtied
                    );
                    return Ok(BatUpdate {
                        page,
                        newly_dirtied,
                    });
                }
            }

            // Fault the page in without the lock, then retry the mutation.
            // Eviction is deferred to the mutation pass so the fresh page
            // cannot be dropped before it is dirtied.
            let entries = self.load_page(&geometry, page)?;
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.pages.contains_key(&page) {
                state.lru_tick = state.lru_tick.wrapping_add(1);
                let tick = state.lru_tick;
                state.pages.insert(
                    page,
                    PageSlot {
                        entries,
                        state: PageState::Clean,
                        pins: 0,
                        last_use: tick,
                    },
                );
            }
        }
    }

    /// Encode `page` for a commit transaction with stamp `stamp`.
    ///
    /// Transitions the page to `Writing` and pins it; the pipeline calls
    /// [`Self::finish_page_commit`] once the transaction resolves.
    pub fn snapshot_page_for_commit(&self, page: u32, stamp: Generation) -> Result<Vec<u8>> {
        let geometry = self.geometry();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = state
            .pages
            .get_mut(&page)
            .ok_or_else(|| PloopError::Format(format!("dirty BAT page {page} not resident")))?;
        let was_dirty = slot.state == PageState::Dirty;
        if was_dirty {
            slot.state = PageState::Writing;
        }
        slot.pins += 1;
        let used = geometry.entries_in_page(page);
        let encoded = encode_bat_page(stamp, &slot.entries[..used])?;
        if was_dirty {
            state.dirty_pages = state.dirty_pages.saturating_sub(1);
        }
        Ok(encoded)
    }

    /// Resolve a page's commit: back to `Clean` when the write stuck and no
    /// re-dirty happened, back to `Dirty` otherwise.
    pub fn finish_page_commit(&self, page: u32, durable: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(slot) = state.pages.get_mut(&page) {
            slot.pins = slot.pins.saturating_sub(1);
            match slot.state {
                PageState::Writing => {
                    if durable {
                        slot.state = PageState::Clean;
                    } else {
                        slot.state = PageState::Dirty;
                        state.dirty_pages += 1;
                    }
                }
                // Re-dirtied mid-commit; the next transaction owns it.
                PageState::Dirty | PageState::Clean => {}
            }
        }
    }

    /// Pages currently dirty, ascending.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut pages: Vec<u32> = state
            .pages
            .iter()
            .filter(|(_, slot)| slot.state == PageState::Dirty)
            .map(|(&page, _)| page)
            .collect();
        pages.sort_unstable();
        pages
    }

    #[must_use]
    pub fn stats(&self) -> BatCacheStats {
        let state = self.state.lock();
        BatCacheStats {
            resident_pages: state.pages.len(),
            dirty_pages: state.dirty_pages,
        }
    }

    /// Extend the BAT for a grown virtual size.
    ///
    /// New pages are created resident and dirty (all-hole); the caller
    /// commits them together with the header change. Caller must hold the
    /// stack quiescent.
    pub fn grow(&self, new_bat_entries: u32) -> Result<Vec<u32>> {
        let mut geometry = self.geometry.lock();
        if new_bat_entries < geometry.bat_entries {
            return Err(PloopError::Format(
                "BAT shrink is not supported".to_owned(),
            ));
        }
        let old_pages = geometry.bat_pages;
        *geometry = BatGeometry::new(geometry.cluster_shift, new_bat_entries);
        let new_pages = geometry.bat_pages;
        drop(geometry);

        let mut added = Vec::new();
        let mut state = self.state.lock();
        for page in old_pages..new_pages {
            state.lru_tick = state.lru_tick.wrapping_add(1);
            let tick = state.lru_tick;
            state.pages.insert(
                page,
                PageSlot {
                    entries: vec![0_u32; ploop_types::BAT_ENTRIES_PER_PAGE],
                    state: PageState::Dirty,
                    pins: 0,
                    last_use: tick,
                },
            );
            state.dirty_pages += 1;
            added.push(page);
        }
        debug!(
            target: "ploop::bat",
            event = "bat_grown",
            old_pages,
            new_pages,
            entries = new_bat_entries
        );
        Ok(added)
    }

    /// All non-hole `(entry, value)` pairs. Control operations (merge, BAT
    /// grow) use this scan; user I/O never does.
    pub fn scan_mapped(&self) -> Result<Vec<(u32, u32)>> {
        let geometry = self.geometry();
        let mut mapped = Vec::new();
        for entry in 0..geometry.bat_entries {
            let value = self.entry(entry)?;
            if value != 0 {
                mapped.push((entry, value));
            }
        }
        Ok(mapped)
    }

    fn load_page(&self, geometry: &BatGeometry, page: u32) -> Result<Vec<u32>> {
        let mut raw = vec![0_u8; BAT_PAGE_SIZE];
        self.device
            .read_exact_at(geometry.page_byte_offset(page), &mut raw)?;
        let image = decode_bat_page(&raw, self.durable_generation())?;
        match image.verdict {
            PageVerdict::Valid => {}
            PageVerdict::StaleHeader => {
                warn!(
                    target: "ploop::bat",
                    event = "bat_page_rolled_back",
                    page,
                    stamp = image.stamp.0,
                    durable = self.durable_generation().0
                );
            }
            PageVerdict::BadCrc => {
                warn!(target: "ploop::bat", event = "bat_page_crc_mismatch", page);
            }
        }
        trace!(target: "ploop::bat", event = "bat_page_loaded", page, verdict = ?image.verdict);
        Ok(image.entries)
    }
}

/// Bootstrap helper: write an all-hole, stamped BAT region for a fresh image.
pub fn write_empty_bat(
    device: &dyn ByteDevice,
    cluster_shift: ClusterShift,
    bat_entries: u32,
    stamp: Generation,
) -> Result<()> {
    let geometry = BatGeometry::new(cluster_shift, bat_entries);
    let page = encode_bat_page(stamp, &[])?;
    for index in 0..geometry.bat_pages {
        device.write_all_at(geometry.page_byte_offset(index), &page)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::MemDevice;

    fn shift() -> ClusterShift {
        ClusterShift::new(3).expect("4 KiB shift")
    }

    fn cache_over(entries: u32) -> (Arc<MemDevice>, BatCache) {
        let device = MemDevice::new(64 * 1024);
        write_empty_bat(device.as_ref(), shift(), entries, Generation(0)).expect("bootstrap");
        let geometry = BatGeometry::new(shift(), entries);
        let cache = BatCache::new(device.clone(), geometry, Generation(0), 8);
        (device, cache)
    }

    #[test]
    fn fresh_bat_reads_as_holes() {
        let (_device, cache) = cache_over(100);
        for entry in 0..100 {
            assert_eq!(cache.entry(entry).expect("entry"), 0);
        }
        assert_eq!(cache.stats().dirty_pages, 0);
    }

    #[test]
    fn set_entry_dirties_once_per_page() {
        let (_device, cache) = cache_over(100);
        let first = cache.set_entry(3, 7).expect("set");
        assert!(first.newly_dirtied);
        let second = cache.set_entry(4, 8).expect("set");
        assert!(!second.newly_dirtied);
        assert_eq!(first.page, second.page);
        assert_eq!(cache.dirty_pages(), vec![0]);
    }

    #[test]
    fn commit_cycle_returns_page_to_clean() {
        let (device, cache) = cache_over(100);
        cache.set_entry(5, 9).expect("set");
        let encoded = cache
            .snapshot_page_for_commit(0, Generation(1))
            .expect("snapshot");
        device
            .write_all_at(cache.geometry().page_byte_offset(0), &encoded)
            .expect("write back");
        cache.finish_page_commit(0, true);
        cache.set_durable_generation(Generation(1));
        assert!(cache.dirty_pages().is_empty());

        // A re-read from disk (post-eviction) must see the committed entry.
        let fresh = BatCache::new(device, cache.geometry(), Generation(1), 8);
        assert_eq!(fresh.entry(5).expect("entry"), 9);
    }

    #[test]
    fn redirty_during_commit_stays_dirty() {
        let (_device, cache) = cache_over(100);
        cache.set_entry(5, 9).expect("set");
        let _encoded = cache
            .snapshot_page_for_commit(0, Generation(1))
            .expect("snapshot");
        cache.set_entry(6, 10).expect("re-dirty");
        cache.finish_page_commit(0, true);
        assert_eq!(cache.dirty_pages(), vec![0]);
    }

    #[test]
    fn failed_commit_keeps_page_dirty() {
        let (_device, cache) = cache_over(100);
        cache.set_entry(5, 9).expect("set");
        let _encoded = cache
            .snapshot_page_for_commit(0, Generation(1))
            .expect("snapshot");
        cache.finish_page_commit(0, false);
        assert_eq!(cache.dirty_pages(), vec![0]);
    }

    #[test]
    fn eviction_skips_dirty_pages() {
        // 3000 entries span 3 pages; limit of 1 forces eviction pressure.
        let device = MemDevice::new(64 * 1024);
        write_empty_bat(device.as_ref(), shift(), 3000, Generation(0)).expect("bootstrap");
        let cache = BatCache::new(
            device,
            BatGeometry::new(shift(), 3000),
            Generation(0),
            1,
        );
        cache.set_entry(0, 11).expect("dirty page 0");
        cache.entry(1020).expect("load page 1");
        cache.entry(2040).expect("load page 2");
        // Page 0 is dirty and must have survived the pressure.
        assert_eq!(cache.dirty_pages(), vec![0]);
        assert_eq!(cache.entry(0).expect("entry"), 11);
    }

    #[test]
    fn grow_adds_dirty_hole_pages() {
        let (_device, cache) = cache_over(100);
        let added = cache.grow(3000).expect("grow");
        assert_eq!(added, vec![1, 2]);
        assert_eq!(cache.geometry().bat_pages, 3);
        assert_eq!(cache.entry(2999).expect("entry"), 0);
        assert_eq!(cache.dirty_pages(), vec![1, 2]);
    }
}

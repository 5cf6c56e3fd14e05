//! Content-addressed, multi-cell cache of decoded bitmaps referenced by
//! MEMBLT / MEM3BLT / CacheBitmap v1-v3 orders.
//!
//! Every operation is bounds-checked and never panics: XP-era servers
//! legitimately reference cache slots they never populated, and the
//! dispatcher must tolerate that silently (spec §4.4, Scenario 5).

use log::error;

use crate::errors::RdpError;

/// A decoded bitmap installed into a cache slot.
#[derive(Debug, Clone)]
pub struct Bitmap {
    pub width: u16,
    pub height: u16,
    pub bpp: u8,
    /// Content hash used as the persistent store's primary key; `0` for
    /// v1 orders, which carry no key.
    pub key64: u64,
    pub pixels: Vec<u8>,
}

/// One indexable array of decoded bitmaps. `entries` has `capacity + 1`
/// slots; slot `capacity` is the waiting-list slot (spec §3).
pub struct Cell {
    capacity: usize,
    entries: Vec<Option<Bitmap>>,
}

/// Reserved index selecting a cell's overflow (waiting-list) slot.
pub const WAITING_LIST_INDEX: u16 = 0x7FFF;

impl Cell {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity + 1);
        entries.resize_with(capacity + 1, || None);
        Self { capacity, entries }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn resolve_index(&self, index: u16) -> usize {
        if index == WAITING_LIST_INDEX {
            self.capacity
        } else {
            index as usize
        }
    }

    fn in_range(&self, resolved: usize) -> bool {
        resolved <= self.capacity
    }

    /// Frees any prior occupant and installs `bitmap` at `index`. Unified
    /// per spec §9 Open Question (b): both put and get use the same
    /// `>= max_cells`-style bound (`resolved > capacity` here, since a
    /// cell's own range check does not need the cross-cell `max_cells`
    /// comparison the dispatcher applies).
    pub fn put(&mut self, index: u16, bitmap: Bitmap) -> bool {
        let resolved = self.resolve_index(index);
        if !self.in_range(resolved) {
            return false;
        }
        self.entries[resolved] = Some(bitmap);
        true
    }

    /// Symmetric to `put`. Returns `None` both for out-of-range slots and
    /// for slots that were never populated — the caller cannot and need
    /// not distinguish the two (spec §4.4).
    pub fn get(&self, index: u16) -> Option<&Bitmap> {
        let resolved = self.resolve_index(index);
        if !self.in_range(resolved) {
            return None;
        }
        self.entries[resolved].as_ref()
    }

    /// Frees the slot without requiring a replacement bitmap.
    pub fn clear(&mut self, index: u16) -> bool {
        let resolved = self.resolve_index(index);
        if !self.in_range(resolved) {
            return false;
        }
        self.entries[resolved] = None;
        true
    }

    fn non_empty_entries(&self) -> impl Iterator<Item = (usize, &Bitmap)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|bmp| (idx, bmp)))
    }
}

/// An ordered vector of `Cell`s, configurable count (spec §3, typically
/// 2-5).
pub struct BitmapCache {
    cells: Vec<Cell>,
    session_bpp: u8,
}

impl BitmapCache {
    pub fn new(cell_capacities: &[usize], session_bpp: u8) -> Self {
        Self {
            cells: cell_capacities.iter().map(|cap| Cell::new(*cap)).collect(),
            session_bpp,
        }
    }

    pub fn max_cells(&self) -> usize {
        self.cells.len()
    }

    /// `put(cell_id, index, bitmap)` from spec §4.4. `cell_id` must be in
    /// `[0, max_cells)`; out of range is a logged error returning
    /// failure, never a panic.
    pub fn put(&mut self, cell_id: usize, index: u16, bitmap: Bitmap) -> Result<(), RdpError> {
        if cell_id >= self.max_cells() {
            error!("bitmap cache put: cell {cell_id} is out of range ({} cells)", self.max_cells());
            return Err(RdpError::BadConfiguration(format!(
                "cell {cell_id} out of range"
            )));
        }
        if self.cells[cell_id].put(index, bitmap) {
            Ok(())
        } else {
            error!("bitmap cache put: index {index} out of range for cell {cell_id}");
            Err(RdpError::BadConfiguration(format!(
                "index {index} out of range for cell {cell_id}"
            )))
        }
    }

    /// `get(cell_id, index)`, symmetric to `put`. A get for an
    /// out-of-range cell or an unpopulated slot returns "absent" rather
    /// than an error (spec §4.4, Scenario 5).
    pub fn get(&self, cell_id: usize, index: u16) -> Option<&Bitmap> {
        if cell_id >= self.max_cells() {
            return None;
        }
        self.cells[cell_id].get(index)
    }

    /// Applies the BPP defaulting rule from spec §4.4: zero inherits the
    /// session color depth; a 16-bpp order on a 15-bpp session is
    /// coerced down to 15.
    pub fn normalize_bpp(&self, order_bpp: u8) -> u8 {
        if order_bpp == 0 {
            self.session_bpp
        } else if self.session_bpp == 15 && order_bpp == 16 {
            15
        } else {
            order_bpp
        }
    }

    /// Iterates non-empty, keyed entries across every cell, for the
    /// persistent-cache flush in spec §4.4.
    pub fn keyed_entries(&self) -> impl Iterator<Item = (usize, usize, &Bitmap)> {
        self.cells.iter().enumerate().flat_map(|(cell_id, cell)| {
            cell.non_empty_entries()
                .filter(|(_, bmp)| bmp.key64 != 0)
                .map(move |(idx, bmp)| (cell_id, idx, bmp))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bmp(key64: u64) -> Bitmap {
        Bitmap {
            width: 16,
            height: 16,
            bpp: 16,
            key64,
            pixels: vec![0u8; 16 * 16 * 2],
        }
    }

    #[test]
    fn put_then_get_returns_installed_bitmap() {
        let mut cache = BitmapCache::new(&[10], 16);
        cache.put(0, 2, bmp(42)).unwrap();
        assert_eq!(cache.get(0, 2).unwrap().key64, 42);
    }

    #[test]
    fn get_on_out_of_range_cell_is_absent_not_error() {
        let cache = BitmapCache::new(&[10], 16);
        assert!(cache.get(99, 0).is_none());
    }

    #[test]
    fn put_on_out_of_range_cell_fails_without_panicking() {
        let mut cache = BitmapCache::new(&[10], 16);
        assert!(cache.put(99, 0, bmp(1)).is_err());
    }

    #[test]
    fn get_on_unpopulated_slot_is_absent() {
        let cache = BitmapCache::new(&[10], 16);
        assert!(cache.get(0, 5).is_none());
    }

    #[test]
    fn scenario_4_waiting_list_aliasing() {
        let mut cache = BitmapCache::new(&[10], 16);
        cache.put(0, WAITING_LIST_INDEX, bmp(7)).unwrap();
        assert_eq!(cache.get(0, WAITING_LIST_INDEX).unwrap().key64, 7);
        assert_eq!(cache.get(0, 10).unwrap().key64, 7);
    }

    #[test]
    fn scenario_5_xp_sp2_tolerance() {
        let cache = BitmapCache::new(&[5, 5, 5], 16);
        // MEMBLT references (cell=2, idx=7) with nothing installed.
        assert!(cache.get(2, 7).is_none());
    }

    #[test]
    fn put_followed_by_put_frees_first_bitmap_once() {
        let mut cache = BitmapCache::new(&[10], 16);
        cache.put(0, 3, bmp(1)).unwrap();
        cache.put(0, 3, bmp(2)).unwrap();
        assert_eq!(cache.get(0, 3).unwrap().key64, 2);
    }

    #[test]
    fn scenario_6_bpp_coercion() {
        let cache = BitmapCache::new(&[10], 15);
        assert_eq!(cache.normalize_bpp(16), 15);
    }

    #[test]
    fn bpp_zero_inherits_session_depth() {
        let cache = BitmapCache::new(&[10], 24);
        assert_eq!(cache.normalize_bpp(0), 24);
    }

    #[test]
    fn bpp_otherwise_passes_through() {
        let cache = BitmapCache::new(&[10], 24);
        assert_eq!(cache.normalize_bpp(8), 8);
    }

    #[test]
    fn clear_frees_a_populated_slot() {
        let mut cache = BitmapCache::new(&[10], 16);
        cache.put(0, 1, bmp(5)).unwrap();
        assert!(cache.cells[0].clear(1));
        assert!(cache.get(0, 1).is_none());
    }

    #[test]
    fn index_equal_to_capacity_without_waiting_list_constant_is_in_range() {
        // idx in [0, cell.capacity] per spec §3; capacity itself is the
        // waiting-list slot and is independently addressable.
        let mut cache = BitmapCache::new(&[4], 16);
        assert!(cache.put(0, 4, bmp(9)).is_ok());
    }

    #[test]
    fn index_past_capacity_is_out_of_range() {
        let mut cache = BitmapCache::new(&[4], 16);
        assert!(cache.put(0, 5, bmp(9)).is_err());
    }

    #[test]
    fn keyed_entries_skips_zero_key_and_empty_slots() {
        let mut cache = BitmapCache::new(&[4], 16);
        cache.put(0, 0, bmp(0)).unwrap();
        cache.put(0, 1, bmp(99)).unwrap();
        let keyed: Vec<_> = cache.keyed_entries().collect();
        assert_eq!(keyed.len(), 1);
        assert_eq!(keyed[0].2.key64, 99);
    }

    #[test]
    fn max_cells_matches_construction() {
        let cache = BitmapCache::new(&[4, 4, 4], 16);
        assert_eq!(cache.max_cells(), 3);
    }
}

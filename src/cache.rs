use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{check_dimensions, grid_index, Result};
use crate::event::EventRef;
use crate::timestamp;

/// Inclusive query rectangle, possibly reaching outside the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub xl: i64,
    pub xh: i64,
    pub yl: i64,
    pub yh: i64,
}

impl Rect {
    pub fn new(xl: i64, xh: i64, yl: i64, yh: i64) -> Self {
        Self { xl, xh, yl, yh }
    }

    /// Square of half-side `d` centred on `(x, y)`.
    pub fn around(x: i64, y: i64, d: i64) -> Self {
        Self::new(x - d, x + d, y - d, y + d)
    }

    /// Clip to the grid shrunk by `border` pixels; `None` if nothing remains.
    pub(crate) fn clip(&self, width: usize, height: usize, border: i64) -> Option<(usize, usize, usize, usize)> {
        let xl = self.xl.max(border);
        let yl = self.yl.max(border);
        let xh = self.xh.min(width as i64 - 1 - border);
        let yh = self.yh.min(height as i64 - 1 - border);
        if xl > xh || yl > yh {
            return None;
        }
        Some((xl as usize, xh as usize, yl as usize, yh as usize))
    }
}

/// Grid of at-most-one event per pixel. Shared by the event and edge caches.
pub(crate) struct CellGrid {
    pub(crate) cells: Vec<Option<EventRef>>,
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) most_recent: Option<EventRef>,
    pub(crate) live: usize,
}

impl CellGrid {
    pub(crate) fn new(width: usize, height: usize) -> Self {
        Self {
            cells: vec![None; width * height],
            width,
            height,
            most_recent: None,
            live: 0,
        }
    }

    #[inline]
    pub(crate) fn get(&self, x: usize, y: usize) -> Option<&EventRef> {
        self.cells[y * self.width + x].as_ref()
    }

    /// Put `event` at its pixel, returning the previous occupant.
    pub(crate) fn put(&mut self, idx: usize, event: EventRef) -> Option<EventRef> {
        let old = self.cells[idx].replace(event);
        if old.is_none() {
            self.live += 1;
        }
        old
    }

    pub(crate) fn take(&mut self, x: usize, y: usize) -> Option<EventRef> {
        let old = self.cells[y * self.width + x].take();
        if old.is_some() {
            self.live -= 1;
        }
        old
    }

    /// Occupied cells of `rect` in row-major order, filtered by `keep`.
    pub(crate) fn collect(
        &self,
        rect: Rect,
        border: i64,
        mut keep: impl FnMut(&EventRef) -> bool,
    ) -> Vec<EventRef> {
        let mut out = Vec::new();
        let Some((xl, xh, yl, yh)) = rect.clip(self.width, self.height, border) else {
            return out;
        };
        for y in yl..=yh {
            let row = &self.cells[y * self.width..(y + 1) * self.width];
            for cell in row[xl..=xh].iter().flatten() {
                if keep(cell) {
                    out.push(cell.clone());
                }
            }
        }
        out
    }

    pub(crate) fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.most_recent = None;
        self.live = 0;
    }
}

/// Most-recent-event cache.
///
/// Each pixel owns at most one event; adding an event evicts the previous
/// occupant of its pixel and hands it back to the caller. Mutation and
/// queries share a single lock over the whole grid, so the cache can sit
/// behind an `Arc` with one producer and any number of readers. Query results
/// are cloned handles and stay valid after later mutations.
pub struct EventCache {
    grid: Mutex<CellGrid>,
    width: usize,
    height: usize,
    rejected: AtomicU64,
}

impl EventCache {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        check_dimensions(width, height)?;
        debug!(width, height, "event cache created");
        Ok(Self {
            grid: Mutex::new(CellGrid::new(width, height)),
            width,
            height,
            rejected: AtomicU64::new(0),
        })
    }

    /// Store `event` at its pixel and return whatever it displaced.
    pub fn add_event(&self, event: EventRef) -> Result<Option<EventRef>> {
        let idx = match grid_index(event.x as i64, event.y as i64, self.width, self.height) {
            Ok(i) => i,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                trace!(x = event.x, y = event.y, "event cache rejected event");
                return Err(e);
            }
        };
        let mut grid = self.grid.lock();
        grid.most_recent = Some(event.clone());
        Ok(grid.put(idx, event))
    }

    /// Occupied cells inside `[xl, xh] x [yl, yh]`, row-major.
    pub fn get_surf(&self, xl: i64, xh: i64, yl: i64, yh: i64) -> Vec<EventRef> {
        self.grid.lock().collect(Rect::new(xl, xh, yl, yh), 0, |_| true)
    }

    /// Occupied cells within `d` pixels (Chebyshev) of `(x, y)`.
    pub fn get_surf_around(&self, x: i64, y: i64, d: i64) -> Vec<EventRef> {
        self.grid.lock().collect(Rect::around(x, y, d), 0, |_| true)
    }

    /// Occupied cells within `d` pixels of the most recently added event.
    pub fn get_surf_recent(&self, d: i64) -> Vec<EventRef> {
        let grid = self.grid.lock();
        match &grid.most_recent {
            Some(e) => grid.collect(Rect::around(e.x as i64, e.y as i64, d), 0, |_| true),
            None => Vec::new(),
        }
    }

    /// Like [`get_surf`](Self::get_surf), keeping only events at most `dt`
    /// ticks older than the most recent event.
    pub fn get_surf_within(&self, dt: u32, rect: Rect) -> Vec<EventRef> {
        let grid = self.grid.lock();
        let Some(now) = grid.most_recent.as_ref().map(|e| e.timestamp) else {
            return Vec::new();
        };
        grid.collect(rect, 0, |e| timestamp::elapsed(now, e.timestamp) <= dt)
    }

    /// Event at `(x, y)`, if any.
    pub fn get(&self, x: usize, y: usize) -> Result<Option<EventRef>> {
        grid_index(x as i64, y as i64, self.width, self.height)?;
        Ok(self.grid.lock().get(x, y).cloned())
    }

    pub fn most_recent(&self) -> Option<EventRef> {
        self.grid.lock().most_recent.clone()
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.grid.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every held event.
    pub fn clear(&self) {
        self.grid.lock().clear();
    }

    /// Out-of-bounds events rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}

impl std::fmt::Debug for EventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCache")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SurfaceError;
    use crate::event::Event;
    use std::sync::Arc;

    fn ev(x: u16, y: u16, t: u32) -> EventRef {
        Event::new(x, y, t, true).into_ref()
    }

    #[test]
    fn test_replace_returns_previous_occupant() {
        let cache = EventCache::new(4, 4).unwrap();
        assert!(cache.add_event(ev(1, 1, 10)).unwrap().is_none());
        let evicted = cache.add_event(ev(1, 1, 20)).unwrap().unwrap();
        assert_eq!(evicted.timestamp, 10);
        assert!(cache.add_event(ev(2, 2, 30)).unwrap().is_none());

        let all = cache.get_surf(0, 3, 0, 3);
        assert_eq!(all.len(), 2);
        assert_eq!((all[0].x, all[0].y, all[0].timestamp), (1, 1, 20));
        assert_eq!((all[1].x, all[1].y, all[1].timestamp), (2, 2, 30));
    }

    #[test]
    fn test_evicted_handle_outlives_cell() {
        let cache = EventCache::new(4, 4).unwrap();
        cache.add_event(ev(0, 0, 1)).unwrap();
        let held = cache.get_surf(0, 0, 0, 0);
        let evicted = cache.add_event(ev(0, 0, 2)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&held[0], &evicted));
        assert_eq!(Arc::strong_count(&evicted), 2);
        drop(held);
        assert_eq!(Arc::strong_count(&evicted), 1);
    }

    #[test]
    fn test_query_is_row_major_not_time_ordered() {
        let cache = EventCache::new(4, 4).unwrap();
        cache.add_event(ev(3, 3, 1)).unwrap();
        cache.add_event(ev(0, 0, 2)).unwrap();
        cache.add_event(ev(2, 0, 3)).unwrap();
        let xs: Vec<(u16, u16)> = cache.get_surf(0, 3, 0, 3).iter().map(|e| (e.x, e.y)).collect();
        assert_eq!(xs, vec![(0, 0), (2, 0), (3, 3)]);
    }

    #[test]
    fn test_window_clipped_to_bounds() {
        let cache = EventCache::new(4, 4).unwrap();
        cache.add_event(ev(0, 0, 1)).unwrap();
        cache.add_event(ev(3, 3, 2)).unwrap();
        assert_eq!(cache.get_surf(-10, 10, -10, 10).len(), 2);
        assert_eq!(cache.get_surf_around(0, 0, 1).len(), 1);
        assert!(cache.get_surf(5, 9, 5, 9).is_empty());
    }

    #[test]
    fn test_recent_window_follows_last_event() {
        let cache = EventCache::new(8, 8).unwrap();
        assert!(cache.get_surf_recent(2).is_empty());
        cache.add_event(ev(0, 0, 1)).unwrap();
        cache.add_event(ev(6, 6, 2)).unwrap();
        cache.add_event(ev(7, 7, 3)).unwrap();
        let near = cache.get_surf_recent(1);
        assert_eq!(near.len(), 2);
        assert_eq!(cache.most_recent().unwrap().timestamp, 3);
    }

    #[test]
    fn test_time_limited_query_handles_wrap() {
        let cache = EventCache::new(4, 4).unwrap();
        let last = crate::timestamp::TIMESTAMP_MASK;
        cache.add_event(ev(0, 0, last - 100)).unwrap();
        cache.add_event(ev(1, 0, last - 5)).unwrap();
        cache.add_event(ev(2, 0, 4)).unwrap(); // wrapped, 10 ticks after (1,0)
        let recent = cache.get_surf_within(20, Rect::new(0, 3, 0, 3));
        let xs: Vec<u16> = recent.iter().map(|e| e.x).collect();
        assert_eq!(xs, vec![1, 2]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let cache = EventCache::new(4, 4).unwrap();
        let err = cache.add_event(ev(4, 1, 1)).unwrap_err();
        assert!(matches!(err, SurfaceError::OutOfBounds { .. }));
        assert!(cache.is_empty());
        assert!(cache.most_recent().is_none());
        assert_eq!(cache.rejected(), 1);
    }

    #[test]
    fn test_clear_releases_handles() {
        let cache = EventCache::new(4, 4).unwrap();
        let e = ev(1, 2, 3);
        cache.add_event(e.clone()).unwrap();
        assert_eq!(Arc::strong_count(&e), 3); // local, cell, most_recent
        cache.clear();
        assert_eq!(Arc::strong_count(&e), 1);
        assert!(cache.is_empty());
        assert!(cache.most_recent().is_none());
    }

    #[test]
    fn test_concurrent_reader_sees_consistent_counts() {
        let cache = Arc::new(EventCache::new(16, 16).unwrap());
        let producer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let x = (i % 16) as u16;
                    let y = ((i / 16) % 16) as u16;
                    cache.add_event(ev(x, y, i)).unwrap();
                }
            })
        };
        for _ in 0..50 {
            assert!(cache.get_surf(0, 15, 0, 15).len() <= 256);
        }
        producer.join().unwrap();
        assert_eq!(cache.len(), 256);
    }
}

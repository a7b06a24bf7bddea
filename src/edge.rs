use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{CellGrid, Rect};
use crate::config::EdgeConfig;
use crate::error::{check_dimensions, grid_index, Result};
use crate::event::{Event, EventRef};

/// Event cache that keeps only edge-forming pixels.
///
/// Plain events clear their pixel, prune isolated ("pepper") neighbours and
/// are admitted only when a flow-tagged event sits next to them. Flow-tagged
/// events thin the neighbourhood to the line across their thinning axis
/// (see [`edge_axis`]) and then occupy their own pixel, anchoring the edge.
///
/// Whenever a flow cell is removed, plain cells it was supporting are
/// re-checked and dropped if they became pepper. A flow cell with no flow
/// neighbours is kept until a plain event next to it prunes it.
///
/// Queries only ever look at the interior; the one-pixel border is always
/// pepper and never reported.
pub struct EdgeCache {
    grid: Mutex<CellGrid>,
    width: usize,
    height: usize,
    config: EdgeConfig,
    rejected: AtomicU64,
}

impl EdgeCache {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Self::with_config(width, height, EdgeConfig::default())
    }

    pub fn with_config(width: usize, height: usize, config: EdgeConfig) -> Result<Self> {
        check_dimensions(width, height)?;
        config.validate()?;
        debug!(width, height, radius = config.radius, "edge cache created");
        Ok(Self {
            grid: Mutex::new(CellGrid::new(width, height)),
            width,
            height,
            config,
            rejected: AtomicU64::new(0),
        })
    }

    /// Feed one event and return every event pruned from the grid.
    pub fn add_event_to_edge(&self, event: EventRef) -> Result<Vec<EventRef>> {
        let idx = match grid_index(event.x as i64, event.y as i64, self.width, self.height) {
            Ok(i) => i,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                trace!(x = event.x, y = event.y, "edge cache rejected event");
                return Err(e);
            }
        };

        let mut grid = self.grid.lock();
        let mut removed = Vec::new();
        let mut vacated = Vec::new();
        let admit = match event.flow {
            None => self.address_remove(&mut grid, &event, &mut removed, &mut vacated),
            Some(_) => {
                self.flow_remove(&mut grid, &event, &mut removed, &mut vacated);
                true
            }
        };
        if admit {
            grid.put(idx, event.clone());
            grid.most_recent = Some(event);
        }
        self.prune_orphans(&mut grid, &vacated, &mut removed);
        Ok(removed)
    }

    /// Clear the event's pixel and any pepper neighbour. Returns whether the
    /// event's own pixel survives the pepper test.
    fn address_remove(
        &self,
        grid: &mut CellGrid,
        event: &Event,
        removed: &mut Vec<EventRef>,
        vacated: &mut Vec<(usize, usize)>,
    ) -> bool {
        let (x, y) = (event.x as usize, event.y as usize);
        evict(grid, x, y, removed, vacated);

        for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                if grid.get(nx, ny).is_some() && is_pepper(grid, nx, ny) {
                    evict(grid, nx, ny, removed, vacated);
                }
            }
        }

        !is_pepper(grid, x, y)
    }

    /// Clear the event's pixel and every cell in the radius that lies clearly
    /// ahead of or behind the edge along the thinning axis.
    fn flow_remove(
        &self,
        grid: &mut CellGrid,
        event: &Event,
        removed: &mut Vec<EventRef>,
        vacated: &mut Vec<(usize, usize)>,
    ) {
        let (x, y) = (event.x as i64, event.y as i64);
        // refilled by the event itself, so its neighbours keep their support
        removed.extend(grid.take(x as usize, y as usize));

        let Some((nx, ny)) = edge_axis(event) else {
            return;
        };
        let a = self.config.spread;
        let t = self.config.tolerance;
        let f = self.config.radius as i64;
        // two directions tilted either side of the axis
        let (n1x, n1y) = (nx - a * ny, ny + a * nx);
        let (n2x, n2y) = (nx + a * ny, ny - a * nx);

        for yi in -f..=f {
            for xi in -f..=f {
                let d1 = xi as f64 * n1x + yi as f64 * n1y;
                let d2 = xi as f64 * n2x + yi as f64 * n2y;
                if d1.abs() <= t || d2.abs() <= t || d1 * d2 < 0.0 {
                    continue;
                }
                let (px, py) = (x + xi, y + yi);
                if px < 0 || py < 0 || px >= self.width as i64 || py >= self.height as i64 {
                    continue;
                }
                evict(grid, px as usize, py as usize, removed, vacated);
            }
        }
    }

    /// Drop plain cells around `vacated` that lost their last flow neighbour.
    fn prune_orphans(&self, grid: &mut CellGrid, vacated: &[(usize, usize)], removed: &mut Vec<EventRef>) {
        for &(x, y) in vacated {
            for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                    let orphan = grid.get(nx, ny).is_some_and(|e| !e.is_flow()) && is_pepper(grid, nx, ny);
                    if orphan {
                        trace!(x = nx, y = ny, "edge cache dropped unsupported cell");
                        removed.extend(grid.take(nx, ny));
                    }
                }
            }
        }
    }

    /// Occupied interior cells inside `[xl, xh] x [yl, yh]`, row-major.
    pub fn get_surf(&self, xl: i64, xh: i64, yl: i64, yh: i64) -> Vec<EventRef> {
        self.grid.lock().collect(Rect::new(xl, xh, yl, yh), 1, |_| true)
    }

    pub fn get_surf_around(&self, x: i64, y: i64, d: i64) -> Vec<EventRef> {
        self.grid.lock().collect(Rect::around(x, y, d), 1, |_| true)
    }

    /// Occupied interior cells within `d` of the last admitted event.
    pub fn get_surf_recent(&self, d: i64) -> Vec<EventRef> {
        let grid = self.grid.lock();
        match &grid.most_recent {
            Some(e) => grid.collect(Rect::around(e.x as i64, e.y as i64, d), 1, |_| true),
            None => Vec::new(),
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Result<Option<EventRef>> {
        grid_index(x as i64, y as i64, self.width, self.height)?;
        Ok(self.grid.lock().get(x, y).cloned())
    }

    /// True if `(x, y)` would be pruned: on the border, or with no
    /// flow-tagged event among its 8 neighbours.
    pub fn is_pepper(&self, x: usize, y: usize) -> Result<bool> {
        grid_index(x as i64, y as i64, self.width, self.height)?;
        Ok(is_pepper(&self.grid.lock(), x, y))
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

    pub fn clear(&self) {
        self.grid.lock().clear();
    }

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

/// Unit thinning axis of a flow-tagged event. Flow components are read
/// transposed: a flow of `(vx, vy)` thins and scores along `(vy, vx)`.
pub fn edge_axis(event: &Event) -> Option<(f64, f64)> {
    event.flow.and_then(|f| f.direction()).map(|(dx, dy)| (dy, dx))
}

/// Take `(x, y)` into `removed`, remembering it in `vacated` if it held a
/// flow event.
fn evict(grid: &mut CellGrid, x: usize, y: usize, removed: &mut Vec<EventRef>, vacated: &mut Vec<(usize, usize)>) {
    if let Some(e) = grid.take(x, y) {
        if e.is_flow() {
            vacated.push((x, y));
        }
        removed.push(e);
    }
}

fn is_pepper(grid: &CellGrid, x: usize, y: usize) -> bool {
    if x == 0 || y == 0 || x == grid.width - 1 || y == grid.height - 1 {
        return true;
    }
    for ny in y - 1..=y + 1 {
        for nx in x - 1..=x + 1 {
            if nx == x && ny == y {
                continue;
            }
            if grid.get(nx, ny).is_some_and(|e| e.is_flow()) {
                return false;
            }
        }
    }
    true
}

struct ScoreGrid {
    scores: Vec<f64>,
}

/// Probabilistic edge map.
///
/// Each flow-tagged event raises the score of pixels near the line through it
/// across its thinning axis ([`edge_axis`]) and lowers the score of pixels
/// off that line.
/// Scores saturate in `[0, 1]`; pixels above the threshold are reported as
/// synthesised events.
pub struct FuzzyEdgeCache {
    state: Mutex<ScoreGrid>,
    width: usize,
    height: usize,
    config: EdgeConfig,
    rejected: AtomicU64,
}

impl FuzzyEdgeCache {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Self::with_config(width, height, EdgeConfig::default())
    }

    pub fn with_config(width: usize, height: usize, config: EdgeConfig) -> Result<Self> {
        check_dimensions(width, height)?;
        config.validate()?;
        debug!(width, height, delta = config.fuzzy_delta, "fuzzy edge cache created");
        Ok(Self {
            state: Mutex::new(ScoreGrid {
                scores: vec![0.0; width * height],
            }),
            width,
            height,
            config,
            rejected: AtomicU64::new(0),
        })
    }

    /// Fold one event into the score grid. Plain events and zero-length flow
    /// carry no direction and are ignored. Nothing is ever evicted, so the
    /// returned list is always empty.
    pub fn add_event_to_edge(&self, event: EventRef) -> Result<Vec<EventRef>> {
        if let Err(e) = grid_index(event.x as i64, event.y as i64, self.width, self.height) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(x = event.x, y = event.y, "fuzzy edge cache rejected event");
            return Err(e);
        }
        let Some((nx, ny)) = edge_axis(&event) else {
            return Ok(Vec::new());
        };

        let f = self.config.radius as i64;
        let delta = self.config.fuzzy_delta;
        let sigma = self.config.fuzzy_sigma;
        let (x, y) = (event.x as i64, event.y as i64);
        let y1 = -y.min(f);
        let y2 = (self.height as i64 - 1 - y).min(f);
        let x1 = -x.min(f);
        let x2 = (self.width as i64 - 1 - x).min(f);

        let mut state = self.state.lock();
        for yi in y1..=y2 {
            for xi in x1..=x2 {
                if ((xi * xi + yi * yi) as f64).sqrt() > f as f64 {
                    continue;
                }
                let d = xi as f64 * nx + yi as f64 * ny;
                let p = delta * (-(d * d) / sigma).exp() - delta / 2.0;
                let idx = (y + yi) as usize * self.width + (x + xi) as usize;
                let s = &mut state.scores[idx];
                *s = (*s + p).clamp(0.0, 1.0);
            }
        }
        Ok(Vec::new())
    }

    /// Pseudo-events at every interior pixel of the window whose score
    /// exceeds the threshold, row-major.
    pub fn get_surf(&self, xl: i64, xh: i64, yl: i64, yh: i64) -> Vec<EventRef> {
        let Some((xl, xh, yl, yh)) = Rect::new(xl, xh, yl, yh).clip(self.width, self.height, 1) else {
            return Vec::new();
        };
        let state = self.state.lock();
        let mut out = Vec::new();
        for y in yl..=yh {
            for x in xl..=xh {
                if state.scores[y * self.width + x] > self.config.score_threshold {
                    out.push(Event::new(x as u16, y as u16, 0, false).into_ref());
                }
            }
        }
        out
    }

    pub fn score(&self, x: usize, y: usize) -> Result<f64> {
        let idx = grid_index(x as i64, y as i64, self.width, self.height)?;
        Ok(self.state.lock().scores[idx])
    }

    pub fn clear(&self) {
        self.state.lock().scores.fill(0.0);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

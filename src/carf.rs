//! Centre-active receptive fields (CARF) and the tiled set built from them
//! (SCARF).
//!
//! Every region is a fixed-capacity FIFO of recent points. Points landing in
//! a region's own tile are "central" and add density `C` to a shared image;
//! points landing near the edge of a neighbouring tile also occupy a slot
//! but carry no weight, so busy neighbours push central points out sooner.
//! This gives each region a lateral suppression effect at O(1) per event.

use tracing::debug;

use crate::config::ScarfConfig;
use crate::error::{check_dimensions, grid_index, Result, SurfaceError};

/// One slot of a region ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPoint {
    pub x: u16,
    pub y: u16,
    pub polarity: bool,
    /// Whether the point lies in the region's own tile.
    pub central: bool,
}

impl RegionPoint {
    pub fn new(x: u16, y: u16, polarity: bool, central: bool) -> Self {
        Self {
            x,
            y,
            polarity,
            central,
        }
    }
}

/// A single receptive field: a ring of `capacity` points plus the sub-ring
/// of central points still held, oldest at `f1`, next insert at `f2`.
#[derive(Debug, Clone)]
pub struct Carf {
    slots: Vec<Option<RegionPoint>>,
    cursor: usize,
    filled: usize,
    centrals: Vec<RegionPoint>,
    f1: usize,
    f2: usize,
    held: usize,
    c: f32,
}

impl Carf {
    pub fn new(capacity: usize, c: f32) -> Result<Self> {
        if capacity == 0 {
            return Err(SurfaceError::CapacityMisconfigured {
                capacity: 0,
                tile_width: 0,
                tile_height: 0,
                alpha: 0.0,
            });
        }
        Ok(Self {
            slots: vec![None; capacity],
            cursor: 0,
            filled: 0,
            centrals: vec![RegionPoint::new(0, 0, false, true); capacity],
            f1: 0,
            f2: 0,
            held: 0,
            c,
        })
    }

    /// Write `point` into the next ring slot, adjusting `img` (row-major,
    /// `width` columns) for any central point written or overwritten.
    /// Returns the point that was overwritten.
    pub fn add(&mut self, point: RegionPoint, img: &mut [f32], width: usize) -> Option<RegionPoint> {
        let n = self.slots.len();
        let evicted = self.slots[self.cursor].replace(point);

        match evicted {
            Some(old) if old.central => {
                if let Some(v) = img.get_mut(old.y as usize * width + old.x as usize) {
                    *v -= self.c;
                }
                self.f1 = (self.f1 + 1) % n;
                self.held -= 1;
            }
            Some(_) => {}
            None => self.filled += 1,
        }

        if point.central {
            if let Some(v) = img.get_mut(point.y as usize * width + point.x as usize) {
                *v += self.c;
            }
            self.centrals[self.f2] = point;
            self.f2 = (self.f2 + 1) % n;
            self.held += 1;
        }

        self.cursor = (self.cursor + 1) % n;
        evicted
    }

    /// Central points still held, oldest first.
    pub fn active(&self) -> Vec<RegionPoint> {
        let n = self.centrals.len();
        (0..self.held).map(|i| self.centrals[(self.f1 + i) % n]).collect()
    }

    /// Every occupied slot, oldest first.
    pub fn all(&self) -> Vec<RegionPoint> {
        let n = self.slots.len();
        let start = if self.filled < n { 0 } else { self.cursor };
        (0..self.filled)
            .filter_map(|i| self.slots[(start + i) % n])
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of central points currently held.
    pub fn held(&self) -> usize {
        self.held
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    fn reset(&mut self) {
        self.slots.fill(None);
        self.cursor = 0;
        self.filled = 0;
        self.f1 = 0;
        self.f2 = 0;
        self.held = 0;
    }
}

struct Layout {
    width: usize,
    height: usize,
    grid_width: usize,
    grid_height: usize,
    tile_width: usize,
    tile_height: usize,
    img: Vec<f32>,
    regions: Vec<Carf>,
    /// Per pixel: owning region, then up to three suppressing neighbours.
    connections: Vec<[Option<u32>; 4]>,
}

/// A grid of [`Carf`] regions sharing one density image.
///
/// Tiles are offset by half a tile from the image origin so every pixel sits
/// in one owning tile (or none, near the border) and is also pushed into the
/// neighbours on the side of the tile it falls in.
#[derive(Default)]
pub struct Scarf {
    layout: Option<Layout>,
}

impl Scarf {
    /// An uninitialised cache; call one of the `initialise` methods first.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(width: usize, height: usize, config: &ScarfConfig) -> Result<Self> {
        config.validate()?;
        let mut scarf = Self::new();
        scarf.initialise_by_size(width, height, config.rf_size, config.alpha, config.c)?;
        Ok(scarf)
    }

    /// Lay out regions of roughly `rf_size` pixels (rounded up to even).
    pub fn initialise_by_size(
        &mut self,
        width: usize,
        height: usize,
        rf_size: usize,
        alpha: f64,
        c: f32,
    ) -> Result<()> {
        if rf_size == 0 {
            return Err(SurfaceError::InvalidParameter("rf_size must be >= 1".into()));
        }
        let rf_size = rf_size + rf_size % 2;
        let grid_width = (width / rf_size).saturating_sub(1);
        let grid_height = (height / rf_size).saturating_sub(1);
        self.initialise(width, height, (grid_width, grid_height), alpha, c)
    }

    /// Lay out a `rf_grid.0 x rf_grid.1` grid of regions over the image.
    pub fn initialise(
        &mut self,
        width: usize,
        height: usize,
        rf_grid: (usize, usize),
        alpha: f64,
        c: f32,
    ) -> Result<()> {
        check_dimensions(width, height)?;
        if !(alpha > 0.0) || !alpha.is_finite() {
            return Err(SurfaceError::InvalidParameter(format!(
                "alpha must be positive, got {alpha}"
            )));
        }
        let (grid_width, grid_height) = rf_grid;
        let tile_width = (width / (grid_width + 1)) & !1;
        let tile_height = (height / (grid_height + 1)) & !1;
        let capacity = (tile_width as f64 * tile_height as f64 * alpha * 0.5).floor() as i64;
        if grid_width == 0 || grid_height == 0 || capacity <= 0 {
            return Err(SurfaceError::CapacityMisconfigured {
                capacity,
                tile_width,
                tile_height,
                alpha,
            });
        }

        let region = Carf::new(capacity as usize, c)?;
        let regions = vec![region; grid_width * grid_height];
        let connections = connection_map(width, height, grid_width, grid_height, tile_width, tile_height);

        debug!(
            width,
            height,
            grid_width,
            grid_height,
            tile_width,
            tile_height,
            capacity,
            "scarf initialised"
        );
        self.layout = Some(Layout {
            width,
            height,
            grid_width,
            grid_height,
            tile_width,
            tile_height,
            img: vec![0.0; width * height],
            regions,
            connections,
        });
        Ok(())
    }

    fn layout(&self) -> Result<&Layout> {
        self.layout.as_ref().ok_or(SurfaceError::NotInitialised)
    }

    /// Central add to the owning region, non-central adds to its neighbours.
    pub fn update(&mut self, x: usize, y: usize, polarity: bool) -> Result<()> {
        let layout = self.layout.as_mut().ok_or(SurfaceError::NotInitialised)?;
        let idx = grid_index(x as i64, y as i64, layout.width, layout.height)?;
        let (px, py) = (x as u16, y as u16);
        let Layout {
            img,
            regions,
            connections,
            width,
            ..
        } = layout;

        for (entry, region) in connections[idx].iter().enumerate() {
            if let Some(r) = region {
                let point = RegionPoint::new(px, py, polarity, entry == 0);
                regions[*r as usize].add(point, img, *width);
            }
        }
        Ok(())
    }

    /// The density image, row-major.
    pub fn surface(&self) -> Result<&[f32]> {
        Ok(&self.layout()?.img)
    }

    pub fn region(&self, rfx: usize, rfy: usize) -> Result<&Carf> {
        let layout = self.layout()?;
        let idx = grid_index(rfx as i64, rfy as i64, layout.grid_width, layout.grid_height)?;
        Ok(&layout.regions[idx])
    }

    /// Central points held by region `(rfx, rfy)`, oldest first.
    pub fn active(&self, rfx: usize, rfy: usize) -> Result<Vec<RegionPoint>> {
        Ok(self.region(rfx, rfy)?.active())
    }

    /// Every point in region `(rfx, rfy)`'s ring, oldest first.
    pub fn all(&self, rfx: usize, rfy: usize) -> Result<Vec<RegionPoint>> {
        Ok(self.region(rfx, rfy)?.all())
    }

    /// Ring capacity shared by every region.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.layout()?.regions[0].capacity())
    }

    /// Region indices `[owner, neighbours..]` for a pixel, as `(rfx, rfy)`.
    pub fn connections(&self, x: usize, y: usize) -> Result<[Option<(usize, usize)>; 4]> {
        let layout = self.layout()?;
        let idx = grid_index(x as i64, y as i64, layout.width, layout.height)?;
        let gw = layout.grid_width;
        Ok(layout.connections[idx].map(|r| r.map(|r| (r as usize % gw, r as usize / gw))))
    }

    pub fn grid_size(&self) -> Result<(usize, usize)> {
        let layout = self.layout()?;
        Ok((layout.grid_width, layout.grid_height))
    }

    pub fn tile_size(&self) -> Result<(usize, usize)> {
        let layout = self.layout()?;
        Ok((layout.tile_width, layout.tile_height))
    }

    pub fn is_initialised(&self) -> bool {
        self.layout.is_some()
    }

    /// Empty every ring and zero the image; the layout is kept.
    pub fn clear(&mut self) -> Result<()> {
        let layout = self.layout.as_mut().ok_or(SurfaceError::NotInitialised)?;
        layout.img.fill(0.0);
        layout.regions.iter_mut().for_each(Carf::reset);
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.layout.as_ref().map_or(0, |l| l.width)
    }

    pub fn height(&self) -> usize {
        self.layout.as_ref().map_or(0, |l| l.height)
    }
}

fn connection_map(
    width: usize,
    height: usize,
    grid_width: usize,
    grid_height: usize,
    tile_width: usize,
    tile_height: usize,
) -> Vec<[Option<u32>; 4]> {
    let (gw, gh) = (grid_width as i64, grid_height as i64);
    let (tw, th) = (tile_width as i64, tile_height as i64);
    let region = |rx: i64, ry: i64| -> Option<u32> {
        (rx >= 0 && ry >= 0 && rx < gw && ry < gh).then(|| (ry * gw + rx) as u32)
    };

    let mut map = Vec::with_capacity(width * height);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let xm = x - tw / 2;
            let ym = y - th / 2;
            let rfx = xm.div_euclid(tw);
            let rfy = ym.div_euclid(th);
            let top = ym.rem_euclid(th) < th / 2;
            let left = xm.rem_euclid(tw) < tw / 2;
            let dy = if top { -1 } else { 1 };
            let dx = if left { -1 } else { 1 };

            map.push([
                region(rfx, rfy),
                region(rfx, rfy + dy),
                region(rfx + dx, rfy),
                region(rfx + dx, rfy + dy),
            ]);
        }
    }
    map
}

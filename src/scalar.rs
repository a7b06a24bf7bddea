use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use crate::config::{SurfaceConfig, SurfaceKind};
use crate::error::{check_dimensions, grid_index, Result, SurfaceError};
use crate::event::Event;
use crate::timestamp;

/// Value written at the centre of an update by the intensity policies.
pub const MAX_INTENSITY: f64 = 255.0;

/// Inclusive pixel rectangle already clipped to the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
}

impl Window {
    /// The `(2*half+1)`-square centred on `(x, y)`, clipped to `width x height`.
    pub fn around(x: usize, y: usize, half: usize, width: usize, height: usize) -> Self {
        Self {
            x0: x.saturating_sub(half),
            x1: (x + half).min(width - 1),
            y0: y.saturating_sub(half),
            y1: (y + half).min(height - 1),
        }
    }

    /// Visit every row-major index in the window.
    #[inline]
    pub fn for_each_index(&self, width: usize, mut f: impl FnMut(usize)) {
        for y in self.y0..=self.y1 {
            let row = y * width;
            for x in self.x0..=self.x1 {
                f(row + x);
            }
        }
    }
}

/// Per-event update rule of a scalar surface.
///
/// `cells` is the whole row-major grid, `window` the clipped kernel around
/// the event and `centre` the event's own index.
pub trait SurfacePolicy: Send + Sync {
    fn apply(&self, cells: &mut [f64], width: usize, window: Window, centre: usize, t: u32, polarity: bool);
}

/// Exponential reduced ordinal surface.
///
/// Every update scales the window by `parameter^(1/k)` and sets the centre
/// to full intensity, leaving an exponentially fading trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Eros {
    decay: f64,
}

impl Eros {
    pub fn new(kernel_size: usize, parameter: f64) -> Self {
        Self {
            decay: parameter.powf(1.0 / kernel_size as f64),
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }
}

impl SurfacePolicy for Eros {
    #[inline]
    fn apply(&self, cells: &mut [f64], width: usize, window: Window, centre: usize, _t: u32, _p: bool) {
        window.for_each_index(width, |i| cells[i] *= self.decay);
        cells[centre] = MAX_INTENSITY;
    }
}

/// Threshold ordinal surface.
///
/// Window cells at or above `255 - k*parameter` lose one step; cells below
/// it are cleared. The centre is then set to full intensity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tos {
    threshold: f64,
}

impl Tos {
    pub fn new(kernel_size: usize, parameter: f64) -> Self {
        Self {
            threshold: MAX_INTENSITY - kernel_size as f64 * parameter,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl SurfacePolicy for Tos {
    #[inline]
    fn apply(&self, cells: &mut [f64], width: usize, window: Window, centre: usize, _t: u32, _p: bool) {
        window.for_each_index(width, |i| {
            let v = &mut cells[i];
            if *v < self.threshold {
                *v = 0.0;
            } else {
                *v -= 1.0;
            }
        });
        cells[centre] = MAX_INTENSITY;
    }
}

/// Speed-invariant time surface.
///
/// Keeps a strict local ordering: every window cell ranked above the
/// centre's previous value drops one rank, then the centre takes the top
/// rank `k*k`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sits {
    maximum: f64,
}

impl Sits {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            maximum: (kernel_size * kernel_size) as f64,
        }
    }

    pub fn maximum(&self) -> f64 {
        self.maximum
    }
}

impl SurfacePolicy for Sits {
    #[inline]
    fn apply(&self, cells: &mut [f64], width: usize, window: Window, centre: usize, _t: u32, _p: bool) {
        let c = cells[centre];
        window.for_each_index(width, |i| {
            if cells[i] > c {
                cells[i] -= 1.0;
            }
        });
        cells[centre] = self.maximum;
    }
}

/// Polarity integration: ON events count down, OFF events count up.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pim;

impl SurfacePolicy for Pim {
    #[inline]
    fn apply(&self, cells: &mut [f64], _w: usize, _win: Window, centre: usize, _t: u32, polarity: bool) {
        if polarity {
            cells[centre] -= 1.0;
        } else {
            cells[centre] += 1.0;
        }
    }
}

/// Surface of active events: raw timestamp of the last event per pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sae;

impl SurfacePolicy for Sae {
    #[inline]
    fn apply(&self, cells: &mut [f64], _w: usize, _win: Window, centre: usize, t: u32, _p: bool) {
        cells[centre] = t as f64;
    }
}

/// Binary occupancy. Never decays on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bin;

impl SurfacePolicy for Bin {
    #[inline]
    fn apply(&self, cells: &mut [f64], _w: usize, _win: Window, centre: usize, _t: u32, _p: bool) {
        cells[centre] = MAX_INTENSITY;
    }
}

/// Policy chosen at construction time from configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Policy {
    Eros(Eros),
    Tos(Tos),
    Sits(Sits),
    Pim(Pim),
    Sae(Sae),
    Bin(Bin),
}

impl Policy {
    pub fn from_config(config: &SurfaceConfig) -> Self {
        let k = config.kernel_size;
        match config.kind {
            SurfaceKind::Eros => Policy::Eros(Eros::new(k, config.parameter)),
            SurfaceKind::Tos => Policy::Tos(Tos::new(k, config.parameter)),
            SurfaceKind::Sits => Policy::Sits(Sits::new(k)),
            SurfaceKind::Pim => Policy::Pim(Pim),
            SurfaceKind::Sae => Policy::Sae(Sae),
            SurfaceKind::Bin => Policy::Bin(Bin),
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        match self {
            Policy::Eros(_) => SurfaceKind::Eros,
            Policy::Tos(_) => SurfaceKind::Tos,
            Policy::Sits(_) => SurfaceKind::Sits,
            Policy::Pim(_) => SurfaceKind::Pim,
            Policy::Sae(_) => SurfaceKind::Sae,
            Policy::Bin(_) => SurfaceKind::Bin,
        }
    }
}

impl SurfacePolicy for Policy {
    #[inline]
    fn apply(&self, cells: &mut [f64], width: usize, window: Window, centre: usize, t: u32, p: bool) {
        match self {
            Policy::Eros(r) => r.apply(cells, width, window, centre, t, p),
            Policy::Tos(r) => r.apply(cells, width, window, centre, t, p),
            Policy::Sits(r) => r.apply(cells, width, window, centre, t, p),
            Policy::Pim(r) => r.apply(cells, width, window, centre, t, p),
            Policy::Sae(r) => r.apply(cells, width, window, centre, t, p),
            Policy::Bin(r) => r.apply(cells, width, window, centre, t, p),
        }
    }
}

/// Per-pixel scalar grid driven by a [`SurfacePolicy`].
///
/// Holds no events, only numbers. Updates take `&mut self`, so a single
/// writer is enforced by ownership; wrap in [`SharedSurface`] to share.
pub struct ScalarSurface<P: SurfacePolicy = Policy> {
    cells: Vec<f64>,
    width: usize,
    height: usize,
    kernel_size: usize,
    policy: P,
    time_now: Option<u32>,
    rejected: u64,
}

impl ScalarSurface<Policy> {
    /// Build the surface described by `config`.
    pub fn from_config(width: usize, height: usize, config: &SurfaceConfig) -> Result<Self> {
        config.validate()?;
        Self::new(width, height, config.kernel_size, Policy::from_config(config))
    }
}

impl<P: SurfacePolicy> ScalarSurface<P> {
    pub fn new(width: usize, height: usize, kernel_size: usize, policy: P) -> Result<Self> {
        check_dimensions(width, height)?;
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(SurfaceError::InvalidParameter(format!(
                "kernel_size must be odd and >= 1, got {kernel_size}"
            )));
        }
        debug!(width, height, kernel_size, "scalar surface created");
        Ok(Self {
            cells: vec![0.0; width * height],
            width,
            height,
            kernel_size,
            policy,
            time_now: None,
            rejected: 0,
        })
    }

    /// Apply the policy for one event at `(x, y)`.
    pub fn update(&mut self, x: usize, y: usize, t: u32, polarity: bool) -> Result<()> {
        let centre = match grid_index(x as i64, y as i64, self.width, self.height) {
            Ok(i) => i,
            Err(e) => {
                self.rejected += 1;
                trace!(x, y, "scalar surface rejected event");
                return Err(e);
            }
        };
        let window = Window::around(x, y, self.kernel_size / 2, self.width, self.height);
        self.policy
            .apply(&mut self.cells, self.width, window, centre, t, polarity);
        self.advance_time(t);
        Ok(())
    }

    pub fn update_event(&mut self, event: &Event) -> Result<()> {
        self.update(event.x as usize, event.y as usize, event.timestamp, event.polarity)
    }

    fn advance_time(&mut self, t: u32) {
        match self.time_now {
            Some(now) if !timestamp::is_later(t, now) => {}
            _ => self.time_now = Some(t),
        }
    }

    /// Row-major view of the whole grid.
    pub fn surface(&self) -> &[f64] {
        &self.cells
    }

    pub fn value(&self, x: usize, y: usize) -> Option<f64> {
        grid_index(x as i64, y as i64, self.width, self.height)
            .ok()
            .map(|i| self.cells[i])
    }

    /// Scale every cell by `exp(-alpha * dt)`, `dt` being the wrap-aware
    /// time since the latest update or decay.
    pub fn temporal_decay(&mut self, t: u32, alpha: f64) {
        if let Some(now) = self.time_now {
            if timestamp::is_later(t, now) {
                let factor = (-alpha * timestamp::elapsed(t, now) as f64).exp();
                self.cells.iter_mut().for_each(|v| *v *= factor);
            }
        }
        self.advance_time(t);
    }

    /// Replace the grid by its `k x k` box average (clipped at the border).
    pub fn spatial_decay(&mut self, k: usize) -> Result<()> {
        if k == 0 || k % 2 == 0 {
            return Err(SurfaceError::InvalidParameter(format!(
                "spatial decay kernel must be odd and >= 1, got {k}"
            )));
        }
        self.cells = box_filter(&self.cells, self.width, self.height, k);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cells.fill(0.0);
        self.time_now = None;
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Out-of-bounds events rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

/// `k x k` mean over in-bounds neighbours.
///
/// Summed directly per window so that constant regions stay exactly
/// constant; kernels here are small.
pub(crate) fn box_filter<T>(src: &[T], width: usize, height: usize, k: usize) -> Vec<T>
where
    T: Copy + Into<f64> + FromF64,
{
    let half = k / 2;
    let mut out = Vec::with_capacity(src.len());
    for y in 0..height {
        for x in 0..width {
            let w = Window::around(x, y, half, width, height);
            let mut sum = 0.0f64;
            w.for_each_index(width, |i| sum += src[i].into());
            let n = ((w.x1 - w.x0 + 1) * (w.y1 - w.y0 + 1)) as f64;
            out.push(T::from_f64(sum / n));
        }
    }
    out
}

pub(crate) trait FromF64 {
    fn from_f64(v: f64) -> Self;
}

impl FromF64 for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl FromF64 for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

/// A scalar surface behind one reader-writer lock.
///
/// Cloning shares the same surface.
pub struct SharedSurface<P: SurfacePolicy = Policy> {
    inner: Arc<RwLock<ScalarSurface<P>>>,
}

impl<P: SurfacePolicy> Clone for SharedSurface<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: SurfacePolicy> SharedSurface<P> {
    pub fn new(surface: ScalarSurface<P>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(surface)),
        }
    }

    pub fn update(&self, x: usize, y: usize, t: u32, polarity: bool) -> Result<()> {
        self.inner.write().update(x, y, t, polarity)
    }

    pub fn update_event(&self, event: &Event) -> Result<()> {
        self.inner.write().update_event(event)
    }

    /// Copy of the grid at this instant.
    pub fn snapshot(&self) -> Vec<f64> {
        self.inner.read().surface().to_vec()
    }

    /// Hold a read guard; updates wait until it drops.
    pub fn read(&self) -> RwLockReadGuard<'_, ScalarSurface<P>> {
        self.inner.read()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(s: &ScalarSurface<impl SurfacePolicy>, x: usize, y: usize) -> f64 {
        s.value(x, y).unwrap()
    }

    #[test]
    fn test_eros_centre_full_and_window_decays() {
        let mut s = ScalarSurface::new(8, 8, 3, Eros::new(3, 0.3)).unwrap();
        s.update(2, 2, 10, true).unwrap();
        assert_eq!(at(&s, 2, 2), MAX_INTENSITY);
        s.update(3, 2, 11, true).unwrap();
        assert_eq!(at(&s, 3, 2), MAX_INTENSITY);
        assert_relative_eq!(at(&s, 2, 2), 255.0 * 0.3f64.powf(1.0 / 3.0), epsilon = 1e-9);
        // outside the 3x3 window of (3,2)
        s.update(6, 6, 12, true).unwrap();
        assert_relative_eq!(at(&s, 2, 2), 255.0 * 0.3f64.powf(1.0 / 3.0), epsilon = 1e-9);
    }

    #[test]
    fn test_tos_steps_then_clears() {
        // threshold = 255 - 3*2 = 249
        let mut s = ScalarSurface::new(8, 8, 3, Tos::new(3, 2.0)).unwrap();
        assert_eq!(s.policy().threshold(), 249.0);
        s.update(2, 2, 0, true).unwrap();
        for _ in 0..7 {
            s.update(3, 2, 0, true).unwrap();
        }
        assert_eq!(at(&s, 2, 2), 248.0);
        s.update(3, 2, 0, true).unwrap();
        assert_eq!(at(&s, 2, 2), 0.0);
        assert_eq!(at(&s, 3, 2), MAX_INTENSITY);
    }

    #[test]
    fn test_sits_keeps_strict_local_order() {
        let mut s = ScalarSurface::new(8, 8, 3, Sits::new(3)).unwrap();
        s.update(2, 2, 0, true).unwrap();
        assert_eq!(at(&s, 2, 2), 9.0);
        s.update(3, 2, 0, true).unwrap();
        assert_eq!((at(&s, 2, 2), at(&s, 3, 2)), (8.0, 9.0));
        s.update(2, 2, 0, true).unwrap();
        assert_eq!((at(&s, 2, 2), at(&s, 3, 2)), (9.0, 8.0));
    }

    #[test]
    fn test_pim_counts_polarity() {
        let mut s = ScalarSurface::new(4, 4, 1, Pim).unwrap();
        s.update(1, 1, 0, true).unwrap();
        s.update(1, 1, 0, true).unwrap();
        s.update(1, 1, 0, false).unwrap();
        assert_eq!(at(&s, 1, 1), -1.0);
        assert_eq!(at(&s, 0, 0), 0.0);
    }

    #[test]
    fn test_sae_stores_timestamp() {
        let mut s = ScalarSurface::new(4, 4, 1, Sae).unwrap();
        s.update(3, 0, 123_456, false).unwrap();
        assert_eq!(at(&s, 3, 0), 123_456.0);
    }

    #[test]
    fn test_bin_is_binary() {
        let mut s = ScalarSurface::new(4, 4, 3, Bin).unwrap();
        s.update(1, 1, 0, true).unwrap();
        s.update(1, 1, 5, false).unwrap();
        s.update(3, 3, 9, true).unwrap();
        assert!(s.surface().iter().all(|&v| v == 0.0 || v == MAX_INTENSITY));
        assert_eq!(s.surface().iter().filter(|&&v| v > 0.0).count(), 2);
    }

    #[test]
    fn test_window_clipped_at_border() {
        let mut s = ScalarSurface::new(4, 4, 5, Eros::new(5, 0.5)).unwrap();
        s.update(0, 0, 0, true).unwrap();
        s.update(2, 2, 1, true).unwrap();
        assert_eq!(at(&s, 2, 2), MAX_INTENSITY);
        assert!(at(&s, 0, 0) < MAX_INTENSITY);
        s.update(3, 3, 2, true).unwrap();
        assert_eq!(at(&s, 3, 3), MAX_INTENSITY);
    }

    #[test]
    fn test_out_of_bounds_rejected_and_counted() {
        let mut s = ScalarSurface::new(4, 4, 3, Bin).unwrap();
        let err = s.update(4, 0, 0, true).unwrap_err();
        assert!(matches!(err, SurfaceError::OutOfBounds { x: 4, y: 0, .. }));
        assert_eq!(s.rejected(), 1);
        assert!(s.surface().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_even_kernel_rejected() {
        assert!(ScalarSurface::new(4, 4, 2, Bin).is_err());
    }

    #[test]
    fn test_policy_enum_from_config() {
        let cfg = SurfaceConfig::new(SurfaceKind::Sits, 5);
        let mut s = ScalarSurface::from_config(16, 16, &cfg).unwrap();
        assert_eq!(s.policy().kind(), SurfaceKind::Sits);
        s.update(8, 8, 0, true).unwrap();
        assert_eq!(at(&s, 8, 8), 25.0);
    }

    #[test]
    fn test_temporal_decay_uses_elapsed_time() {
        let mut s = ScalarSurface::new(4, 4, 1, Bin).unwrap();
        s.update(1, 1, 100, true).unwrap();
        s.temporal_decay(110, 0.1);
        assert_relative_eq!(at(&s, 1, 1), 255.0 * (-1.0f64).exp(), epsilon = 1e-9);
        // a stale stamp does not decay again
        s.temporal_decay(105, 0.1);
        assert_relative_eq!(at(&s, 1, 1), 255.0 * (-1.0f64).exp(), epsilon = 1e-9);
    }

    #[test]
    fn test_spatial_decay_spreads_mass() {
        let mut s = ScalarSurface::new(5, 5, 1, Bin).unwrap();
        s.update(2, 2, 0, true).unwrap();
        s.spatial_decay(3).unwrap();
        assert_relative_eq!(at(&s, 2, 2), 255.0 / 9.0, epsilon = 1e-9);
        assert_relative_eq!(at(&s, 1, 1), 255.0 / 9.0, epsilon = 1e-9);
        assert_eq!(at(&s, 0, 0), 0.0);
    }

    #[test]
    fn test_clear() {
        let mut s = ScalarSurface::new(4, 4, 3, Eros::new(3, 0.3)).unwrap();
        s.update(1, 1, 0, true).unwrap();
        s.clear();
        assert!(s.surface().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shared_surface_across_threads() {
        let shared = SharedSurface::new(ScalarSurface::new(8, 8, 1, Pim).unwrap());
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                writer.update(4, 4, 0, false).unwrap();
            }
        });
        handle.join().unwrap();
        assert_eq!(shared.read().value(4, 4), Some(100.0));
        assert_eq!(shared.snapshot()[4 * 8 + 4], 100.0);
    }
}

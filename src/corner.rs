use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::carf::Scarf;
use crate::config::{Config, CornerConfig, ScarfConfig};
use crate::error::{Result, SurfaceError};
use crate::event::EventRef;
use crate::scalar::box_filter;
use crate::stats::RunningStats;

/// Harris corner response over a dense image.
///
/// The algorithm:
/// 1. Box-blur the image with a `blur_size` window (skipped for 0 or 1).
/// 2. Compute spatial gradients with a 3x3 Sobel, replicating border pixels.
/// 3. Average the gradient products over a `block_size` window to build the
///    structure tensor M = [[Ixx, Ixy], [Ixy, Iyy]].
/// 4. R = det(M) - k * trace(M)^2.
///
/// Positive R marks corners, negative R edges, and R is exactly zero on flat
/// regions.
pub fn harris_response(
    img: &[f32],
    width: usize,
    height: usize,
    blur_size: usize,
    block_size: usize,
    harris_k: f64,
) -> Vec<f32> {
    let blurred = if blur_size > 1 {
        box_filter(img, width, height, blur_size)
    } else {
        img.to_vec()
    };

    let at = |x: usize, dx: isize, y: usize, dy: isize| -> f64 {
        let cx = (x as isize + dx).clamp(0, width as isize - 1) as usize;
        let cy = (y as isize + dy).clamp(0, height as isize - 1) as usize;
        blurred[cy * width + cx] as f64
    };

    let n = width * height;
    let mut ixx = Vec::with_capacity(n);
    let mut iyy = Vec::with_capacity(n);
    let mut ixy = Vec::with_capacity(n);
    for y in 0..height {
        for x in 0..width {
            let ix = at(x, 1, y, -1) + 2.0 * at(x, 1, y, 0) + at(x, 1, y, 1)
                - at(x, -1, y, -1)
                - 2.0 * at(x, -1, y, 0)
                - at(x, -1, y, 1);
            let iy = at(x, -1, y, 1) + 2.0 * at(x, 0, y, 1) + at(x, 1, y, 1)
                - at(x, -1, y, -1)
                - 2.0 * at(x, 0, y, -1)
                - at(x, 1, y, -1);
            ixx.push(ix * ix);
            iyy.push(iy * iy);
            ixy.push(ix * iy);
        }
    }

    let sxx = box_filter(&ixx, width, height, block_size);
    let syy = box_filter(&iyy, width, height, block_size);
    let sxy = box_filter(&ixy, width, height, block_size);

    (0..n)
        .map(|i| {
            let det = sxx[i] * syy[i] - sxy[i] * sxy[i];
            let trace = sxx[i] + syy[i];
            (det - harris_k * trace * trace) as f32
        })
        .collect()
}

/// An immutable image tagged with the generation it was produced for.
#[derive(Debug, Clone)]
pub struct Frame {
    pub generation: u64,
    pub data: Arc<[f32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Running,
    Stopped,
}

#[derive(Default)]
struct Exchange {
    /// Newest density frame not yet picked up by the worker.
    pending: Option<Frame>,
    /// Newest response published by the worker.
    response: Option<Frame>,
    /// Responses for generations below this were computed before a reset.
    min_generation: u64,
    stop: bool,
}

impl Exchange {
    /// Install `response` if it is newer than the current one and not from
    /// before the last reset.
    fn offer(&mut self, response: Frame) -> bool {
        if response.generation < self.min_generation {
            return false;
        }
        let newer = self
            .response
            .as_ref()
            .map_or(true, |r| r.generation < response.generation);
        if newer {
            self.response = Some(response);
        }
        newer
    }
}

#[derive(Default)]
struct Shared {
    exchange: Mutex<Exchange>,
    frame_ready: Condvar,
    response_ready: Condvar,
}

#[derive(Clone, Copy)]
struct Geometry {
    width: usize,
    height: usize,
    blur_size: usize,
    block_size: usize,
    harris_k: f64,
}

impl Geometry {
    fn respond(&self, frame: &Frame) -> Frame {
        let data = harris_response(
            &frame.data,
            self.width,
            self.height,
            self.blur_size,
            self.block_size,
            self.harris_k,
        );
        Frame {
            generation: frame.generation,
            data: data.into(),
        }
    }
}

/// Corner detector over a SCARF density map.
///
/// Events update the density map on the caller's thread. After each batch
/// the map is published as a frame; a background worker turns the newest
/// frame into a Harris response, dropping any frames that arrived while it
/// was busy. An event is a corner when the latest response at its pixel
/// stands out from the running distribution of responses seen so far.
pub struct CornerFilter {
    scarf: Scarf,
    geometry: Geometry,
    std_factor: f64,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    stats: RunningStats,
    generation: u64,
    rejected: u64,
}

impl CornerFilter {
    /// Create a stopped filter; call [`start`](Self::start) to spawn the worker.
    pub fn new(width: usize, height: usize, scarf: &ScarfConfig, config: &CornerConfig) -> Result<Self> {
        config.validate()?;
        let scarf = Scarf::from_config(width, height, scarf)?;
        let geometry = Geometry {
            width,
            height,
            blur_size: config.blur_size,
            block_size: config.effective_block_size(),
            harris_k: config.harris_k,
        };
        debug!(width, height, block_size = geometry.block_size, "corner filter created");
        Ok(Self {
            scarf,
            geometry,
            std_factor: config.std_factor,
            shared: Arc::new(Shared::default()),
            worker: None,
            stats: RunningStats::new(),
            generation: 0,
            rejected: 0,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.width, config.height, &config.scarf, &config.corner)
    }

    pub fn state(&self) -> FilterState {
        if self.worker.is_some() {
            FilterState::Running
        } else {
            FilterState::Stopped
        }
    }

    /// Spawn the response worker. No-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.exchange.lock().stop = false;

        let shared = Arc::clone(&self.shared);
        let geometry = self.geometry;
        let handle = thread::Builder::new()
            .name("corner-response".into())
            .spawn(move || run_worker(&shared, geometry))
            .map_err(|e| SurfaceError::Worker(e.to_string()))?;
        self.worker = Some(handle);
        info!("corner worker started");
        Ok(())
    }

    /// Signal the worker, wake it and wait for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        {
            let mut exchange = self.shared.exchange.lock();
            exchange.stop = true;
            self.shared.frame_ready.notify_all();
        }
        if handle.join().is_err() {
            warn!("corner worker panicked");
        }
        info!("corner worker stopped");
    }

    /// Feed a batch of events and return those classified as corners.
    ///
    /// Every event is scored against the response published before this
    /// batch; the updated density map is published once the batch is done.
    /// An out-of-bounds event aborts the batch with the events before it
    /// already applied.
    pub fn detect(&mut self, events: &[EventRef]) -> Result<Vec<EventRef>> {
        let response = self.latest_response();
        let width = self.geometry.width;
        let mut corners = Vec::new();

        for event in events {
            let (x, y) = (event.x as usize, event.y as usize);
            if let Err(e) = self.scarf.update(x, y, event.polarity) {
                self.rejected += 1;
                trace!(x, y, "corner filter rejected event");
                return Err(e);
            }
            let r = response
                .as_ref()
                .map_or(0.0, |frame| frame.data[y * width + x] as f64);
            self.stats.push(r);
            if r > self.stats.threshold(self.std_factor) {
                corners.push(Arc::clone(event));
            }
        }

        self.publish()?;
        Ok(corners)
    }

    /// Hand the current density map to the worker. Returns its generation.
    pub fn publish(&mut self) -> Result<u64> {
        self.generation += 1;
        let frame = Frame {
            generation: self.generation,
            data: Arc::from(self.scarf.surface()?),
        };
        let mut exchange = self.shared.exchange.lock();
        exchange.pending = Some(frame);
        self.shared.frame_ready.notify_one();
        Ok(self.generation)
    }

    /// Publish the density map and block until its response is available.
    /// When stopped the response is computed on the calling thread.
    pub fn flush(&mut self) -> Result<Frame> {
        let generation = self.publish()?;
        let mut exchange = self.shared.exchange.lock();

        if self.worker.is_none() {
            if let Some(frame) = exchange.pending.take() {
                let response = self.geometry.respond(&frame);
                exchange.offer(response);
            }
        }
        loop {
            if let Some(frame) = &exchange.response {
                if frame.generation >= generation {
                    return Ok(frame.clone());
                }
            }
            self.shared.response_ready.wait(&mut exchange);
        }
    }

    /// Newest published response, if any.
    pub fn latest_response(&self) -> Option<Frame> {
        self.shared.exchange.lock().response.clone()
    }

    /// Current density map.
    pub fn surface(&self) -> Result<&[f32]> {
        self.scarf.surface()
    }

    pub fn scarf(&self) -> &Scarf {
        &self.scarf
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Forget density, responses and statistics. The worker keeps running;
    /// a response it is still computing for an earlier frame is discarded.
    pub fn reset(&mut self) -> Result<()> {
        self.scarf.clear()?;
        self.stats.reset();
        let mut exchange = self.shared.exchange.lock();
        exchange.pending = None;
        exchange.response = None;
        exchange.min_generation = self.generation + 1;
        debug!(min_generation = exchange.min_generation, "corner filter reset");
        Ok(())
    }
}

impl Drop for CornerFilter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared, geometry: Geometry) {
    loop {
        let frame = {
            let mut exchange = shared.exchange.lock();
            while exchange.pending.is_none() && !exchange.stop {
                shared.frame_ready.wait(&mut exchange);
            }
            if exchange.stop {
                return;
            }
            match exchange.pending.take() {
                Some(frame) => frame,
                None => continue,
            }
        };

        let response = geometry.respond(&frame);
        trace!(generation = response.generation, "corner response ready");

        let generation = response.generation;
        let mut exchange = shared.exchange.lock();
        if !exchange.offer(response) {
            trace!(generation, "corner response dropped");
        }
        shared.response_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    const W: usize = 64;
    const H: usize = 64;

    fn square(w: usize, lo: usize, hi: usize) -> Vec<f32> {
        let mut img = vec![0.0f32; w * w];
        for y in lo..hi {
            for x in lo..hi {
                img[y * w + x] = 0.3;
            }
        }
        img
    }

    fn filter() -> CornerFilter {
        // roomy rings so a filled square never evicts
        let scarf = ScarfConfig {
            rf_size: 8,
            alpha: 8.0,
            c: 0.3,
        };
        CornerFilter::new(W, H, &scarf, &CornerConfig::default()).unwrap()
    }

    fn square_events(lo: u16, hi: u16) -> Vec<EventRef> {
        let mut events = Vec::new();
        for y in lo..hi {
            for x in lo..hi {
                events.push(Event::new(x, y, 0, true).into_ref());
            }
        }
        events
    }

    #[test]
    fn test_flat_region_zero_response() {
        let img = vec![0.7f32; 16 * 16];
        let r = harris_response(&img, 16, 16, 3, 5, 0.04);
        assert!(r.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_corner_positive_edge_negative() {
        let img = square(W, 24, 40);
        let r = harris_response(&img, W, H, 3, 5, 0.04);
        let at = |x: usize, y: usize| r[y * W + x];
        assert!(at(24, 24) > 0.0);
        assert!(at(39, 39) > 0.0);
        assert!(at(32, 24) < 0.0);
        assert!(at(24, 32) < 0.0);
        assert!(at(25, 25) > at(32, 24));
        assert_eq!(at(32, 32), 0.0);
        assert_eq!(at(10, 10), 0.0);
    }

    #[test]
    fn test_lifecycle() {
        let mut f = filter();
        assert_eq!(f.state(), FilterState::Stopped);
        f.start().unwrap();
        assert_eq!(f.state(), FilterState::Running);
        f.start().unwrap();
        f.stop();
        assert_eq!(f.state(), FilterState::Stopped);
        f.stop();
        f.start().unwrap();
        assert_eq!(f.state(), FilterState::Running);
        // dropping a running filter joins the worker
        drop(f);
    }

    #[test]
    fn test_flush_waits_for_worker() {
        let mut f = filter();
        f.start().unwrap();
        f.detect(&square_events(24, 40)).unwrap();
        let frame = f.flush().unwrap();
        // detect published generation 1, flush generation 2
        assert_eq!(frame.generation, 2);
        assert!(frame.data[25 * W + 25] > 0.0);
        assert_eq!(f.latest_response().unwrap().generation, 2);
    }

    #[test]
    fn test_flush_when_stopped_computes_inline() {
        let mut f = filter();
        f.detect(&square_events(24, 40)).unwrap();
        let frame = f.flush().unwrap();
        assert_eq!(frame.generation, 2);
        assert!(frame.data[25 * W + 25] > 0.0);
    }

    #[test]
    fn test_detects_square_corner() {
        let mut f = filter();
        f.start().unwrap();
        // no response published yet: nothing stands out
        let first = f.detect(&square_events(24, 40)).unwrap();
        assert!(first.is_empty());
        f.flush().unwrap();

        let mut batch: Vec<EventRef> = (0..20).map(|t| Event::new(32, 32, t, true).into_ref()).collect();
        batch.push(Event::new(32, 24, 21, true).into_ref());
        batch.push(Event::new(25, 25, 22, true).into_ref());
        let corners = f.detect(&batch).unwrap();
        assert_eq!(corners.len(), 1);
        assert_eq!((corners[0].x, corners[0].y), (25, 25));
        assert_eq!(f.stats().count(), 256 + 22);
    }

    #[test]
    fn test_out_of_bounds_aborts_batch() {
        let mut f = filter();
        let batch = vec![
            Event::new(10, 10, 1, true).into_ref(),
            Event::new(64, 10, 2, true).into_ref(),
        ];
        let err = f.detect(&batch).unwrap_err();
        assert!(matches!(err, SurfaceError::OutOfBounds { .. }));
        assert_eq!(f.rejected(), 1);
        assert_eq!(f.stats().count(), 1);
    }

    #[test]
    fn test_reset_clears_response() {
        let mut f = filter();
        f.detect(&square_events(24, 40)).unwrap();
        f.flush().unwrap();
        f.reset().unwrap();
        assert!(f.latest_response().is_none());
        assert!(f.surface().unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(f.stats().count(), 0);
    }

    #[test]
    fn test_exchange_drops_responses_from_before_reset() {
        let frame = |generation: u64| Frame {
            generation,
            data: Arc::from(vec![1.0f32; 4]),
        };
        let mut exchange = Exchange {
            min_generation: 3,
            ..Exchange::default()
        };
        assert!(!exchange.offer(frame(2)));
        assert!(exchange.response.is_none());
        assert!(exchange.offer(frame(3)));
        assert!(!exchange.offer(frame(3)));
        assert!(exchange.offer(frame(5)));
        assert!(!exchange.offer(frame(4)));
        assert_eq!(exchange.response.as_ref().unwrap().generation, 5);
    }

    #[test]
    fn test_reset_discards_response_in_flight() {
        let mut f = CornerFilter::new(640, 480, &ScarfConfig::default(), &CornerConfig::default()).unwrap();
        f.start().unwrap();
        let batch: Vec<EventRef> = (0..200u32)
            .map(|i| Event::new((i * 3 % 640) as u16, (i * 7 % 480) as u16, i, i % 2 == 0).into_ref())
            .collect();
        for _ in 0..4 {
            f.detect(&batch).unwrap();
            f.reset().unwrap();
        }
        // joining the worker lets it finish whatever frame it had taken
        f.stop();
        assert!(f.latest_response().is_none());

        let frame = f.flush().unwrap();
        assert_eq!(frame.generation, 5);
        assert!(frame.data.iter().all(|&v| v == 0.0));
    }
}

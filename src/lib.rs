pub mod cache;
pub mod carf;
pub mod config;
pub mod corner;
pub mod edge;
pub mod error;
pub mod event;
pub mod scalar;
pub mod stats;
pub mod timestamp;

pub use error::{Result, SurfaceError};
pub use event::{Event, EventRef};

/// Maximum allowed sensor dimension to prevent excessive memory allocation.
/// 32768 x 32768 = ~1 GB per grid, far beyond any real eDVS sensor.
pub const MAX_SENSOR_DIM: usize = 32768;

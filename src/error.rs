/// Errors raised by surfaces, caches and the corner filter.
///
/// All variants are caller-contract violations. Nothing here is retried or
/// corrected: a rejected event is counted by the structure that rejected it
/// and the error is handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("pixel ({x}, {y}) outside {width}x{height} grid")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: usize,
        height: usize,
    },

    #[error("surface used before initialise")]
    NotInitialised,

    #[error("region capacity {capacity} from tile {tile_width}x{tile_height} with alpha {alpha}")]
    CapacityMisconfigured {
        capacity: i64,
        tile_width: usize,
        tile_height: usize,
        alpha: f64,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("corner worker: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, SurfaceError>;

/// Validate a sensor size shared by every grid-backed structure.
pub(crate) fn check_dimensions(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(SurfaceError::InvalidParameter(format!(
            "dimensions must be positive, got {width}x{height}"
        )));
    }
    if width > crate::MAX_SENSOR_DIM || height > crate::MAX_SENSOR_DIM {
        return Err(SurfaceError::InvalidParameter(format!(
            "dimensions {width}x{height} exceed maximum {}",
            crate::MAX_SENSOR_DIM
        )));
    }
    Ok(())
}

/// Row-major index of `(x, y)`, or `OutOfBounds`.
#[inline]
pub(crate) fn grid_index(x: i64, y: i64, width: usize, height: usize) -> Result<usize> {
    if x < 0 || y < 0 || x as usize >= width || y as usize >= height {
        return Err(SurfaceError::OutOfBounds {
            x,
            y,
            width,
            height,
        });
    }
    Ok(y as usize * width + x as usize)
}

//! Tuning knobs for every surface, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurfaceError};

// ---------------------------------------------------------------------------
// Scalar surfaces
// ---------------------------------------------------------------------------

/// Which scalar update rule a surface runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Eros,
    Tos,
    Sits,
    Pim,
    Sae,
    Bin,
}

impl SurfaceKind {
    /// Parameter used when none is configured.
    pub fn default_parameter(self) -> f64 {
        match self {
            SurfaceKind::Eros => 0.3,
            SurfaceKind::Tos => 2.0,
            _ => 0.0,
        }
    }
}

impl std::str::FromStr for SurfaceKind {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eros" => Ok(SurfaceKind::Eros),
            "tos" => Ok(SurfaceKind::Tos),
            "sits" => Ok(SurfaceKind::Sits),
            "pim" => Ok(SurfaceKind::Pim),
            "sae" => Ok(SurfaceKind::Sae),
            "bin" => Ok(SurfaceKind::Bin),
            other => Err(SurfaceError::InvalidParameter(format!(
                "unknown surface kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub kind: SurfaceKind,
    /// Side of the update window; odd, at least 1.
    pub kernel_size: usize,
    /// Decay (EROS) or threshold step (TOS). Unused by the other rules.
    pub parameter: f64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            kind: SurfaceKind::Eros,
            kernel_size: 7,
            parameter: SurfaceKind::Eros.default_parameter(),
        }
    }
}

impl SurfaceConfig {
    pub fn new(kind: SurfaceKind, kernel_size: usize) -> Self {
        Self {
            kind,
            kernel_size,
            parameter: kind.default_parameter(),
        }
    }

    pub fn with_parameter(mut self, parameter: f64) -> Self {
        self.parameter = parameter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(SurfaceError::InvalidParameter(format!(
                "kernel_size must be odd and >= 1, got {}",
                self.kernel_size
            )));
        }
        if self.kernel_size > 255 {
            return Err(SurfaceError::InvalidParameter(format!(
                "kernel_size must be at most 255, got {}",
                self.kernel_size
            )));
        }
        if self.kind == SurfaceKind::Eros && !(self.parameter > 0.0 && self.parameter <= 1.0) {
            return Err(SurfaceError::InvalidParameter(format!(
                "EROS decay must be in (0, 1], got {}",
                self.parameter
            )));
        }
        if self.kind == SurfaceKind::Tos && !(self.parameter >= 0.0) {
            return Err(SurfaceError::InvalidParameter(format!(
                "TOS step must be non-negative, got {}",
                self.parameter
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Edge caches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Radius of the flow pruning window (pixels).
    pub radius: i32,
    /// Tilt of the two pruning half-planes away from the thinning axis.
    pub spread: f64,
    /// Distance from the edge line inside which cells are kept.
    pub tolerance: f64,
    /// Peak score change per flow event in the fuzzy cache.
    pub fuzzy_delta: f64,
    /// Width of the fuzzy score bump.
    pub fuzzy_sigma: f64,
    /// Score above which the fuzzy cache reports a pixel.
    pub score_threshold: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            radius: 3,
            spread: 0.5,
            tolerance: 0.8,
            fuzzy_delta: 0.4,
            fuzzy_sigma: 0.708,
            score_threshold: 0.5,
        }
    }
}

impl EdgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.radius < 1 {
            return Err(SurfaceError::InvalidParameter(format!(
                "edge radius must be >= 1, got {}",
                self.radius
            )));
        }
        if !(self.tolerance >= 0.0) || !(self.fuzzy_sigma > 0.0) || !(self.fuzzy_delta > 0.0) {
            return Err(SurfaceError::InvalidParameter(
                "edge tolerance must be >= 0, fuzzy sigma and delta > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(SurfaceError::InvalidParameter(format!(
                "score_threshold must be in [0, 1], got {}",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Regional density cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScarfConfig {
    /// Nominal receptive field side; rounded up to even.
    pub rf_size: usize,
    /// Ring density: capacity is `area * alpha / 2`.
    pub alpha: f64,
    /// Density credit per central point.
    pub c: f32,
}

impl Default for ScarfConfig {
    fn default() -> Self {
        Self {
            rf_size: 14,
            alpha: 1.0,
            c: 0.3,
        }
    }
}

impl ScarfConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rf_size == 0 {
            return Err(SurfaceError::InvalidParameter("rf_size must be >= 1".into()));
        }
        if !(self.alpha > 0.0) || !self.alpha.is_finite() {
            return Err(SurfaceError::InvalidParameter(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(self.c > 0.0) {
            return Err(SurfaceError::InvalidParameter(format!(
                "c must be positive, got {}",
                self.c
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Corner filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerConfig {
    /// Structure tensor window; even values are bumped to the next odd.
    pub block_size: usize,
    /// Harris sensitivity.
    pub harris_k: f64,
    /// Box blur applied to the density map before the response.
    pub blur_size: usize,
    /// Threshold is `mean + std_factor * stddev` of all responses so far.
    pub std_factor: f64,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            block_size: 5,
            harris_k: 0.04,
            blur_size: 3,
            std_factor: 2.0,
        }
    }
}

impl CornerConfig {
    /// Block size forced odd.
    pub fn effective_block_size(&self) -> usize {
        if self.block_size % 2 == 0 {
            self.block_size + 1
        } else {
            self.block_size
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(SurfaceError::InvalidParameter("block_size must be >= 1".into()));
        }
        if !(self.harris_k > 0.0) {
            return Err(SurfaceError::InvalidParameter(format!(
                "harris_k must be positive, got {}",
                self.harris_k
            )));
        }
        if !(self.std_factor >= 0.0) {
            return Err(SurfaceError::InvalidParameter(format!(
                "std_factor must be non-negative, got {}",
                self.std_factor
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub width: usize,
    pub height: usize,
    pub surface: SurfaceConfig,
    pub edge: EdgeConfig,
    pub scarf: ScarfConfig,
    pub corner: CornerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: 304,
            height: 240,
            surface: SurfaceConfig::default(),
            edge: EdgeConfig::default(),
            scarf: ScarfConfig::default(),
            corner: CornerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SurfaceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SurfaceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        crate::error::check_dimensions(self.width, self.height)?;
        self.surface.validate()?;
        self.edge.validate()?;
        self.scarf.validate()?;
        self.corner.validate()
    }
}

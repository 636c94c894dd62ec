use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FluidError, Result};

/// Outer pressure iterations past which the projection starts ringing with
/// spurious pressure waves instead of converging.
pub const STABLE_PRESSURE_ITERATIONS: u32 = 6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub width: u32,
    pub height: u32,
    /// Physical size of one cell.
    pub grid_square_size: f32,
    pub density: f32,
    /// Diffusion runs only for `Some(v)` with `v > 0`.
    pub viscosity: Option<f32>,
    pub zero_initialize_shared_textures: bool,
    /// Outer iterations of the diffusion solve, two Jacobi sweeps each.
    pub diffusion_iterations: u32,
    /// Outer iterations of the pressure solve, two Jacobi sweeps each.
    /// Tuned by eye; values above 4 to 6 destabilize the field.
    pub pressure_iterations: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            grid_square_size: 0.1,
            density: 1.0,
            viscosity: None,
            zero_initialize_shared_textures: true,
            diffusion_iterations: 30,
            pressure_iterations: 4,
        }
    }
}

impl SolverConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }
    pub fn with_viscosity(mut self, viscosity: f32) -> Self {
        if viscosity > 0.0 {
            self.viscosity = Some(viscosity);
        } else {
            log::warn!("viscosity {} <= 0, diffusion disabled", viscosity);
            self.viscosity = None;
        }
        self
    }
    /// The viscosity the solver will diffuse with, if any.
    pub fn effective_viscosity(&self) -> Option<f32> {
        self.viscosity.filter(|v| *v > 0.0)
    }
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FluidError::InvalidConfig(format!(
                "grid must be at least 1x1, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.grid_square_size > 0.0 && self.grid_square_size.is_finite()) {
            return Err(FluidError::InvalidConfig(format!(
                "grid square size must be positive, got {}",
                self.grid_square_size
            )));
        }
        if !(self.density > 0.0 && self.density.is_finite()) {
            return Err(FluidError::InvalidConfig(format!(
                "density must be positive, got {}",
                self.density
            )));
        }
        if let Some(v) = self.viscosity {
            if !v.is_finite() {
                return Err(FluidError::InvalidConfig(format!(
                    "viscosity must be finite, got {}",
                    v
                )));
            }
        }
        if self.pressure_iterations > STABLE_PRESSURE_ITERATIONS {
            log::warn!(
                "{} pressure iterations is past the stable range (<= {}), expect pressure waves",
                self.pressure_iterations,
                STABLE_PRESSURE_ITERATIONS
            );
        }
        Ok(())
    }
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

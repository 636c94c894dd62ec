use std::f32::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    device::{Device, Stream},
    grid::GridField,
    kernel::Kernel,
    FluidError, Result,
};

/// How a field of grass blades responds to the wind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassConfig {
    pub blades_x: u32,
    pub blades_y: u32,
    /// Offset per unit of wind velocity.
    pub gain: f32,
    /// Relative amplitude of the per-blade oscillation on top of the wind.
    pub sway: f32,
    /// Angular frequency of the oscillation, in radians per second.
    pub frequency: f32,
}

impl Default for GrassConfig {
    fn default() -> Self {
        Self {
            blades_x: 128,
            blades_y: 128,
            gain: 1.0,
            sway: 0.2,
            frequency: 4.0,
        }
    }
}

impl GrassConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blades_x == 0 || self.blades_y == 0 {
            return Err(FluidError::InvalidConfig(format!(
                "need at least one blade, got {}x{}",
                self.blades_x, self.blades_y
            )));
        }
        if ![self.gain, self.sway, self.frequency]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(FluidError::InvalidConfig(format!(
                "grass response must be finite: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// The `reactToWind` program: per-blade wind offsets from the solver's
/// velocity field.
pub struct GrassWind {
    react: Kernel,
}

impl GrassWind {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            react: device.create_kernel("reactToWind")?,
        })
    }
    /// `offsets = gain * wind(position) * (1 + sway * sin(frequency * time + phase))`
    ///
    /// `positions` holds each blade's spot on the wind grid in `[0, 1]^2`.
    /// The blade fields must all have the same shape; `wind` may have any.
    #[allow(clippy::too_many_arguments)]
    pub fn react_to_wind(
        &self,
        stream: &Stream,
        positions: &GridField,
        phases: &GridField,
        wind: &GridField,
        offsets: &GridField,
        time: f32,
        config: &GrassConfig,
    ) -> Result<()> {
        self.react
            .invoke()
            .field(positions)
            .field(phases)
            .field(wind)
            .field(offsets)
            .scalar(time)
            .scalar(config.gain)
            .scalar(config.sway)
            .scalar(config.frequency)
            .dispatch_async(stream)
    }
}

/// A rectangular patch of blades scattered over the wind grid.
pub struct Meadow {
    config: GrassConfig,
    positions: GridField,
    phases: GridField,
    offsets: GridField,
    program: GrassWind,
}

impl Meadow {
    /// Lays the blades out on a jittered lattice with random phases.
    pub fn scatter(device: &Device, stream: &Stream, config: GrassConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let (bx, by) = (config.blades_x, config.blades_y);
        let mut rng = StdRng::seed_from_u64(seed);
        let positions = GridField::create_owned(device, bx, by, 2)?;
        let mut values = Vec::with_capacity(bx as usize * by as usize * 2);
        for y in 0..by {
            for x in 0..bx {
                values.push((x as f32 + rng.gen_range(-0.5..0.5) + 2.0) / (bx + 4) as f32);
                values.push((y as f32 + rng.gen_range(-0.5..0.5) + 2.0) / (by + 4) as f32);
            }
        }
        positions.copy_from(stream, &values)?;
        let phases = GridField::create_owned(device, bx, by, 1)?;
        let values: Vec<f32> = (0..bx * by).map(|_| rng.gen_range(0.0..TAU)).collect();
        phases.copy_from(stream, &values)?;
        let offsets = GridField::create_owned(device, bx, by, 2)?;
        offsets.zero(stream)?;
        stream.synchronize()?;
        log::debug!("scattered {} blades", bx * by);
        Ok(Self {
            config,
            positions,
            phases,
            offsets,
            program: GrassWind::new(device)?,
        })
    }
    pub fn config(&self) -> &GrassConfig {
        &self.config
    }
    pub fn blade_count(&self) -> usize {
        self.config.blades_x as usize * self.config.blades_y as usize
    }
    pub fn positions(&self) -> &GridField {
        &self.positions
    }
    pub fn phases(&self) -> &GridField {
        &self.phases
    }
    /// Per-blade wind offsets, as the grass renderer reads them.
    pub fn offsets(&self) -> &GridField {
        &self.offsets
    }
    pub fn react(&self, stream: &Stream, wind: &GridField, time: f32) -> Result<()> {
        self.program.react_to_wind(
            stream,
            &self.positions,
            &self.phases,
            wind,
            &self.offsets,
            time,
            &self.config,
        )
    }
    pub fn mean_offset(&self, stream: &Stream) -> Result<[f32; 2]> {
        let values = self.offsets.copy_to_vec(stream)?;
        let n = self.blade_count() as f32;
        let sum = values
            .chunks_exact(2)
            .fold([0.0f32; 2], |acc, v| [acc[0] + v[0], acc[1] + v[1]]);
        Ok([sum[0] / n, sum[1] / n])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_device;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn uniform(device: &Device, stream: &Stream, w: u32, h: u32, v: [f32; 2]) -> GridField {
        let field = GridField::create_owned(device, w, h, 2).unwrap();
        field.fill_with(stream, |_, _| v).unwrap();
        field
    }

    #[test]
    fn blades_follow_the_wind_and_sway_with_phase() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let stream = device.create_stream();
        let program = GrassWind::new(&device).unwrap();
        let config = GrassConfig {
            gain: 0.5,
            sway: 0.25,
            ..Default::default()
        };
        // 15 blades: the last work group is mostly padding
        let positions = GridField::create_owned(&device, 15, 1, 2).unwrap();
        positions
            .fill_with(&stream, |x, _| [x as f32 / 14.0, 0.5])
            .unwrap();
        let phases = GridField::create_owned(&device, 15, 1, 1).unwrap();
        phases
            .fill_with(&stream, |x, _| [if x % 2 == 0 { 0.0 } else { FRAC_PI_2 }, 0.0])
            .unwrap();
        let wind = uniform(&device, &stream, 8, 8, [2.0, -1.0]);
        let offsets = GridField::create_owned(&device, 15, 1, 2).unwrap();
        program
            .react_to_wind(&stream, &positions, &phases, &wind, &offsets, 0.0, &config)
            .unwrap();
        let out = offsets.copy_to_vec(&stream).unwrap();
        for (i, o) in out.chunks_exact(2).enumerate() {
            let scale = if i % 2 == 0 { 0.5 } else { 0.5 * 1.25 };
            assert_relative_eq!(o[0], 2.0 * scale, epsilon = 1e-5);
            assert_relative_eq!(o[1], -1.0 * scale, epsilon = 1e-5);
        }
    }

    #[test]
    fn blades_sample_the_wind_where_they_stand() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let stream = device.create_stream();
        let program = GrassWind::new(&device).unwrap();
        let config = GrassConfig {
            sway: 0.0,
            ..Default::default()
        };
        // wind blows +x on the left half of a 4x4 grid, -y on the right
        let wind = GridField::create_owned(&device, 4, 4, 2).unwrap();
        wind.fill_with(&stream, |x, _| if x < 2 { [1.0, 0.0] } else { [0.0, -1.0] })
            .unwrap();
        let positions = GridField::create_owned(&device, 2, 1, 2).unwrap();
        // cell centers (0, 1) and (3, 2)
        positions
            .copy_from(&stream, &[0.125, 0.375, 0.875, 0.625])
            .unwrap();
        let phases = GridField::create_owned(&device, 2, 1, 1).unwrap();
        phases.zero(&stream).unwrap();
        let offsets = GridField::create_owned(&device, 2, 1, 2).unwrap();
        program
            .react_to_wind(&stream, &positions, &phases, &wind, &offsets, 3.0, &config)
            .unwrap();
        let out = offsets.copy_to_vec(&stream).unwrap();
        assert_relative_eq!(out[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-5);
        assert_relative_eq!(out[2], 0.0, epsilon = 1e-5);
        assert_relative_eq!(out[3], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn blade_fields_must_agree_but_wind_may_differ() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let stream = device.create_stream();
        let program = GrassWind::new(&device).unwrap();
        let config = GrassConfig::default();
        let positions = GridField::create_owned(&device, 6, 6, 2).unwrap();
        let phases = GridField::create_owned(&device, 6, 5, 1).unwrap();
        let wind = GridField::create_owned(&device, 32, 32, 2).unwrap();
        let offsets = GridField::create_owned(&device, 6, 6, 2).unwrap();
        assert!(matches!(
            program.react_to_wind(&stream, &positions, &phases, &wind, &offsets, 0.0, &config),
            Err(FluidError::DimensionMismatch { .. })
        ));
        let phases = GridField::create_owned(&device, 6, 6, 1).unwrap();
        program
            .react_to_wind(&stream, &positions, &phases, &wind, &offsets, 0.0, &config)
            .unwrap();
        assert_eq!(stream.pending(), 1);
        let narrow = GridField::create_owned(&device, 6, 6, 1).unwrap();
        assert!(matches!(
            program.react_to_wind(&stream, &positions, &phases, &wind, &narrow, 0.0, &config),
            Err(FluidError::Dispatch { .. })
        ));
    }

    #[test]
    fn scattered_meadow_stays_on_the_grid() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let stream = device.create_stream();
        let config = GrassConfig {
            blades_x: 9,
            blades_y: 7,
            gain: 2.0,
            sway: 0.0,
            ..Default::default()
        };
        let meadow = Meadow::scatter(&device, &stream, config, 42).unwrap();
        assert_eq!(meadow.blade_count(), 63);
        let positions = meadow.positions().copy_to_vec(&stream).unwrap();
        assert!(positions.iter().all(|p| *p > 0.0 && *p < 1.0));
        let phases = meadow.phases().copy_to_vec(&stream).unwrap();
        assert!(phases.iter().all(|p| (0.0..TAU).contains(p)));
        assert_eq!(meadow.mean_offset(&stream).unwrap(), [0.0, 0.0]);

        let wind = uniform(&device, &stream, 16, 16, [0.5, 0.25]);
        meadow.react(&stream, &wind, 1.0).unwrap();
        let [mx, my] = meadow.mean_offset(&stream).unwrap();
        assert_relative_eq!(mx, 1.0, epsilon = 1e-5);
        assert_relative_eq!(my, 0.5, epsilon = 1e-5);

        assert!(matches!(
            Meadow::scatter(
                &device,
                &stream,
                GrassConfig {
                    blades_x: 0,
                    ..Default::default()
                },
                1
            ),
            Err(FluidError::InvalidConfig(_))
        ));
    }
}

mod config;
mod roles;

pub use config::{SolverConfig, STABLE_PRESSURE_ITERATIONS};
use roles::{FieldRoles, Slot, ARENA_SIZE, PRESSURE, SCRATCH, VELOCITY};

use crate::{
    device::{Device, Stream},
    grid::GridField,
    profile,
    sharing::{expect_acquired, SharingGate},
    stages::StageKernels,
    surface::Surface,
    FluidError, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    Uninitialized,
    Ready,
    Updating,
    Released,
}

struct Resources {
    stream: Stream,
    stages: StageKernels,
    // velocity, pressure, then the two scratch fields
    fields: Vec<GridField>,
}

impl Resources {
    fn field(&self, slot: Slot) -> &GridField {
        &self.fields[slot.0]
    }
    fn shared_fields(&self) -> Vec<&GridField> {
        self.fields.iter().filter(|f| f.is_shared()).collect()
    }
}

/// 2D incompressible flow on a fixed grid: semi-Lagrangian advection,
/// optional viscous diffusion, external forces and a Jacobi pressure
/// projection, all on the device.
pub struct FluidSolver {
    config: SolverConfig,
    state: SolverState,
    resources: Option<Resources>,
}

impl std::fmt::Debug for FluidSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluidSolver")
            .field("size", &(self.config.width, self.config.height))
            .field("state", &self.state)
            .finish()
    }
}

impl FluidSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            state: SolverState::Uninitialized,
            resources: None,
        }
    }
    pub fn state(&self) -> SolverState {
        self.state
    }
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Allocates the fields and kernels. Velocity and pressure alias the
    /// given surfaces when present; everything else lives in device memory.
    /// On failure nothing is kept and the solver stays uninitialized.
    pub fn create(
        &mut self,
        device: &Device,
        velocity_surface: Option<&Surface>,
        pressure_surface: Option<&Surface>,
    ) -> Result<()> {
        if self.state != SolverState::Uninitialized {
            return Err(FluidError::InvalidState(format!(
                "create called on a {:?} solver",
                self.state
            )));
        }
        self.config.validate()?;
        let resources = self.create_resources(device, velocity_surface, pressure_surface)?;
        log::info!(
            "fluid solver ready: {}x{} cells, h = {}, density = {}, viscosity = {:?}",
            self.config.width,
            self.config.height,
            self.config.grid_square_size,
            self.config.density,
            self.config.effective_viscosity()
        );
        self.resources = Some(resources);
        self.state = SolverState::Ready;
        Ok(())
    }

    fn create_resources(
        &self,
        device: &Device,
        velocity_surface: Option<&Surface>,
        pressure_surface: Option<&Surface>,
    ) -> Result<Resources> {
        let (width, height) = (self.config.width, self.config.height);
        let bind = |surface: Option<&Surface>, channels: u32| -> Result<GridField> {
            match surface {
                Some(surface) => {
                    if (surface.width(), surface.height()) != (width, height) {
                        return Err(FluidError::ResourceBind {
                            handle: surface.native_handle(),
                            reason: format!(
                                "surface is {}x{} but the solver grid is {}x{}",
                                surface.width(),
                                surface.height(),
                                width,
                                height
                            ),
                        });
                    }
                    GridField::create_shared(device, surface, channels)
                }
                None => GridField::create_owned(device, width, height, channels),
            }
        };
        let stages = StageKernels::new(device)?;
        let mut fields = Vec::with_capacity(ARENA_SIZE);
        fields.push(bind(velocity_surface, 2)?);
        fields.push(bind(pressure_surface, 1)?);
        for _ in SCRATCH {
            fields.push(GridField::create_owned(device, width, height, 2)?);
        }
        let stream = device.create_stream();
        if self.config.zero_initialize_shared_textures {
            for field in fields.iter().filter(|f| f.is_shared()) {
                field.zero(&stream)?;
            }
        }
        stream.synchronize()?;
        Ok(Resources {
            stream,
            stages,
            fields,
        })
    }

    fn resources(&self) -> Result<&Resources> {
        match (&self.resources, self.state) {
            (Some(resources), SolverState::Ready) => Ok(resources),
            _ => Err(FluidError::InvalidState(format!(
                "solver is {:?}, not Ready",
                self.state
            ))),
        }
    }
    /// The caller-visible velocity field (2 channels).
    pub fn velocities(&self) -> Result<&GridField> {
        Ok(self.resources()?.field(VELOCITY))
    }
    /// The caller-visible pressure field (1 channel).
    pub fn pressure(&self) -> Result<&GridField> {
        Ok(self.resources()?.field(PRESSURE))
    }
    pub fn stream(&self) -> Result<&Stream> {
        Ok(&self.resources()?.stream)
    }

    /// Advances the flow by `dt` seconds, optionally pushing it with
    /// `forces` (acceleration per cell). Shared fields must already be
    /// acquired; see [`FluidSolver::step`] for a version that brackets the
    /// frame itself.
    ///
    /// A failing stage abandons the whole frame: nothing it recorded runs,
    /// the fields keep their previous contents and the solver stays usable.
    pub fn update(&mut self, dt: f32, forces: Option<&GridField>) -> Result<()> {
        let resources = self.resources()?;
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(FluidError::InvalidConfig(format!(
                "time step must be positive, got {}",
                dt
            )));
        }
        for field in resources.shared_fields() {
            expect_acquired(field)?;
        }
        self.state = SolverState::Updating;
        let result = match &self.resources {
            Some(resources) => resources
                .stream
                .with_scope(|stream| record_frame(&self.config, resources, stream, dt, forces)),
            None => Err(FluidError::InvalidState("solver lost its fields".to_string())),
        };
        self.state = SolverState::Ready;
        if let Err(e) = &result {
            log::error!("frame abandoned: {}", e);
        }
        result
    }

    /// One frame including the acquire/release handshake for every field
    /// that aliases a surface.
    pub fn step(&mut self, dt: f32, forces: Option<&GridField>) -> Result<()> {
        {
            let resources = self.resources()?;
            SharingGate::acquire_all(&resources.stream, &resources.shared_fields())?;
        }
        let result = self.update(dt, forces);
        let resources = self.resources()?;
        let released = SharingGate::release_all(&resources.stream, &resources.shared_fields());
        result.and(released)
    }

    /// Frees the device fields. Surfaces stay with their owner. Calling it
    /// again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        match self.state {
            SolverState::Released => return Ok(()),
            SolverState::Updating => {
                return Err(FluidError::InvalidState(
                    "release called during an update".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(resources) = self.resources.take() {
            resources.stream.synchronize()?;
            let shared = resources.shared_fields();
            if shared.iter().any(|f| f.is_acquired()) {
                log::warn!("releasing solver with surfaces still acquired");
                SharingGate::release_all(
                    &resources.stream,
                    &shared.into_iter().filter(|f| f.is_acquired()).collect::<Vec<_>>(),
                )?;
            }
            for field in resources.fields {
                field.destroy();
            }
        }
        self.state = SolverState::Released;
        log::info!("fluid solver released");
        Ok(())
    }
}

impl Drop for FluidSolver {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("failed to release fluid solver: {}", e);
        }
    }
}

fn record_frame(
    config: &SolverConfig,
    resources: &Resources,
    stream: &Stream,
    dt: f32,
    forces: Option<&GridField>,
) -> Result<()> {
    let stages = &resources.stages;
    let f = move |slot: Slot| resources.field(slot);
    let h = config.grid_square_size;
    let mut roles = FieldRoles::default();

    profile("advect", || -> Result<()> {
        stages.advect(
            stream,
            f(roles.velocity),
            f(roles.velocity),
            f(roles.free1),
            dt,
            h,
        )?;
        roles.swap_velocity();
        Ok(())
    })?;

    if let Some(viscosity) = config.effective_viscosity() {
        let alpha = h * h / (viscosity * dt);
        let beta = 4.0 + alpha;
        profile("diffuse", || -> Result<()> {
            let (mut t1, mut t2) = (roles.velocity, roles.free1);
            for _ in 0..config.diffusion_iterations {
                for _ in 0..2 {
                    stages.jacobi(stream, f(t1), f(t1), f(t2), alpha, beta)?;
                    std::mem::swap(&mut t1, &mut t2);
                }
            }
            debug_assert_eq!(t1, roles.velocity);
            Ok(())
        })?;
    }

    if let Some(forces) = forces {
        profile("add_forces", || -> Result<()> {
            stages.add_scaled(stream, f(roles.velocity), forces, dt, f(roles.free1))?;
            roles.swap_velocity();
            Ok(())
        })?;
    }

    profile("project", || -> Result<()> {
        stages.divergence(stream, f(roles.velocity), f(roles.free1), h)?;
        let divergence = roles.hold()?;

        let (mut t1, mut t2) = (roles.pressure, roles.free1);
        for _ in 0..config.pressure_iterations {
            for _ in 0..2 {
                stages.jacobi(stream, f(t1), f(divergence), f(t2), -h * h, 4.0)?;
                std::mem::swap(&mut t1, &mut t2);
            }
        }
        debug_assert_eq!(t1, roles.pressure);
        roles.recycle(divergence)?;

        stages.gradient(stream, f(roles.pressure), f(roles.free1), h)?;
        let gradient = roles.hold()?;
        stages.add_scaled(
            stream,
            f(roles.velocity),
            f(gradient),
            -1.0 / config.density,
            f(roles.free1),
        )?;
        roles.swap_velocity();
        roles.recycle(gradient)
    })?;

    profile("boundaries", || -> Result<()> {
        stages.velocity_boundary(stream, f(roles.velocity), f(roles.free1))?;
        roles.swap_velocity();
        stages.pressure_boundary(stream, f(roles.pressure), f(roles.free1))?;
        roles.swap_pressure();
        Ok(())
    })?;

    for (from, to) in roles.copy_back() {
        stages.copy(stream, f(from), f(to))?;
    }
    Ok(())
}

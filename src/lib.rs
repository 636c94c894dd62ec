pub mod device;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod fluid;
pub mod grass;
pub mod grid;
pub mod kernel;
pub mod sharing;
pub mod stages;
pub mod surface;

pub use device::{Device, DeviceConfig, DeviceLimits, Stream};
pub use dispatch::{factor_evenly, plan_dispatch, plan_linear, DispatchPlan};
pub use error::{FluidError, Result};
pub use export::{dump_field_png, dump_velocity_magnitude_exr};
pub use fluid::{FluidSolver, SolverConfig, SolverState, STABLE_PRESSURE_ITERATIONS};
pub use grass::{GrassConfig, GrassWind, Meadow};
pub use grid::GridField;
pub use kernel::{ArgKind, DispatchShape, Invocation, Kernel};
pub use sharing::{SharedAccess, SharingGate};
pub use stages::StageKernels;
pub use surface::{Surface, SurfaceOwner, TextureFormat};

pub(crate) fn profile<R>(name: &str, f: impl FnOnce() -> R) -> R {
    let t0 = std::time::Instant::now();
    let r = f();
    let elapsed = (std::time::Instant::now() - t0).as_micros();
    log::debug!("[{}] recorded in {}us", name, elapsed);
    r
}

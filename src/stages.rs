use crate::{
    device::{Device, Stream},
    grid::GridField,
    kernel::Kernel,
    Result,
};

/// Handles to the seven solver stages, each recording one full-grid
/// dispatch. Outputs must never alias inputs.
pub struct StageKernels {
    jacobi: Kernel,
    advect: Kernel,
    divergence: Kernel,
    gradient: Kernel,
    add_scaled: Kernel,
    velocity_boundary: Kernel,
    pressure_boundary: Kernel,
}

impl StageKernels {
    pub const ENTRY_POINTS: [&'static str; 7] = [
        "jacobi",
        "advect",
        "divergence",
        "gradient",
        "addScaled",
        "velocityBoundary",
        "pressureBoundary",
    ];

    pub fn new(device: &Device) -> Result<Self> {
        let kernel = |entry: &str| -> Result<Kernel> {
            let kernel = device.create_kernel(entry)?;
            log::debug!("created kernel `{}`", entry);
            Ok(kernel)
        };
        Ok(Self {
            jacobi: kernel("jacobi")?,
            advect: kernel("advect")?,
            divergence: kernel("divergence")?,
            gradient: kernel("gradient")?,
            add_scaled: kernel("addScaled")?,
            velocity_boundary: kernel("velocityBoundary")?,
            pressure_boundary: kernel("pressureBoundary")?,
        })
    }

    /// One relaxation sweep of `(lap - alpha) x = b`:
    /// `output = (sum of x0's four neighbours + alpha * b) / beta`.
    pub fn jacobi(
        &self,
        stream: &Stream,
        x0: &GridField,
        b: &GridField,
        output: &GridField,
        alpha: f32,
        beta: f32,
    ) -> Result<()> {
        self.jacobi
            .invoke()
            .field(x0)
            .field(b)
            .field(output)
            .scalar(alpha)
            .scalar(1.0 / beta)
            .dispatch_async(stream)
    }

    pub fn advect(
        &self,
        stream: &Stream,
        quantity: &GridField,
        velocity: &GridField,
        output: &GridField,
        dt: f32,
        grid_size: f32,
    ) -> Result<()> {
        self.advect
            .invoke()
            .field(quantity)
            .field(velocity)
            .field(output)
            .scalar(dt / grid_size)
            .dispatch_async(stream)
    }

    pub fn divergence(
        &self,
        stream: &Stream,
        vec_field: &GridField,
        output: &GridField,
        grid_size: f32,
    ) -> Result<()> {
        self.divergence
            .invoke()
            .field(vec_field)
            .field(output)
            .scalar(1.0 / grid_size)
            .dispatch_async(stream)
    }

    pub fn gradient(
        &self,
        stream: &Stream,
        func: &GridField,
        output: &GridField,
        grid_size: f32,
    ) -> Result<()> {
        self.gradient
            .invoke()
            .field(func)
            .field(output)
            .scalar(1.0 / grid_size)
            .dispatch_async(stream)
    }

    /// `sum = a + multiplier * b`
    pub fn add_scaled(
        &self,
        stream: &Stream,
        a: &GridField,
        b: &GridField,
        multiplier: f32,
        sum: &GridField,
    ) -> Result<()> {
        self.add_scaled
            .invoke()
            .field(a)
            .field(b)
            .scalar(multiplier)
            .field(sum)
            .dispatch_async(stream)
    }

    pub fn copy(&self, stream: &Stream, from: &GridField, to: &GridField) -> Result<()> {
        self.add_scaled(stream, from, from, 0.0, to)
    }

    pub fn velocity_boundary(
        &self,
        stream: &Stream,
        input: &GridField,
        output: &GridField,
    ) -> Result<()> {
        self.velocity_boundary
            .invoke()
            .field(input)
            .field(output)
            .dispatch_async(stream)
    }

    pub fn pressure_boundary(
        &self,
        stream: &Stream,
        input: &GridField,
        output: &GridField,
    ) -> Result<()> {
        self.pressure_boundary
            .invoke()
            .field(input)
            .field(output)
            .dispatch_async(stream)
    }
}

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    dispatch::next_multiple,
    kernel::{Kernel, Pipeline, PipelineKey, PROGRAM},
    surface::TextureFormat,
    FluidError, Result,
};

/// Compute limits of a device: `max_compute_invocations_per_workgroup`,
/// `max_compute_workgroup_size_{x,y,z}` and
/// `max_compute_workgroups_per_dimension`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub max_work_groups_per_dimension: usize,
}

impl DeviceLimits {
    fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x as usize,
                limits.max_compute_workgroup_size_y as usize,
                limits.max_compute_workgroup_size_z as usize,
            ],
            max_work_groups_per_dimension: limits.max_compute_workgroups_per_dimension as usize,
        }
    }
}

impl fmt::Display for DeviceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max work group size {}, max work item sizes {} x {} x {}",
            self.max_work_group_size,
            self.max_work_item_sizes[0],
            self.max_work_item_sizes[1],
            self.max_work_item_sizes[2]
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Ask for the software adapter instead of a hardware one.
    pub force_fallback_adapter: bool,
    /// Work group size kernels are planned around. wgpu has no per-pipeline
    /// query, so `None` models a device that cannot report one.
    pub preferred_work_group_size: Option<usize>,
    /// Caps `max_compute_invocations_per_workgroup` below the adapter's.
    pub max_work_group_size: Option<u32>,
    /// Caps `max_compute_workgroup_size_{x,y,z}` below the adapter's.
    pub max_work_item_sizes: Option<[u32; 3]>,
    /// Whether surfaces may be bound as solver fields.
    pub surface_sharing: bool,
    /// Budget for owned fields, in floats.
    pub max_allocation_texels: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "grass-wind".to_string(),
            force_fallback_adapter: false,
            preferred_work_group_size: Some(64),
            max_work_group_size: None,
            max_work_item_sizes: None,
            surface_sharing: true,
            max_allocation_texels: 1 << 26,
        }
    }
}

impl DeviceConfig {
    /// A CPU-style device: one-dimensional work groups only, and no surface
    /// sharing. Any square-ish 2D work group is rejected at dispatch.
    pub fn cpu() -> Self {
        Self {
            name: "grass-wind-cpu".to_string(),
            preferred_work_group_size: Some(128),
            max_work_item_sizes: Some([256, 1, 1]),
            surface_sharing: false,
            ..Default::default()
        }
    }
    fn apply(&self, mut limits: wgpu::Limits) -> wgpu::Limits {
        if let Some(n) = self.max_work_group_size {
            limits.max_compute_invocations_per_workgroup =
                limits.max_compute_invocations_per_workgroup.min(n);
        }
        if let Some([x, y, z]) = self.max_work_item_sizes {
            limits.max_compute_workgroup_size_x = limits.max_compute_workgroup_size_x.min(x);
            limits.max_compute_workgroup_size_y = limits.max_compute_workgroup_size_y.min(y);
            limits.max_compute_workgroup_size_z = limits.max_compute_workgroup_size_z.min(z);
        }
        limits
    }
}

struct DeviceInner {
    config: DeviceConfig,
    info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    allocated: Arc<AtomicUsize>,
    // bound to the input slots a kernel leaves unused
    placeholder: wgpu::TextureView,
    pipelines: Mutex<HashMap<PipelineKey, Arc<Pipeline>>>,
}

/// Handle to a wgpu device and its queue. Cloning is cheap; every clone
/// refers to the same device, pipeline cache and allocation budget.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.config.name)
            .field("adapter", &self.inner.info.name)
            .field("backend", &self.inner.info.backend)
            .field("allocated_texels", &self.allocated_texels())
            .finish()
    }
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        if config.max_work_group_size == Some(0)
            || config.max_work_item_sizes.map_or(false, |s| s.contains(&0))
        {
            return Err(FluidError::InvalidConfig(format!(
                "device `{}` is configured with a zero work group limit",
                config.name
            )));
        }
        pollster::block_on(Self::request(config))
    }

    async fn request(config: DeviceConfig) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
            .ok_or_else(|| FluidError::DeviceQuery("no suitable GPU adapter".to_string()))?;
        let info = adapter.get_info();
        let required_limits = config.apply(adapter.limits());
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(&config.name),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|e| FluidError::DeviceQuery(format!("request device: {}", e)))?;
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("uncaptured device error: {}", error);
        }));
        let limits = DeviceLimits::from_wgpu(&device.limits());
        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("texture:placeholder"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());
        log::info!(
            "created device `{}` on {} ({:?}), preferred work group {:?}, {}",
            config.name,
            info.name,
            info.backend,
            config.preferred_work_group_size,
            limits
        );
        Ok(Self {
            inner: Arc::new(DeviceInner {
                config,
                info,
                device,
                queue,
                limits,
                allocated: Arc::new(AtomicUsize::new(0)),
                placeholder,
                pipelines: Mutex::new(HashMap::new()),
            }),
        })
    }
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.inner.info
    }
    pub fn limits(&self) -> Result<DeviceLimits> {
        Ok(self.inner.limits.clone())
    }
    pub fn preferred_work_group_size(&self, kernel: &Kernel) -> Result<usize> {
        match self.inner.config.preferred_work_group_size {
            Some(n) if n > 0 => Ok(n.min(self.inner.limits.max_work_group_size)),
            _ => Err(FluidError::DeviceQuery(format!(
                "device `{}` did not report a work group size for `{}`",
                self.name(),
                kernel.name()
            ))),
        }
    }
    pub(crate) fn same_as(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
    pub fn supports_sharing(&self) -> bool {
        self.inner.config.surface_sharing
    }
    /// Looks up `entry` in the program and builds its pipeline, so a broken
    /// entry point fails here rather than at its first dispatch.
    pub fn create_kernel(&self, entry: &str) -> Result<Kernel> {
        let def = PROGRAM.get(entry).ok_or_else(|| FluidError::KernelBuild {
            entry: entry.to_string(),
            reason: "no such entry point in program".to_string(),
        })?;
        let kernel = Kernel::new(self.clone(), def);
        kernel.pipeline(TextureFormat::Rg32F, [1, 1])?;
        Ok(kernel)
    }
    pub fn create_stream(&self) -> Stream {
        Stream {
            device: self.clone(),
            pending: Mutex::new(Vec::new()),
        }
    }
    /// Floats currently held by owned fields on this device.
    pub fn allocated_texels(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }
    /// Charges `texels` floats against the budget until the returned guard
    /// is dropped.
    pub(crate) fn reserve(&self, texels: usize) -> Result<Allocation> {
        let budget = self.inner.config.max_allocation_texels;
        let counter = &self.inner.allocated;
        let mut current = counter.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(texels).filter(|n| *n <= budget) {
                Some(next) => next,
                None => {
                    return Err(FluidError::Allocation {
                        texels,
                        reason: format!(
                            "device `{}` has {} of {} texels in use",
                            self.name(),
                            current,
                            budget
                        ),
                    })
                }
            };
            match counter.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(Allocation {
            counter: counter.clone(),
            texels,
        })
    }
    pub(crate) fn create_texture(
        &self,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<wgpu::Texture> {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        if format.is_float() {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        self.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: extent(width, height),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: format.wgpu(),
                usage,
                view_formats: &[],
            })
        })
        .map_err(|e| FluidError::Allocation {
            texels: width as usize * height as usize * format.components(),
            reason: e.to_string(),
        })
    }
    /// Reads a whole texture back, `components()` floats per texel.
    pub(crate) fn read_texture(
        &self,
        texture: &wgpu::Texture,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<f32>> {
        let device = &self.inner.device;
        let row_bytes = width * format.texel_bytes();
        let padded_row = next_multiple(
            row_bytes as usize,
            wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize,
        );
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded_row * height as usize) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("enc.readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row as u32),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        self.inner.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FluidError::Backend(format!("readback failed: {}", e))),
            Err(_) => {
                return Err(FluidError::Backend(
                    "readback channel disconnected, device lost?".to_string(),
                ))
            }
        }
        let data = slice.get_mapped_range();
        let mut texels =
            Vec::with_capacity(width as usize * height as usize * format.components());
        for row in data.chunks_exact(padded_row) {
            let row = &row[..row_bytes as usize];
            match format {
                TextureFormat::Rgba8 => texels.extend(row.iter().map(|b| *b as f32 / 255.0)),
                _ => texels.extend_from_slice(bytemuck::cast_slice::<u8, f32>(row)),
            }
        }
        drop(data);
        staging.unmap();
        Ok(texels)
    }
    pub(crate) fn write_texture(
        &self,
        texture: &wgpu::Texture,
        format: TextureFormat,
        width: u32,
        height: u32,
        texels: &[f32],
    ) -> Result<()> {
        let bytes: Vec<u8> = match format {
            TextureFormat::Rgba8 => texels
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
            _ => bytemuck::cast_slice(texels).to_vec(),
        };
        self.scoped(|_| {
            self.inner.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &bytes,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(width * format.texel_bytes()),
                    rows_per_image: Some(height),
                },
                extent(width, height),
            )
        })
        .map_err(|e| FluidError::Backend(format!("texture upload failed: {}", e)))
    }
    /// Runs `f` inside validation and out-of-memory error scopes and turns
    /// whatever the device reported into an error.
    pub(crate) fn scoped<R>(
        &self,
        f: impl FnOnce(&wgpu::Device) -> R,
    ) -> std::result::Result<R, wgpu::Error> {
        let device = &self.inner.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let r = f(device);
        let validation = pollster::block_on(device.pop_error_scope());
        let oom = pollster::block_on(device.pop_error_scope());
        match validation.or(oom) {
            Some(e) => Err(e),
            None => Ok(r),
        }
    }
    pub(crate) fn wgpu(&self) -> &wgpu::Device {
        &self.inner.device
    }
    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }
    pub(crate) fn placeholder(&self) -> &wgpu::TextureView {
        &self.inner.placeholder
    }
    pub(crate) fn pipelines(&self) -> &Mutex<HashMap<PipelineKey, Arc<Pipeline>>> {
        &self.inner.pipelines
    }
}

pub(crate) fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// A share of the device's field budget, returned on drop.
pub(crate) struct Allocation {
    counter: Arc<AtomicUsize>,
    texels: usize,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.texels, Ordering::AcqRel);
    }
}

/// One recorded dispatch.
pub(crate) struct Command {
    pub(crate) label: &'static str,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) bind_group: wgpu::BindGroup,
    pub(crate) groups: [u32; 2],
}

/// An in-order command queue. Dispatches are recorded without blocking and
/// submitted as one compute pass, in recording order, at the next
/// [`Stream::synchronize`].
pub struct Stream {
    device: Device,
    pending: Mutex<Vec<Command>>,
}

impl Stream {
    pub fn device(&self) -> &Device {
        &self.device
    }
    pub(crate) fn submit(&self, command: Command) {
        self.pending.lock().push(command);
    }
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
    /// Submits everything recorded so far and waits for the device to finish.
    pub fn synchronize(&self) -> Result<()> {
        let commands = std::mem::take(&mut *self.pending.lock());
        if commands.is_empty() {
            return Ok(());
        }
        log::trace!("submitting {} dispatches", commands.len());
        self.device
            .scoped(|device| {
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("enc.stream"),
                });
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("cpass.stream"),
                        timestamp_writes: None,
                    });
                    for command in &commands {
                        log::trace!("  {}", command.label);
                        pass.set_pipeline(&command.pipeline.pipeline);
                        pass.set_bind_group(0, &command.bind_group, &[]);
                        pass.dispatch_workgroups(command.groups[0], command.groups[1], 1);
                    }
                }
                self.device.queue().submit(Some(encoder.finish()));
                device.poll(wgpu::Maintain::Wait);
            })
            .map_err(|e| {
                let labels: Vec<_> = commands.iter().map(|c| c.label).collect();
                FluidError::Backend(format!("submitting {:?} failed: {}", labels, e))
            })
    }
    /// Drops every recorded command without running it.
    pub fn discard(&self) -> usize {
        self.discard_from(0)
    }
    fn discard_from(&self, mark: usize) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.len().saturating_sub(mark);
        pending.truncate(mark);
        dropped
    }
    /// Runs `f` and synchronizes afterwards. If `f` fails, only what it
    /// recorded is discarded; commands recorded before the scope stay queued.
    pub fn with_scope<R>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let mark = self.pending();
        match f(self) {
            Ok(r) => {
                self.synchronize()?;
                Ok(r)
            }
            Err(e) => {
                let dropped = self.discard_from(mark);
                if dropped > 0 {
                    log::warn!("discarded {} commands after failure: {}", dropped, e);
                }
                Err(e)
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize() {
            log::error!("{}", e);
        }
    }
}

/// A device for tests, or `None` when the machine has no adapter at all.
#[cfg(test)]
pub(crate) fn test_device(config: DeviceConfig) -> Option<Device> {
    match Device::new(config) {
        Ok(device) => Some(device),
        Err(FluidError::DeviceQuery(e)) => {
            eprintln!("skipping, no device: {}", e);
            None
        }
        Err(e) => panic!("{}", e),
    }
}

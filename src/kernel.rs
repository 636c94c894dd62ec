use std::{borrow::Cow, collections::HashMap, sync::Arc};

use bytemuck::{Pod, Zeroable};
use lazy_static::lazy_static;
use wgpu::util::DeviceExt;

use crate::{
    device::{Command, Device, Stream},
    dispatch::{plan_dispatch, plan_linear},
    grid::GridField,
    surface::TextureFormat,
    FluidError, Result,
};

const SOURCE: &str = include_str!("shaders/fluid.wgsl");

/// Input field slots and scalar slots the program's bind group provides.
pub const MAX_INPUTS: usize = 3;
pub const MAX_SCALARS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// A field read by the kernel. Must match the output's shape.
    Field,
    /// A field read through normalized coordinates; any shape is accepted.
    Sampled,
    /// The field the kernel writes. Every kernel has exactly one.
    Output,
    Scalar,
}

/// How the output's cells map onto invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchShape {
    /// One invocation per cell, in 2D work groups.
    Grid,
    /// One invocation per cell in row-major order, in 1D work groups.
    Linear,
}

pub struct KernelDef {
    pub name: &'static str,
    pub signature: &'static [ArgKind],
    pub min_output_channels: u32,
    pub shape: DispatchShape,
}

lazy_static! {
    /// The compiled program: every entry point a device can create.
    pub(crate) static ref PROGRAM: HashMap<&'static str, KernelDef> = {
        use ArgKind::*;
        let grid = |name: &'static str, signature: &'static [ArgKind], min_output_channels: u32| KernelDef {
            name,
            signature,
            min_output_channels,
            shape: DispatchShape::Grid,
        };
        let defs = [
            grid("jacobi", &[Field, Field, Output, Scalar, Scalar], 1),
            grid("advect", &[Field, Field, Output, Scalar], 1),
            grid("divergence", &[Field, Output, Scalar], 1),
            grid("gradient", &[Field, Output, Scalar], 2),
            grid("addScaled", &[Field, Field, Scalar, Output], 1),
            grid("velocityBoundary", &[Field, Output], 2),
            grid("pressureBoundary", &[Field, Output], 1),
            grid("zeroInitialize", &[Output], 1),
            KernelDef {
                name: "reactToWind",
                signature: &[Field, Field, Sampled, Output, Scalar, Scalar, Scalar, Scalar],
                min_output_channels: 2,
                shape: DispatchShape::Linear,
            },
        ];
        defs.into_iter().map(|def| (def.name, def)).collect()
    };
}

/// Uniform block shared by every entry point.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Params {
    size: [u32; 2],
    channels: u32,
    _pad: u32,
    in_channels: [u32; 4],
    scalars: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    entry: &'static str,
    format: TextureFormat,
    local: [usize; 2],
}

/// A compute pipeline specialized for one output format and work group.
pub(crate) struct Pipeline {
    pub(crate) pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

fn build_pipeline(device: &Device, key: PipelineKey) -> Result<Pipeline> {
    let source = SOURCE
        .replace("$OUTPUT_FORMAT", key.format.wgsl())
        .replace("$WORKGROUP_X", &key.local[0].to_string())
        .replace("$WORKGROUP_Y", &key.local[1].to_string());
    let input = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };
    device
        .scoped(|gpu| {
            let module = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fluid.wgsl"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });
            let layout = gpu.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(key.entry),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    input(1),
                    input(2),
                    input(3),
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: key.format.wgpu(),
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });
            let pipeline_layout = gpu.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(key.entry),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = gpu.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(key.entry),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: key.entry,
            });
            Pipeline { pipeline, layout }
        })
        .map_err(|e| FluidError::KernelBuild {
            entry: key.entry.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Clone)]
pub struct Kernel {
    device: Device,
    def: &'static KernelDef,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kernel({})", self.def.name)
    }
}

impl Kernel {
    pub(crate) fn new(device: Device, def: &'static KernelDef) -> Self {
        Self { device, def }
    }
    pub fn name(&self) -> &'static str {
        self.def.name
    }
    pub fn signature(&self) -> &'static [ArgKind] {
        self.def.signature
    }
    pub fn invoke(&self) -> Invocation<'_> {
        Invocation {
            kernel: self,
            args: Vec::with_capacity(self.def.signature.len()),
        }
    }
    /// The pipeline for `format` outputs with a `local` work group, built on
    /// first use and cached on the device.
    pub(crate) fn pipeline(&self, format: TextureFormat, local: [usize; 2]) -> Result<Arc<Pipeline>> {
        let key = PipelineKey {
            entry: self.def.name,
            format,
            local,
        };
        let mut cache = self.device.pipelines().lock();
        if let Some(pipeline) = cache.get(&key) {
            return Ok(pipeline.clone());
        }
        let pipeline = Arc::new(build_pipeline(&self.device, key)?);
        log::debug!(
            "built `{}` for {:?} with work group {} x {}",
            key.entry,
            format,
            local[0],
            local[1]
        );
        cache.insert(key, pipeline.clone());
        Ok(pipeline)
    }
}

enum Arg<'a> {
    Field(&'a GridField),
    Scalar(f32),
}

/// Binds arguments positionally and records the dispatch. Fields are bound
/// with [`Invocation::field`] whether the kernel reads or writes them; the
/// kernel's signature decides which one is the output.
pub struct Invocation<'a> {
    kernel: &'a Kernel,
    args: Vec<Arg<'a>>,
}

impl<'a> Invocation<'a> {
    pub fn field(mut self, field: &'a GridField) -> Self {
        self.args.push(Arg::Field(field));
        self
    }
    pub fn scalar(mut self, value: f32) -> Self {
        self.args.push(Arg::Scalar(value));
        self
    }
    fn dispatch_error(&self, reason: String) -> Result<FluidError> {
        Ok(FluidError::Dispatch {
            kernel: self.kernel.name().to_string(),
            reason,
            limits: self.kernel.device.limits()?,
        })
    }
    /// Validates the bindings, plans the work groups and records the
    /// dispatch on `stream`. Nothing runs until the stream synchronizes.
    pub fn dispatch_async(self, stream: &Stream) -> Result<()> {
        let def = self.kernel.def;
        let device = &self.kernel.device;
        let signature = self.kernel.signature();
        if self.args.len() != signature.len() {
            return Err(self.dispatch_error(format!(
                "expected {} arguments, got {}",
                signature.len(),
                self.args.len()
            ))?);
        }
        let mut inputs: Vec<(ArgKind, &GridField)> = Vec::new();
        let mut scalars = Vec::new();
        let mut output = None;
        for (i, (kind, arg)) in signature.iter().zip(&self.args).enumerate() {
            match (kind, arg) {
                (ArgKind::Field | ArgKind::Sampled, Arg::Field(f)) => inputs.push((*kind, *f)),
                (ArgKind::Output, Arg::Field(f)) => output = Some(*f),
                (ArgKind::Scalar, Arg::Scalar(v)) => scalars.push(*v),
                _ => {
                    return Err(self.dispatch_error(format!(
                        "argument #{} should be {:?}",
                        i, kind
                    ))?)
                }
            }
        }
        let output = match output {
            Some(output) => output,
            None => return Err(self.dispatch_error("no output field bound".to_string())?),
        };
        for (kind, input) in &inputs {
            if *kind == ArgKind::Field && input.shape() != output.shape() {
                return Err(FluidError::DimensionMismatch {
                    kernel: def.name.to_string(),
                    expected: output.shape(),
                    found: input.shape(),
                });
            }
            if input.aliases(output) {
                return Err(self.dispatch_error("output aliases an input".to_string())?);
            }
            input.check_accessible(def.name)?;
        }
        output.check_accessible(def.name)?;
        if output.channels() < def.min_output_channels {
            return Err(self.dispatch_error(format!(
                "output needs {} channels, has {}",
                def.min_output_channels,
                output.channels()
            ))?);
        }

        let preferred = device.preferred_work_group_size(self.kernel)?;
        let plan = match def.shape {
            DispatchShape::Grid => plan_dispatch(output.width(), output.height(), preferred)?,
            DispatchShape::Linear => plan_linear(
                output.width() as usize * output.height() as usize,
                preferred,
            )?,
        };
        let limits = device.limits()?;
        if let Err(reason) = plan.validate(&limits) {
            log::error!(
                "`{}`: work group {} x {} rejected (preferred {}, {})",
                def.name,
                plan.local[0],
                plan.local[1],
                preferred,
                limits
            );
            return Err(FluidError::Dispatch {
                kernel: def.name.to_string(),
                reason,
                limits,
            });
        }
        let pipeline = self.kernel.pipeline(output.format(), plan.local)?;

        let mut params = Params {
            size: [output.width(), output.height()],
            channels: output.channels(),
            _pad: 0,
            in_channels: [0; 4],
            scalars: [0.0; 4],
        };
        for (slot, (_, input)) in params.in_channels.iter_mut().zip(&inputs) {
            *slot = input.channels();
        }
        for (slot, value) in params.scalars.iter_mut().zip(&scalars) {
            *slot = *value;
        }
        let input_view = |i: usize| {
            inputs
                .get(i)
                .map_or(device.placeholder(), |(_, field)| field.view())
        };
        let bind_group = device.scoped(|gpu| {
            let uniform = gpu.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            gpu.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(def.name),
                layout: &pipeline.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(input_view(0)),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(input_view(1)),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(input_view(2)),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(output.view()),
                    },
                ],
            })
        });
        let bind_group = match bind_group {
            Ok(bind_group) => bind_group,
            Err(e) => return Err(self.dispatch_error(e.to_string())?),
        };
        let [groups_x, groups_y] = plan.groups();
        stream.submit(Command {
            label: def.name,
            pipeline,
            bind_group,
            groups: [groups_x as u32, groups_y as u32],
        });
        Ok(())
    }
    /// Records the dispatch and waits for the stream to drain.
    pub fn dispatch(self, stream: &Stream) -> Result<()> {
        self.dispatch_async(stream)?;
        stream.synchronize()
    }
}

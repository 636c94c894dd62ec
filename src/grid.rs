use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    device::{Allocation, Device, Stream},
    surface::{Surface, SurfaceOwner, TextureFormat},
    FluidError, Result,
};

/// A W x H grid of one or two float channels living in device memory,
/// optionally aliasing a rendering surface.
pub struct GridField {
    width: u32,
    height: u32,
    channels: u32,
    format: TextureFormat,
    device: Device,
    texture: Arc<wgpu::Texture>,
    view: wgpu::TextureView,
    surface: Option<Surface>,
    acquired: AtomicBool,
    _allocation: Option<Allocation>,
}

impl std::fmt::Debug for GridField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridField")
            .field("size", &(self.width, self.height))
            .field("channels", &self.channels)
            .field("shared", &self.surface.as_ref().map(|s| s.native_handle()))
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

fn check_shape(width: u32, height: u32, channels: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(FluidError::InvalidConfig(format!(
            "grid must be at least 1x1, got {}x{}",
            width, height
        )));
    }
    if channels == 0 || channels > 2 {
        return Err(FluidError::InvalidConfig(format!(
            "fields hold 1 or 2 channels, got {}",
            channels
        )));
    }
    Ok(())
}

impl GridField {
    pub fn create_owned(device: &Device, width: u32, height: u32, channels: u32) -> Result<Self> {
        check_shape(width, height, channels)?;
        let allocation = device.reserve(width as usize * height as usize * channels as usize)?;
        let format = TextureFormat::for_channels(channels);
        let texture = device.create_texture("field", width, height, format)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Self {
            width,
            height,
            channels,
            format,
            device: device.clone(),
            texture: Arc::new(texture),
            view,
            surface: None,
            acquired: AtomicBool::new(false),
            _allocation: Some(allocation),
        })
    }
    /// Binds a field to `surface`'s storage. The surface stays owned by the
    /// caller; the field only aliases it.
    pub fn create_shared(device: &Device, surface: &Surface, channels: u32) -> Result<Self> {
        let bind_error = |reason: String| FluidError::ResourceBind {
            handle: surface.native_handle(),
            reason,
        };
        if !device.supports_sharing() {
            return Err(bind_error(format!(
                "device `{}` does not support surface sharing",
                device.name()
            )));
        }
        if !surface.device().same_as(device) {
            return Err(bind_error(format!(
                "surface lives on device `{}`, not `{}`",
                surface.device().name(),
                device.name()
            )));
        }
        let format = surface.format();
        if !format.is_float() {
            return Err(bind_error(format!("{:?} is not a floating-point format", format)));
        }
        if format.components() < channels as usize {
            return Err(bind_error(format!(
                "{:?} cannot hold {} channels",
                format, channels
            )));
        }
        check_shape(surface.width(), surface.height(), channels)
            .map_err(|e| bind_error(e.to_string()))?;
        log::debug!(
            "bound surface {} ({}x{} {:?}) as a {}-channel field",
            surface.native_handle(),
            surface.width(),
            surface.height(),
            format,
            channels
        );
        let texture = surface.texture().clone();
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Self {
            width: surface.width(),
            height: surface.height(),
            channels,
            format,
            device: device.clone(),
            texture,
            view,
            surface: Some(surface.clone()),
            acquired: AtomicBool::new(false),
            _allocation: None,
        })
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn shape(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    pub fn channels(&self) -> u32 {
        self.channels
    }
    /// Storage format of the backing texture.
    pub fn format(&self) -> TextureFormat {
        self.format
    }
    pub fn is_shared(&self) -> bool {
        self.surface.is_some()
    }
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }
    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }
    /// Hands a shared field to compute. Pending work on `stream` is flushed
    /// first. No-op for owned fields.
    pub fn acquire(&self, stream: &Stream) -> Result<()> {
        let surface = match &self.surface {
            Some(surface) => surface,
            None => return Ok(()),
        };
        if self.is_acquired() {
            return Err(FluidError::ProtocolViolation(format!(
                "surface {} acquired twice",
                surface.native_handle()
            )));
        }
        stream.synchronize()?;
        surface.hand_over(SurfaceOwner::Compute)?;
        self.acquired.store(true, Ordering::Release);
        Ok(())
    }
    /// Hands a shared field back to graphics once every command recorded on
    /// `stream` has completed. No-op for owned fields.
    pub fn release(&self, stream: &Stream) -> Result<()> {
        let surface = match &self.surface {
            Some(surface) => surface,
            None => return Ok(()),
        };
        if !self.is_acquired() {
            return Err(FluidError::ProtocolViolation(format!(
                "surface {} released without being acquired",
                surface.native_handle()
            )));
        }
        stream.synchronize()?;
        surface.hand_over(SurfaceOwner::Graphics)?;
        self.acquired.store(false, Ordering::Release);
        Ok(())
    }
    pub(crate) fn check_accessible(&self, what: &str) -> Result<()> {
        match &self.surface {
            Some(surface) if !self.is_acquired() => Err(FluidError::ProtocolViolation(format!(
                "{} touched surface {} without acquiring it",
                what,
                surface.native_handle()
            ))),
            _ => Ok(()),
        }
    }
    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
    pub(crate) fn aliases(&self, other: &GridField) -> bool {
        Arc::ptr_eq(&self.texture, &other.texture)
    }
    /// Overwrites the field from `values`, laid out row-major with
    /// `channels()` floats per cell.
    pub fn copy_from(&self, stream: &Stream, values: &[f32]) -> Result<()> {
        self.check_accessible("host upload")?;
        let channels = self.channels as usize;
        let expected = self.width as usize * self.height as usize * channels;
        if values.len() != expected {
            return Err(FluidError::InvalidConfig(format!(
                "expected {} floats for a {}x{}x{} field, got {}",
                expected,
                self.width,
                self.height,
                channels,
                values.len()
            )));
        }
        stream.synchronize()?;
        let stride = self.format.components();
        let mut texels = vec![0.0; self.width as usize * self.height as usize * stride];
        for (texel, cell) in texels
            .chunks_exact_mut(stride)
            .zip(values.chunks_exact(channels))
        {
            texel[..channels].copy_from_slice(cell);
        }
        self.device
            .write_texture(&self.texture, self.format, self.width, self.height, &texels)
    }
    pub fn fill_with(&self, stream: &Stream, f: impl Fn(u32, u32) -> [f32; 2]) -> Result<()> {
        let channels = self.channels as usize;
        let mut values = Vec::with_capacity(self.width as usize * self.height as usize * channels);
        for y in 0..self.height {
            for x in 0..self.width {
                values.extend_from_slice(&f(x, y)[..channels]);
            }
        }
        self.copy_from(stream, &values)
    }
    pub fn copy_to_vec(&self, stream: &Stream) -> Result<Vec<f32>> {
        self.check_accessible("host readback")?;
        stream.synchronize()?;
        let channels = self.channels as usize;
        let texels = self
            .device
            .read_texture(&self.texture, self.format, self.width, self.height)?;
        Ok(texels
            .chunks_exact(self.format.components())
            .flat_map(|texel| texel[..channels].iter().copied())
            .collect())
    }
    /// Clears the field with the `zeroInitialize` kernel. Shared fields that
    /// are not already acquired are acquired for the duration of the call.
    pub fn zero(&self, stream: &Stream) -> Result<()> {
        let kernel = stream.device().create_kernel("zeroInitialize")?;
        let was_acquired = self.is_acquired();
        if !was_acquired {
            self.acquire(stream)?;
        }
        let result = kernel.invoke().field(self).dispatch_async(stream);
        if !was_acquired {
            self.release(stream)?;
        }
        result
    }
    pub fn destroy(self) {
        log::debug!("destroying {:?}", self);
    }
}

impl Drop for GridField {
    fn drop(&mut self) {
        if let Some(surface) = &self.surface {
            if self.is_acquired() {
                log::warn!(
                    "surface {} still acquired when its field was dropped",
                    surface.native_handle()
                );
                if let Err(e) = surface.hand_over(SurfaceOwner::Graphics) {
                    log::error!("{}", e);
                }
            }
        }
    }
}

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{device::Device, FluidError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba32F,
    Rg32F,
    R32F,
    Rgba8,
}

impl TextureFormat {
    pub fn components(self) -> usize {
        match self {
            TextureFormat::Rgba32F | TextureFormat::Rgba8 => 4,
            TextureFormat::Rg32F => 2,
            TextureFormat::R32F => 1,
        }
    }
    pub fn is_float(self) -> bool {
        !matches!(self, TextureFormat::Rgba8)
    }
    /// Storage format for an owned field with `channels` components.
    pub(crate) fn for_channels(channels: u32) -> Self {
        if channels > 1 {
            TextureFormat::Rg32F
        } else {
            TextureFormat::R32F
        }
    }
    pub(crate) fn texel_bytes(self) -> u32 {
        match self {
            TextureFormat::Rgba32F => 16,
            TextureFormat::Rg32F => 8,
            TextureFormat::R32F | TextureFormat::Rgba8 => 4,
        }
    }
    pub(crate) fn wgpu(self) -> wgpu::TextureFormat {
        match self {
            TextureFormat::Rgba32F => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Rg32F => wgpu::TextureFormat::Rg32Float,
            TextureFormat::R32F => wgpu::TextureFormat::R32Float,
            TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
    /// The name WGSL uses for this format in `texture_storage_2d`.
    pub(crate) fn wgsl(self) -> &'static str {
        match self {
            TextureFormat::Rgba32F => "rgba32float",
            TextureFormat::Rg32F => "rg32float",
            TextureFormat::R32F => "r32float",
            TextureFormat::Rgba8 => "rgba8unorm",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceOwner {
    Graphics,
    Compute,
}

struct SurfaceInner {
    handle: u32,
    width: u32,
    height: u32,
    format: TextureFormat,
    device: Device,
    texture: Arc<wgpu::Texture>,
    owner: Mutex<SurfaceOwner>,
}

/// A 2D texture owned by the rendering layer. Compute may write it in place
/// through a shared [`GridField`](crate::GridField), but only between an
/// acquire and the matching release.
#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.inner.handle)
            .field("size", &(self.inner.width, self.inner.height))
            .field("format", &self.inner.format)
            .field("owner", &self.owner())
            .finish()
    }
}

impl Surface {
    /// Allocates the texture on `device`. Its contents start zeroed.
    pub fn new(device: &Device, width: u32, height: u32, format: TextureFormat) -> Result<Self> {
        static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);
        if width == 0 || height == 0 {
            return Err(FluidError::InvalidConfig(format!(
                "surface must be at least 1x1, got {}x{}",
                width, height
            )));
        }
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        let texture = device.create_texture(&format!("surface:{}", handle), width, height, format)?;
        Ok(Self {
            inner: Arc::new(SurfaceInner {
                handle,
                width,
                height,
                format,
                device: device.clone(),
                texture: Arc::new(texture),
                owner: Mutex::new(SurfaceOwner::Graphics),
            }),
        })
    }
    pub fn native_handle(&self) -> u32 {
        self.inner.handle
    }
    pub fn width(&self) -> u32 {
        self.inner.width
    }
    pub fn height(&self) -> u32 {
        self.inner.height
    }
    pub fn format(&self) -> TextureFormat {
        self.inner.format
    }
    pub fn owner(&self) -> SurfaceOwner {
        *self.inner.owner.lock()
    }
    /// The rendering layer's read path: all texels, `components()` floats each.
    pub fn read_texels(&self) -> Result<Vec<f32>> {
        self.check_graphics_owned("read")?;
        let inner = &self.inner;
        inner
            .device
            .read_texture(&inner.texture, inner.format, inner.width, inner.height)
    }
    pub fn write_texels(&self, texels: &[f32]) -> Result<()> {
        self.check_graphics_owned("write")?;
        let inner = &self.inner;
        let expected = inner.width as usize * inner.height as usize * inner.format.components();
        if texels.len() != expected {
            return Err(FluidError::InvalidConfig(format!(
                "surface {} holds {} floats, got {}",
                inner.handle,
                expected,
                texels.len()
            )));
        }
        inner
            .device
            .write_texture(&inner.texture, inner.format, inner.width, inner.height, texels)
    }
    fn check_graphics_owned(&self, what: &str) -> Result<()> {
        match self.owner() {
            SurfaceOwner::Graphics => Ok(()),
            SurfaceOwner::Compute => Err(FluidError::ProtocolViolation(format!(
                "graphics {} of surface {} while it is acquired by compute",
                what, self.inner.handle
            ))),
        }
    }
    pub(crate) fn device(&self) -> &Device {
        &self.inner.device
    }
    pub(crate) fn texture(&self) -> &Arc<wgpu::Texture> {
        &self.inner.texture
    }
    pub(crate) fn hand_over(&self, to: SurfaceOwner) -> Result<()> {
        let mut owner = self.inner.owner.lock();
        if *owner == to {
            return Err(FluidError::ProtocolViolation(format!(
                "surface {} is already owned by {:?}",
                self.inner.handle, to
            )));
        }
        *owner = to;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_device;

    #[test]
    fn graphics_access_is_blocked_while_compute_owns_the_surface() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let surface = Surface::new(&device, 4, 2, TextureFormat::Rgba32F).unwrap();
        assert_eq!(surface.read_texels().unwrap(), vec![0.0; 32]);
        surface.hand_over(SurfaceOwner::Compute).unwrap();
        assert!(matches!(
            surface.read_texels(),
            Err(FluidError::ProtocolViolation(_))
        ));
        assert!(surface.hand_over(SurfaceOwner::Compute).is_err());
        surface.hand_over(SurfaceOwner::Graphics).unwrap();
        let texels: Vec<f32> = (0..32).map(|i| i as f32 * 0.5).collect();
        surface.write_texels(&texels).unwrap();
        assert_eq!(surface.read_texels().unwrap(), texels);
        assert!(surface.write_texels(&[0.0; 8]).is_err());
    }

    #[test]
    fn rgba8_texels_read_back_normalized() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let surface = Surface::new(&device, 3, 1, TextureFormat::Rgba8).unwrap();
        let texels = [0.0, 1.0, 0.2, 1.0, 0.5, 0.5, 0.5, 0.5, 1.0, 0.0, 0.0, 0.0];
        surface.write_texels(&texels).unwrap();
        let back = surface.read_texels().unwrap();
        for (a, b) in back.iter().zip(texels) {
            assert!((a - b).abs() < 1.0 / 255.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn handles_are_unique() {
        let Some(device) = test_device(Default::default()) else {
            return;
        };
        let a = Surface::new(&device, 1, 1, TextureFormat::R32F).unwrap();
        let b = Surface::new(&device, 1, 1, TextureFormat::R32F).unwrap();
        assert_ne!(a.native_handle(), b.native_handle());
        assert!(matches!(
            Surface::new(&device, 0, 1, TextureFormat::R32F),
            Err(FluidError::InvalidConfig(_))
        ));
    }
}

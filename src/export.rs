use std::path::Path;

use crate::{device::Stream, grid::GridField, Result};

/// Writes |v| of every cell as a greyscale EXR.
pub fn dump_velocity_magnitude_exr(
    field: &GridField,
    stream: &Stream,
    path: impl AsRef<Path>,
) -> Result<()> {
    use exr::prelude::*;
    let values = field.copy_to_vec(stream)?;
    let channels = field.channels() as usize;
    let width = field.width() as usize;
    write_rgb_file(path, width, field.height() as usize, |x, y| {
        let i = (y * width + x) * channels;
        let mag = values[i..i + channels]
            .iter()
            .map(|c| c * c)
            .sum::<f32>()
            .sqrt();
        (mag, mag, mag)
    })?;
    Ok(())
}

/// Writes the field as an 8-bit PNG, mapping each component from
/// `[-scale, scale]` to red (x) and green (y).
pub fn dump_field_png(
    field: &GridField,
    stream: &Stream,
    path: impl AsRef<Path>,
    scale: f32,
) -> Result<()> {
    let values = field.copy_to_vec(stream)?;
    let channels = field.channels() as usize;
    let width = field.width();
    let to_byte = |v: f32| ((v / scale * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8;
    let img = image::RgbImage::from_fn(width, field.height(), |x, y| {
        let i = (y * width + x) as usize * channels;
        let r = to_byte(values[i]);
        let g = if channels > 1 { to_byte(values[i + 1]) } else { r };
        image::Rgb([r, g, if channels > 1 { 0 } else { r }])
    });
    img.save(path)?;
    Ok(())
}

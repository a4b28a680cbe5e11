//! Elevation payload decoding.
//!
//! Providers hand back either a texture or a plain sample grid. The layer's
//! [`ElevationEncoding`] says how to turn that payload into heights; a
//! payload that does not match the encoding is a configuration error.

use foundation::pitch::Pitch;
use gpu::textures::TexelData;
use serde::{Deserialize, Serialize};
use streaming::command::CommandResult;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElevationEncoding {
    /// Heights as a numeric sample grid.
    RawNumeric,
    /// Mapbox Terrain-RGB: `-10000 + (R * 65536 + G * 256 + B) * 0.1`.
    TerrainRgb,
    /// 8-bit heightfield: `offset + v / 255 * scale`. RGBA input uses the
    /// red channel.
    Normalized8 { offset: f32, scale: f32 },
    /// 32-bit float texture.
    Float32,
}

impl ElevationEncoding {
    fn name(&self) -> &'static str {
        match self {
            ElevationEncoding::RawNumeric => "raw numeric",
            ElevationEncoding::TerrainRgb => "terrain-rgb",
            ElevationEncoding::Normalized8 { .. } => "normalized 8-bit",
            ElevationEncoding::Float32 => "float32",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnsupportedFormat {
        encoding: &'static str,
        payload: &'static str,
    },
    SizeMismatch {
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnsupportedFormat { encoding, payload } => {
                write!(f, "cannot decode {payload} payload as {encoding} elevation")
            }
            DecodeError::SizeMismatch { expected, actual } => {
                write!(f, "expected {expected} samples, got {actual}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decoded heights, row-major from the north-west corner.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl ElevationGrid {
    /// Min and max over the part of the grid covered by `pitch`, ignoring
    /// `no_data` and NaN samples. `None` if nothing valid is left.
    pub fn min_max(&self, pitch: Pitch, no_data: Option<f32>) -> Option<(f32, f32)> {
        let (x0, x1) = window(pitch.offset_x, pitch.scale_x, self.width);
        let (y0, y1) = window(pitch.offset_y, pitch.scale_y, self.height);
        let mut range: Option<(f32, f32)> = None;
        for y in y0..y1 {
            let row = y as usize * self.width as usize;
            for x in x0..x1 {
                let Some(&v) = self.values.get(row + x as usize) else {
                    continue;
                };
                if v.is_nan() || no_data == Some(v) {
                    continue;
                }
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(v), hi.max(v)),
                    None => (v, v),
                });
            }
        }
        range
    }
}

fn window(offset: f64, scale: f64, size: u32) -> (u32, u32) {
    let size_f = size as f64;
    let start = (offset * size_f).floor().clamp(0.0, size_f) as u32;
    let end = ((offset + scale) * size_f).ceil().clamp(0.0, size_f) as u32;
    (start, end.max(start))
}

pub fn terrain_rgb(r: u8, g: u8, b: u8) -> f32 {
    let packed = r as f64 * 65536.0 + g as f64 * 256.0 + b as f64;
    (-10000.0 + packed * 0.1) as f32
}

pub fn normalized8(v: u8, offset: f32, scale: f32) -> f32 {
    offset + v as f32 / 255.0 * scale
}

/// Turns a command result into heights.
///
/// Textures whose texels never reached the CPU (`TexelData::Unavailable`)
/// decode to `None`: they are drawable but yield no statistics.
pub fn decode(encoding: &ElevationEncoding, result: &CommandResult) -> Result<Option<ElevationGrid>, DecodeError> {
    let (width, height, values) = match (encoding, result) {
        (ElevationEncoding::RawNumeric, CommandResult::Samples { grid, .. }) => {
            (grid.width, grid.height, grid.values.clone())
        }
        (_, CommandResult::Texture(tp)) => {
            let t = &tp.texture;
            let values = match (encoding, &t.data) {
                (_, TexelData::Unavailable) => return Ok(None),
                (ElevationEncoding::TerrainRgb, TexelData::Rgba8(bytes)) => {
                    check_len(bytes.len(), t.texel_count() * 4)?;
                    bytes
                        .chunks_exact(4)
                        .map(|px| terrain_rgb(px[0], px[1], px[2]))
                        .collect()
                }
                (ElevationEncoding::Normalized8 { offset, scale }, TexelData::R8(bytes)) => {
                    check_len(bytes.len(), t.texel_count())?;
                    bytes.iter().map(|v| normalized8(*v, *offset, *scale)).collect()
                }
                (ElevationEncoding::Normalized8 { offset, scale }, TexelData::Rgba8(bytes)) => {
                    check_len(bytes.len(), t.texel_count() * 4)?;
                    bytes
                        .chunks_exact(4)
                        .map(|px| normalized8(px[0], *offset, *scale))
                        .collect()
                }
                (ElevationEncoding::Float32, TexelData::F32(values)) => {
                    check_len(values.len(), t.texel_count())?;
                    values.clone()
                }
                (encoding, data) => {
                    return Err(DecodeError::UnsupportedFormat {
                        encoding: encoding.name(),
                        payload: data.kind(),
                    });
                }
            };
            (t.width, t.height, values)
        }
        (encoding, CommandResult::Samples { .. }) => {
            return Err(DecodeError::UnsupportedFormat {
                encoding: encoding.name(),
                payload: "sample grid",
            });
        }
    };
    check_len(values.len(), width as usize * height as usize)?;
    Ok(Some(ElevationGrid { width, height, values }))
}

fn check_len(actual: usize, expected: usize) -> Result<(), DecodeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DecodeError::SizeMismatch { expected, actual })
    }
}

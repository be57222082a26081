use log::trace;
use portalview_files::source::DataSource;
use portalview_files::surface::types::{Palette, PixelFormat, RenderSurface, Surface, SurfaceFlags};

use crate::rendering::common::errors::PrepareError;
use crate::rendering::common::types::{TextureData, TextureFormat, TextureGroup, TextureKey};

/// Solid colour surfaces are synthesized at this extent, so that all of them share one atlas group.
pub const SOLID_TEXTURE_SIZE: u32 = 32;

pub struct TextureImporter {}

impl TextureImporter {
    /// Resolves a surface record down to its pixels. Every record on the way is required.
    pub fn import_surface(
        source: &dyn DataSource,
        surface_id: u32,
    ) -> Result<(TextureKey, TextureData), PrepareError> {
        let surface = source
            .surface(surface_id)
            .ok_or_else(|| PrepareError::missing("surface", surface_id))?;

        if surface.is_solid() {
            return Ok(Self::solid_color(surface_id, &surface));
        }

        let texture_id = surface.texture_id.ok_or_else(|| PrepareError::InvalidSurface {
            surface_id,
            reason: "neither solid nor textured".to_string(),
        })?;
        let texture = source
            .surface_texture(texture_id)
            .ok_or_else(|| PrepareError::missing("surface texture", texture_id))?;
        // highest resolution first
        let render_surface_id = *texture
            .render_surfaces
            .first()
            .ok_or_else(|| PrepareError::missing("render surface", texture_id))?;
        let render_surface = source
            .render_surface(render_surface_id)
            .ok_or_else(|| PrepareError::missing("render surface", render_surface_id))?;

        let format = render_surface
            .pixel_format()
            .map_err(|source| PrepareError::UnsupportedFormat { surface_id, source })?;

        let (palette_id, palette) = match surface.palette_id.or(render_surface.default_palette_id) {
            Some(palette_id) if format.is_paletted() => {
                let palette = source
                    .palette(palette_id)
                    .ok_or_else(|| PrepareError::missing("palette", palette_id))?;
                (palette_id, Some(palette))
            }
            None if format.is_paletted() => {
                return Err(PrepareError::InvalidSurface {
                    surface_id,
                    reason: format!("{format:?} without a palette"),
                });
            }
            _ => (0, None),
        };

        let clipmap = surface.flags.contains(SurfaceFlags::BASE1_CLIPMAP);
        let data = Self::decode(&render_surface, format, palette.as_deref(), clipmap).map_err(|reason| {
            PrepareError::InvalidSurface { surface_id, reason }
        })?;

        trace!(
            "Imported surface {surface_id:#010X} ({}x{} {format:?})",
            render_surface.width, render_surface.height
        );

        let key = TextureKey {
            surface_id,
            palette_id,
            variant: surface.flags,
            is_solid: false,
        };
        Ok((key, data))
    }

    pub fn solid_color(surface_id: u32, surface: &Surface) -> (TextureKey, TextureData) {
        let mut rgba = argb_to_rgba(surface.color);
        rgba[3] = if surface.flags.contains(SurfaceFlags::TRANSLUCENT) {
            ((1.0 - surface.translucency).clamp(0.0, 1.0) * 255.0).round() as u8
        } else {
            0xFF
        };

        let group = TextureGroup {
            width: SOLID_TEXTURE_SIZE,
            height: SOLID_TEXTURE_SIZE,
            format: TextureFormat::Rgba8,
        };
        let pixels = rgba.repeat((SOLID_TEXTURE_SIZE * SOLID_TEXTURE_SIZE) as usize);

        let key = TextureKey {
            surface_id,
            palette_id: 0,
            variant: surface.flags,
            is_solid: true,
        };
        (key, TextureData { group, pixels })
    }

    /// Converts the raw surface data into [`TextureFormat::Rgba8`], or passes block compressed
    /// data through. The error is a human readable reason.
    pub fn decode(
        surface: &RenderSurface,
        format: PixelFormat,
        palette: Option<&Palette>,
        clipmap: bool,
    ) -> Result<TextureData, String> {
        let texels = (surface.width as usize)
            .checked_mul(surface.height as usize)
            .ok_or(OVERSIZED)?;
        let (group_format, pixels) = match format {
            PixelFormat::Dxt1 | PixelFormat::Dxt3 | PixelFormat::Dxt5 => {
                let texture_format = match format {
                    PixelFormat::Dxt1 => TextureFormat::Bc1,
                    PixelFormat::Dxt3 => TextureFormat::Bc2,
                    _ => TextureFormat::Bc3,
                };
                // mip levels may trail the base level, we only keep the base level
                let size = texture_format
                    .layer_size(surface.width, surface.height)
                    .ok_or(OVERSIZED)?;
                let data = surface.data.get(..size).ok_or_else(|| short_data(size, surface))?;
                (texture_format, data.to_vec())
            }
            PixelFormat::P8 => {
                let palette = palette.ok_or("missing palette")?;
                let data = pixel_data(surface, texels, 1)?;
                let mut pixels = Vec::with_capacity(texels * 4);
                for &index in data {
                    pixels.extend_from_slice(&palette_lookup(palette, index as usize, clipmap)?);
                }
                (TextureFormat::Rgba8, pixels)
            }
            PixelFormat::Index16 => {
                let palette = palette.ok_or("missing palette")?;
                let pixels = map_u16(surface, texels, |index| palette_lookup(palette, index as usize, clipmap))?;
                (TextureFormat::Rgba8, pixels)
            }
            PixelFormat::R5G6B5 => {
                let pixels = map_u16(surface, texels, |v| {
                    Ok([
                        expand_bits((v >> 11) & 0x1F, 5),
                        expand_bits((v >> 5) & 0x3F, 6),
                        expand_bits(v & 0x1F, 5),
                        0xFF,
                    ])
                })?;
                (TextureFormat::Rgba8, pixels)
            }
            PixelFormat::A4R4G4B4 => {
                let pixels = map_u16(surface, texels, |v| {
                    Ok([
                        expand_bits((v >> 8) & 0xF, 4),
                        expand_bits((v >> 4) & 0xF, 4),
                        expand_bits(v & 0xF, 4),
                        expand_bits((v >> 12) & 0xF, 4),
                    ])
                })?;
                (TextureFormat::Rgba8, pixels)
            }
            PixelFormat::R8G8B8 => {
                let data = pixel_data(surface, texels, 3)?;
                let pixels = data
                    .chunks_exact(3)
                    .flat_map(|bgr| [bgr[2], bgr[1], bgr[0], 0xFF])
                    .collect();
                (TextureFormat::Rgba8, pixels)
            }
            PixelFormat::A8R8G8B8 => {
                let data = pixel_data(surface, texels, 4)?;
                let pixels = data
                    .chunks_exact(4)
                    .flat_map(|bgra| [bgra[2], bgra[1], bgra[0], bgra[3]])
                    .collect();
                (TextureFormat::Rgba8, pixels)
            }
        };

        Ok(TextureData {
            group: TextureGroup {
                width: surface.width,
                height: surface.height,
                format: group_format,
            },
            pixels,
        })
    }
}

const OVERSIZED: &str = "surface extent does not fit into memory";

fn pixel_data(surface: &RenderSurface, texels: usize, bytes_per_texel: usize) -> Result<&[u8], String> {
    let size = texels.checked_mul(bytes_per_texel).ok_or(OVERSIZED)?;
    surface.data.get(..size).ok_or_else(|| short_data(size, surface))
}

fn short_data(expected: usize, surface: &RenderSurface) -> String {
    format!("expected {expected} bytes of pixel data, got {}", surface.data.len())
}

fn map_u16<F>(surface: &RenderSurface, texels: usize, mut convert: F) -> Result<Vec<u8>, String>
where
    F: FnMut(u16) -> Result<[u8; 4], String>,
{
    let data = pixel_data(surface, texels, 2)?;
    let mut pixels = Vec::with_capacity(texels * 4);
    for chunk in data.chunks_exact(2) {
        pixels.extend_from_slice(&convert(u16::from_le_bytes([chunk[0], chunk[1]]))?);
    }
    Ok(pixels)
}

fn palette_lookup(palette: &Palette, index: usize, clipmap: bool) -> Result<[u8; 4], String> {
    if clipmap && index == 0 {
        return Ok([0, 0, 0, 0]);
    }
    palette
        .colors
        .get(index)
        .map(|&argb| argb_to_rgba(argb))
        .ok_or_else(|| format!("palette index {index} out of {} colors", palette.colors.len()))
}

/// Scales an n-bit channel to 8 bits by bit replication, so that the maximum maps to 0xFF.
fn expand_bits(value: u16, bits: u32) -> u8 {
    let value = value as u32;
    let expanded = (value << (8 - bits)) | (value >> (2 * bits).saturating_sub(8));
    expanded as u8
}

pub fn argb_to_rgba(argb: u32) -> [u8; 4] {
    [
        ((argb >> 16) & 0xFF) as u8,
        ((argb >> 8) & 0xFF) as u8,
        (argb & 0xFF) as u8,
        ((argb >> 24) & 0xFF) as u8,
    ]
}

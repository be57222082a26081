use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::RecordError;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct SurfaceFlags: u32 {
        const BASE1_SOLID = 0x0001;
        const BASE1_IMAGE = 0x0002;
        /// Palette index 0 is treated as fully transparent.
        const BASE1_CLIPMAP = 0x0004;
        const TRANSLUCENT = 0x0010;
        const DIFFUSE = 0x0020;
        const LUMINOUS = 0x0040;
        const ALPHA = 0x0100;
        const INVERTED_ALPHA = 0x0200;
        const ADDITIVE = 0x10000;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Surface {
    pub flags: SurfaceFlags,
    /// ARGB, only meaningful for [`SurfaceFlags::BASE1_SOLID`]
    pub color: u32,
    pub translucency: f32,
    /// The [`SurfaceTexture`] record, for image surfaces.
    pub texture_id: Option<u32>,
    /// Overrides [`RenderSurface::default_palette_id`].
    pub palette_id: Option<u32>,
}

impl Surface {
    pub fn is_solid(&self) -> bool {
        self.flags.contains(SurfaceFlags::BASE1_SOLID)
    }
}

/// A texture with all of its resolutions. The first entry is the highest resolution.
#[derive(Debug, Clone, Default)]
pub struct SurfaceTexture {
    pub render_surfaces: Vec<u32>,
}

#[repr(u32)]
#[derive(TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8G8B8 = 20,
    A8R8G8B8 = 21,
    R5G6B5 = 23,
    A4R4G4B4 = 26,
    P8 = 41,
    Index16 = 101,
    Dxt1 = 0x3154_5844,
    Dxt3 = 0x3354_5844,
    Dxt5 = 0x3554_5844,
}

impl PixelFormat {
    pub fn is_paletted(self) -> bool {
        matches!(self, PixelFormat::P8 | PixelFormat::Index16)
    }

    pub fn is_block_compressed(self) -> bool {
        matches!(self, PixelFormat::Dxt1 | PixelFormat::Dxt3 | PixelFormat::Dxt5)
    }
}

#[derive(Clone, Default)]
pub struct RenderSurface {
    pub width: u32,
    pub height: u32,
    /// Raw format value as stored in the archive, see [`RenderSurface::pixel_format`].
    pub format: u32,
    pub data: Vec<u8>,
    pub default_palette_id: Option<u32>,
}

impl RenderSurface {
    pub fn pixel_format(&self) -> Result<PixelFormat, RecordError> {
        PixelFormat::try_from(self.format).map_err(|err| RecordError::UnsupportedPixelFormat { raw: err.number })
    }
}

impl Debug for RenderSurface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ {}x{}, format: {:#x}, ", self.width, self.height, self.format)?;
        write!(f, "data: [{}], default_palette_id: {:?} }}", self.data.len(), self.default_palette_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Palette {
    /// ARGB
    pub colors: Vec<u32>,
}

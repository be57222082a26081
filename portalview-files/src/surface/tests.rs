use crate::RecordError;
use crate::surface::types::{PixelFormat, RenderSurface};

#[test]
fn known_pixel_formats_resolve() -> Result<(), anyhow::Error> {
    let mut surface = RenderSurface {
        width: 1,
        height: 1,
        format: 41,
        ..RenderSurface::default()
    };
    assert_eq!(surface.pixel_format()?, PixelFormat::P8);

    surface.format = u32::from_le_bytes(*b"DXT5");
    assert_eq!(surface.pixel_format()?, PixelFormat::Dxt5);
    assert!(PixelFormat::Dxt5.is_block_compressed());
    Ok(())
}

#[test]
fn unknown_pixel_format_is_reported() {
    let surface = RenderSurface {
        format: 500,
        ..RenderSurface::default()
    };
    assert!(matches!(
        surface.pixel_format(),
        Err(RecordError::UnsupportedPixelFormat { raw: 500 })
    ));
}

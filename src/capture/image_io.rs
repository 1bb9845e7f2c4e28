//! Frame to image conversion and JPEG output
//!
//! Stills are written at full viewfinder resolution. The preview is downscaled to a bounded
//! width and replaced atomically so readers never see a half-written file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use tracing::debug;

use super::{CompletedFrame, PixelFormat};
use crate::error::{Error, Result};

/// Decode a frame buffer into an RGB image
pub fn frame_to_rgb(frame: &CompletedFrame) -> Result<RgbImage> {
    let info = frame.info;
    match info.pixel_format {
        PixelFormat::Mjpeg => {
            let img = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?;
            Ok(img.to_rgb8())
        }
        PixelFormat::Rgb24 => {
            let row = info.width as usize * 3;
            let stride = checked_stride(frame, row)?;

            let mut pixels = Vec::with_capacity(row * info.height as usize);
            for y in 0..info.height as usize {
                pixels.extend_from_slice(&frame.data[y * stride..y * stride + row]);
            }
            RgbImage::from_raw(info.width, info.height, pixels)
                .ok_or_else(|| Error::BadFrame("RGB buffer does not match its geometry".to_string()))
        }
        PixelFormat::Yuyv => {
            let row = info.width as usize * 2;
            let stride = checked_stride(frame, row)?;

            let mut img = RgbImage::new(info.width, info.height);
            for y in 0..info.height {
                let line = &frame.data[y as usize * stride..y as usize * stride + row];
                for (pair, px) in line.chunks_exact(4).enumerate() {
                    let x = pair as u32 * 2;
                    img.put_pixel(x, y, image::Rgb(yuv_to_rgb(px[0], px[1], px[3])));
                    if x + 1 < info.width {
                        img.put_pixel(x + 1, y, image::Rgb(yuv_to_rgb(px[2], px[1], px[3])));
                    }
                }
            }
            Ok(img)
        }
    }
}

/// Row stride of a packed frame, after checking the buffer covers every row.
fn checked_stride(frame: &CompletedFrame, row: usize) -> Result<usize> {
    let stride = (frame.info.stride as usize).max(row);
    let rows = frame.info.height as usize;
    if row == 0 || rows == 0 || frame.data.len() < stride * (rows - 1) + row {
        return Err(Error::BadFrame(format!(
            "buffer of {} bytes is too small for {}x{} {:?}",
            frame.data.len(),
            frame.info.width,
            frame.info.height,
            frame.info.pixel_format
        )));
    }
    Ok(stride)
}

/// BT.601 limited-range conversion
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Calculate preview dimensions with aspect-preserving downscale
///
/// The width is bounded by `max_width`; the height keeps the source aspect ratio and is
/// rounded down to a multiple of 16 (never below 16).
pub fn preview_dimensions(src_width: u32, src_height: u32, max_width: u32) -> (u32, u32) {
    let width = if max_width == 0 {
        src_width
    } else {
        max_width.min(src_width)
    };
    let height = (width as u64 * src_height as u64 / src_width.max(1) as u64) as u32;
    (width, (height / 16 * 16).max(16))
}

/// Encode an image as JPEG at `path`, creating parent directories as needed
pub fn save_jpeg(img: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(img)?;
    out.flush()?;
    Ok(())
}

/// Save a full-resolution still image
pub fn save_still(frame: &CompletedFrame, path: &Path, quality: u8) -> Result<()> {
    let img = frame_to_rgb(frame)?;
    save_jpeg(&img, path, quality)?;
    debug!("Still saved to {:?} ({}x{})", path, img.width(), img.height());
    Ok(())
}

/// Overwrite the preview image with a downscaled copy of the frame
pub fn save_preview(frame: &CompletedFrame, path: &Path, max_width: u32, quality: u8) -> Result<()> {
    let img = frame_to_rgb(frame)?;
    let (width, height) = preview_dimensions(img.width(), img.height(), max_width);
    let scaled = if (width, height) == img.dimensions() {
        img
    } else {
        imageops::resize(&img, width, height, FilterType::Triangle)
    };

    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = Path::new(&partial);
    save_jpeg(&scaled, partial, quality)?;
    std::fs::rename(partial, path)?;
    Ok(())
}

//! Raw V4L2 buffer conversion to packed RGB8.
//!
//! All converters take the driver's line stride, which may exceed the
//! visible width, and drop the padding.

use image::ImageFormat;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("stride {stride} is narrower than a {width}px line")]
    InvalidStride { stride: usize, width: u32 },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded MJPEG is {actual_w}x{actual_h}, expected {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

fn check_buffer(
    buf: &[u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    stride: usize,
) -> Result<(), FrameError> {
    let line = width as usize * bytes_per_pixel;
    if stride < line {
        return Err(FrameError::InvalidStride { stride, width });
    }
    let expected = match height as usize {
        0 => 0,
        h => stride * (h - 1) + line,
    };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr to RGB, integer form.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = cb as i32 - 128;
    let e = cr as i32 - 128;
    let clamp = |v: i32| ((v + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Convert packed YUYV 4:2:2 ([Y0, U, Y1, V] per pixel pair) to RGB.
pub fn yuyv_to_rgb(
    yuyv: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, FrameError> {
    check_buffer(yuyv, width, height, 2, stride)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for row in 0..height as usize {
        let line = &yuyv[row * stride..row * stride + width as usize * 2];
        for (x, px) in line.chunks_exact(2).enumerate() {
            // Each pixel pair shares one U and one V sample.
            let pair = x & !1;
            let u = line[pair * 2 + 1];
            let v = line.get(pair * 2 + 3).copied().unwrap_or(128);
            rgb.extend_from_slice(&ycbcr_to_rgb(px[0], u, v));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB by repeating each sample.
pub fn grey_to_rgb(
    grey: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, FrameError> {
    check_buffer(grey, width, height, 1, stride)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for row in 0..height as usize {
        for &g in &grey[row * stride..row * stride + width as usize] {
            rgb.extend_from_slice(&[g, g, g]);
        }
    }
    Ok(rgb)
}

/// Copy packed RGB24 rows, dropping line padding.
pub fn rgb24_rows(
    buf: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, FrameError> {
    check_buffer(buf, width, height, 3, stride)?;
    let line = width as usize * 3;
    let mut rgb = Vec::with_capacity(line * height as usize);
    for row in 0..height as usize {
        rgb.extend_from_slice(&buf[row * stride..row * stride + line]);
    }
    Ok(rgb)
}

/// Decode one Motion-JPEG buffer.
pub fn mjpeg_to_rgb(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_rgb8();
    if decoded.dimensions() != (width, height) {
        return Err(FrameError::SizeMismatch {
            width,
            height,
            actual_w: decoded.width(),
            actual_h: decoded.height(),
        });
    }
    Ok(decoded.into_raw())
}

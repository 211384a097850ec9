//! Burn face boxes and labels into frame pixels.
//!
//! Each face gets a 2px outline and a filled band along its bottom edge
//! carrying the label, rendered with the bundled DejaVu Sans font.

use crate::types::{FaceMatch, Frame};
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::sync::OnceLock;

pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
pub const TEXT_COLOR: [u8; 3] = [255, 255, 255];

const BAND_HEIGHT: u32 = 35;
const TEXT_MARGIN: u32 = 6;
const TEXT_SCALE: f32 = 20.0;

static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Inclusive pixel bounds `(left, top, right, bottom)` inside the canvas.
type Bounds = (u32, u32, u32, u32);

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unusable; boxes drawn without text");
            None
        }
    })
    .as_ref()
}

/// Draw every held face onto `frame`.
pub fn annotate(frame: &mut Frame, faces: &[FaceMatch]) {
    if faces.is_empty() {
        return;
    }
    let (width, height) = (frame.width, frame.height);
    if frame.data.len() != width as usize * height as usize * Frame::CHANNELS {
        tracing::warn!(width, height, "frame buffer does not match its size; not annotated");
        return;
    }
    let data = std::mem::take(&mut frame.data);
    let Some(mut canvas) = RgbImage::from_raw(width, height, data) else {
        return;
    };

    for face in faces {
        if let Some(bounds) = face.region.pixel_bounds(width, height) {
            draw_face(&mut canvas, bounds, face.result.identity.display_name());
        }
    }

    frame.data = canvas.into_raw();
}

fn draw_face(canvas: &mut RgbImage, (left, top, right, bottom): Bounds, label: &str) {
    let box_color = Rgb(BOX_COLOR);
    let width = right - left + 1;
    let height = bottom - top + 1;

    draw_hollow_rect_mut(canvas, rect(left, top, width, height), box_color);
    if width > 2 && height > 2 {
        draw_hollow_rect_mut(canvas, rect(left + 1, top + 1, width - 2, height - 2), box_color);
    }

    let band_top = bottom.saturating_sub(BAND_HEIGHT).max(top);
    draw_filled_rect_mut(
        canvas,
        rect(left, band_top, width, bottom - band_top + 1),
        box_color,
    );

    if let Some(font) = label_font() {
        let text_top = bottom
            .saturating_sub(TEXT_MARGIN + TEXT_SCALE as u32)
            .max(band_top);
        draw_text_mut(
            canvas,
            Rgb(TEXT_COLOR),
            (left + TEXT_MARGIN) as i32,
            text_top as i32,
            PxScale::from(TEXT_SCALE),
            font,
            label,
        );
    }
}

fn rect(x: u32, y: u32, width: u32, height: u32) -> Rect {
    Rect::at(x as i32, y as i32).of_size(width.max(1), height.max(1))
}

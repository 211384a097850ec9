use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// A box without landmarks, mostly useful for fakes and tests.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Integer pixel bounds `(left, top, right, bottom)` clamped to a frame.
    ///
    /// Returns `None` when the box lies entirely outside the frame.
    pub fn pixel_bounds(
        &self,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        if frame_width == 0 || frame_height == 0 {
            return None;
        }
        let max_x = (frame_width - 1) as f32;
        let max_y = (frame_height - 1) as f32;
        let right = self.x + self.width;
        let bottom = self.y + self.height;
        if right < 0.0 || bottom < 0.0 || self.x > max_x || self.y > max_y {
            return None;
        }
        Some((
            self.x.clamp(0.0, max_x).round() as u32,
            self.y.clamp(0.0, max_y).round() as u32,
            right.clamp(0.0, max_x).round() as u32,
            bottom.clamp(0.0, max_y).round() as u32,
        ))
    }
}

/// Face signature vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two signatures.
    ///
    /// Signatures of different length compare as infinitely far apart.
    pub fn euclidean_distance(&self, other: &Signature) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A captured color frame, packed RGB8 (width * height * 3 bytes).
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    /// Wrap packed RGB bytes, checking the buffer length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        if data.len() != width as usize * height as usize * Self::CHANNELS {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    /// A frame filled with one color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * Self::CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
            sequence: 0,
        }
    }

    pub fn from_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            sequence: 0,
        }
    }

    /// Copy into an `image::RgbImage` for encoding or resizing.
    pub fn to_image(&self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// RGB value at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Set the pixel at (x, y); writes outside the frame are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        self.data[idx..idx + Self::CHANNELS].copy_from_slice(&rgb);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// One face found in a frame: where it is and what it looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub region: BoundingBox,
    pub signature: Signature,
}

/// Outcome of classifying a signature against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub const UNKNOWN_LABEL: &'static str = "Unknown";

    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Known(label) => Some(label),
            Identity::Unknown => None,
        }
    }

    /// Text burned into the annotated frame.
    pub fn display_name(&self) -> &str {
        self.label().unwrap_or(Self::UNKNOWN_LABEL)
    }
}

/// Result of matching a query signature against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the nearest registry entry; `None` for an empty registry.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity: Identity::Unknown,
            distance: None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self.identity, Identity::Known(_))
    }
}

/// A detection paired with its match, held between ticks for annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub region: BoundingBox,
    pub result: MatchResult,
}

//! Face alignment to the canonical ArcFace crop.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted
//! from the five detected landmarks to the InsightFace reference points,
//! then the RGB frame is resampled into a 112x112 crop.

use crate::types::Frame;

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Row-major `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Closed form: after centering both point sets, the rotation/scale pair
/// (a, b) is the normalized dot and cross correlation of the two sets.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - msx, s.1 - msy);
        let (dx, dy) = (d.0 - mdx, d.1 - mdy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    if norm <= f32::EPSILON {
        // Degenerate landmarks: translate only.
        return [1.0, 0.0, mdx - msx, 0.0, 1.0, mdy - msy];
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);
    [a, -b, tx, b, a, ty]
}

/// Resample `frame` through the inverse of `m` into an `out_size` square RGB crop.
///
/// Bilinear interpolation; samples outside the frame are black.
fn warp_rgb(frame: &Frame, m: &Similarity, out_size: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_size * out_size * Frame::CHANNELS];

    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return out;
    }

    let (w, h) = (frame.width as i64, frame.height as i64);
    let texel = |x: i64, y: i64, c: usize| -> f32 {
        if x < 0 || y < 0 || x >= w || y >= h {
            return 0.0;
        }
        frame.data[(y * w + x) as usize * Frame::CHANNELS + c] as f32
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = (a * dx + b * dy) / det;
            let sy = (a * dy - b * dx) / det;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let base = (oy * out_size + ox) * Frame::CHANNELS;
            for c in 0..Frame::CHANNELS {
                let top = texel(x0, y0, c) * (1.0 - fx) + texel(x0 + 1, y0, c) * fx;
                let bottom = texel(x0, y0 + 1, c) * (1.0 - fx) + texel(x0 + 1, y0 + 1, c) * fx;
                out[base + c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Align a detected face to a 112x112 packed RGB crop for ArcFace.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let m = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112);
    warp_rgb(frame, &m, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &Similarity, p: (f32, f32)) -> (f32, f32) {
        (m[0] * p.0 + m[1] * p.1 + m[2], m[3] * p.0 + m[4] * p.1 + m[5])
    }

    #[test]
    fn test_identity_transform() {
        let m = estimate_similarity(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-3, "m = {m:?}");
        }
    }

    #[test]
    fn test_scaled_and_shifted_transform() {
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| {
                let (x, y) = REFERENCE_LANDMARKS_112[i];
                (x * 2.0 + 30.0, y * 2.0 + 10.0)
            });
        let m = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
        let (x, y) = apply(&m, src[2]);
        assert!((x - REFERENCE_LANDMARKS_112[2].0).abs() < 1e-2);
        assert!((y - REFERENCE_LANDMARKS_112[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_rotated_transform() {
        // Rotate the reference points 90 degrees about the origin.
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| {
                let (x, y) = REFERENCE_LANDMARKS_112[i];
                (-y, x)
            });
        let m = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        for i in 0..5 {
            let (x, y) = apply(&m, src[i]);
            assert!((x - REFERENCE_LANDMARKS_112[i].0).abs() < 1e-2);
            assert!((y - REFERENCE_LANDMARKS_112[i].1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_degenerate_landmarks_translate_only() {
        let src = [(10.0, 10.0); 5];
        let m = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(m[0], 1.0);
        assert_eq!(m[3], 0.0);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = Frame::filled(640, 480, [128, 64, 32]);
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * 3);
        // Interior of a uniform frame keeps its color.
        let mid = (56 * ALIGNED_SIZE + 56) * 3;
        assert_eq!(&aligned[mid..mid + 3], &[128, 64, 32]);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut frame = Frame::filled(200, 200, [0, 0, 0]);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                frame.put_pixel(78 + dx, 58 + dy, [255, 0, 0]);
            }
        }

        let aligned = align_face(&frame, &src);
        let rx = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut red = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                red = red.max(aligned[(y * ALIGNED_SIZE + x) * 3]);
            }
        }
        assert!(red > 100, "expected red patch near ({rx}, {ry}), max={red}");
    }
}

//! Landmark-based face alignment.
//!
//! Five detected landmarks are fitted to the ArcFace reference layout with a
//! least-squares similarity (uniform scale, rotation, translation) and the
//! face is resampled into a 112×112 RGB crop.

use facesort_io::Frame;

pub const ALIGNED_SIZE: usize = 112;

/// ArcFace reference layout in a 112×112 crop: eyes, nose tip, mouth corners.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `(x, y) -> (a·x - b·y + tx, b·x + a·y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit mapping `src` onto `dst`.
    ///
    /// `None` when the source points all coincide.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            spread += sx * sx + sy * sy;
        }
        if spread < 1e-9 {
            return None;
        }

        let (a, b) = (dot / spread, cross / spread);
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Small perturbation applied to the canonical landmark positions before
/// warping. `Jitter::NONE` reproduces the exact alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub dx: f32,
    pub dy: f32,
    pub scale: f32,
    /// Rotation in degrees around the crop centre.
    pub angle_deg: f32,
    pub mirror: bool,
}

impl Jitter {
    pub const NONE: Jitter = Jitter {
        dx: 0.0,
        dy: 0.0,
        scale: 1.0,
        angle_deg: 0.0,
        mirror: false,
    };

    fn apply(&self, points: &[(f32, f32); 5]) -> [(f32, f32); 5] {
        let c = ALIGNED_SIZE as f32 / 2.0;
        let (sin, cos) = self.angle_deg.to_radians().sin_cos();
        points.map(|(x, y)| {
            let (px, py) = ((x - c) * self.scale, (y - c) * self.scale);
            (c + px * cos - py * sin + self.dx, c + px * sin + py * cos + self.dy)
        })
    }
}

/// Resample `frame` into a square crop; `to_frame` maps crop pixels to frame
/// coordinates. Samples outside the frame read as black.
fn resample(frame: &Frame, to_frame: &Similarity, size: usize) -> Vec<u8> {
    let mut crop = Vec::with_capacity(size * size * Frame::CHANNELS);
    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = to_frame.apply((ox as f32, oy as f32));
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i32, y0 as i32);

            let corners = [
                (frame.pixel(x0, y0), (1.0 - fx) * (1.0 - fy)),
                (frame.pixel(x0 + 1, y0), fx * (1.0 - fy)),
                (frame.pixel(x0, y0 + 1), (1.0 - fx) * fy),
                (frame.pixel(x0 + 1, y0 + 1), fx * fy),
            ];
            for c in 0..Frame::CHANNELS {
                let value: f32 = corners.iter().map(|(px, w)| px[c] as f32 * w).sum();
                crop.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    crop
}

/// Mirror a square RGB crop left-to-right.
fn mirror(crop: &mut [u8], size: usize) {
    for row in crop.chunks_exact_mut(size * Frame::CHANNELS) {
        for x in 0..size / 2 {
            let (l, r) = (x * Frame::CHANNELS, (size - 1 - x) * Frame::CHANNELS);
            for c in 0..Frame::CHANNELS {
                row.swap(l + c, r + c);
            }
        }
    }
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Degenerate landmarks (all in one spot) yield a black crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5], jitter: &Jitter) -> Vec<u8> {
    let target = jitter.apply(&REFERENCE_LANDMARKS_112);
    let Some(to_frame) = Similarity::fit(landmarks, &target).and_then(|m| m.inverse()) else {
        tracing::debug!(?landmarks, "degenerate landmarks, emitting blank crop");
        return vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * Frame::CHANNELS];
    };
    let mut crop = resample(frame, &to_frame, ALIGNED_SIZE);
    if jitter.mirror {
        mirror(&mut crop, ALIGNED_SIZE);
    }
    crop
}

//! Decoded RGB images and the resampling the detector needs.

use std::path::Path;

/// A decoded RGB image.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Bytes per pixel of the packed RGB layout.
    pub const CHANNELS: usize = 3;

    /// Wrap packed RGB bytes, checking the buffer length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    /// Decode an image file (any format the `image` crate understands) into RGB.
    pub fn load(path: &Path) -> Result<Self, FrameError> {
        let img = image::open(path).map_err(|e| FrameError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty(path.display().to_string()));
        }
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// RGB triple at (x, y); out-of-bounds coordinates read as black.
    pub fn pixel(&self, x: i32, y: i32) -> [u8; 3] {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return [0, 0, 0];
        }
        let off = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    /// Resize with bilinear interpolation (pixel-center aligned).
    pub fn resize_bilinear(&self, new_width: u32, new_height: u32) -> Frame {
        let (w, h) = (self.width as usize, self.height as usize);
        let (new_w, new_h) = (new_width.max(1) as usize, new_height.max(1) as usize);
        let scale_x = w as f32 / new_w as f32;
        let scale_y = h as f32 / new_h as f32;

        let mut out = vec![0u8; new_w * new_h * Self::CHANNELS];
        for y in 0..new_h {
            let src_y = (y as f32 + 0.5) * scale_y - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, h as i32 - 1) as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..new_w {
                let src_x = (x as f32 + 0.5) * scale_x - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, w as i32 - 1) as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                for c in 0..Self::CHANNELS {
                    let at = |xx: usize, yy: usize| self.data[(yy * w + xx) * Self::CHANNELS + c] as f32;
                    let val = at(x0, y0) * (1.0 - fx) * (1.0 - fy)
                        + at(x1, y0) * fx * (1.0 - fy)
                        + at(x0, y1) * (1.0 - fx) * fy
                        + at(x1, y1) * fx * fy;
                    out[(y * new_w + x) * Self::CHANNELS + c] = val.round().clamp(0.0, 255.0) as u8;
                }
            }
        }

        Frame {
            data: out,
            width: new_w as u32,
            height: new_h as u32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("cannot decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("image has no pixels: {0}")]
    Empty(String),
}

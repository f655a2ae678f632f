//! Grayscale frames: YUYV conversion, dark detection and downscaling.

use chrono::{DateTime, Utc};

/// Pixels darker than this count towards a dark frame.
const DARK_LEVEL: u8 = 32;

/// One 8-bit luma image as handed to the recognition loop.
#[derive(Clone)]
pub struct Frame {
    /// Row-major luma, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time; decides the attendance day.
    pub captured_at: DateTime<Utc>,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Mean luma in 0..=255; an empty frame reads as black.
    pub fn mean_luma(&self) -> f32 {
        match self.data.len() {
            0 => 0.0,
            n => self.data.iter().map(|&p| u64::from(p)).sum::<u64>() as f32 / n as f32,
        }
    }

    /// Copy of this frame reduced by an integer factor in both axes.
    pub fn downscaled(&self, factor: u32) -> Frame {
        let (data, width, height) = downscale(&self.data, self.width, self.height, factor);
        Frame {
            data,
            width,
            height,
            captured_at: self.captured_at,
            sequence: self.sequence,
            is_dark: self.is_dark,
        }
    }
}

/// Keep the Y samples of a packed 4:2:2 buffer (`Y0 U Y1 V` per pixel pair).
pub fn luma_from_yuyv(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let packed = buf
        .get(..pixels * 2)
        .ok_or(FrameError::ShortBuffer { need: pixels * 2, got: buf.len() })?;
    Ok(packed.chunks_exact(2).map(|pair| pair[0]).collect())
}

/// Whether more than `ratio` of the pixels sit below [`DARK_LEVEL`].
/// An empty buffer counts as dark.
pub fn is_mostly_dark(gray: &[u8], ratio: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_LEVEL).count();
    dark as f32 > ratio * gray.len() as f32
}

/// Box-filter downscale by `factor`. Trailing rows/columns that do not fill a
/// whole block are dropped. A factor of 0 or 1, or an undersized buffer,
/// returns the input unchanged.
pub fn downscale(gray: &[u8], width: u32, height: u32, factor: u32) -> (Vec<u8>, u32, u32) {
    let w = width as usize;
    let h = height as usize;
    let f = factor as usize;
    if f <= 1 || gray.len() < w * h || w < f || h < f {
        return (gray.to_vec(), width, height);
    }

    let out_w = w / f;
    let out_h = h / f;
    let block = (f * f) as u32;
    let mut out = Vec::with_capacity(out_w * out_h);

    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut sum = 0u32;
            for y in oy * f..(oy + 1) * f {
                let row = &gray[y * w + ox * f..y * w + (ox + 1) * f];
                sum += row.iter().map(|&p| p as u32).sum::<u32>();
            }
            out.push(((sum + block / 2) / block) as u8);
        }
    }

    (out, out_w as u32, out_h as u32)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("short YUYV buffer: need {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luma_from_yuyv() {
        // Two pixel pairs; chroma bytes must be discarded.
        let buf = [16, 90, 235, 240, 60, 128, 61, 128];
        assert_eq!(luma_from_yuyv(&buf, 4, 1).unwrap(), vec![16, 235, 60, 61]);
        // Trailing bytes beyond the frame are ignored.
        assert_eq!(luma_from_yuyv(&buf, 2, 1).unwrap(), vec![16, 235]);
    }

    #[test]
    fn test_luma_from_short_buffer() {
        match luma_from_yuyv(&[1, 2, 3], 2, 1) {
            Err(FrameError::ShortBuffer { need, got }) => assert_eq!((need, got), (4, 3)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_mostly_dark() {
        assert!(is_mostly_dark(&[], 0.95));
        assert!(is_mostly_dark(&[5u8; 64], 0.95));
        assert!(!is_mostly_dark(&[DARK_LEVEL; 64], 0.95));

        // 97 of 100 pixels dark is over a 95% ratio, 90 is not.
        let mut gray = vec![0u8; 97];
        gray.extend([200u8; 3]);
        assert!(is_mostly_dark(&gray, 0.95));
        gray[..7].fill(200);
        assert!(!is_mostly_dark(&gray, 0.95));
    }

    #[test]
    fn test_downscale_averages_blocks() {
        // 4x2 → 2x1 with factor 2
        let gray = vec![
            0, 10, 100, 100, //
            20, 30, 200, 200,
        ];
        let (out, w, h) = downscale(&gray, 4, 2, 2);
        assert_eq!((w, h), (2, 1));
        assert_eq!(out, vec![15, 150]);
    }

    #[test]
    fn test_downscale_drops_partial_blocks() {
        let gray = vec![50u8; 5 * 3];
        let (out, w, h) = downscale(&gray, 5, 3, 2);
        assert_eq!((w, h), (2, 1));
        assert_eq!(out, vec![50, 50]);
    }

    #[test]
    fn test_downscale_identity_cases() {
        let gray = vec![1, 2, 3, 4];
        assert_eq!(downscale(&gray, 2, 2, 1), (gray.clone(), 2, 2));
        assert_eq!(downscale(&gray, 2, 2, 0), (gray.clone(), 2, 2));
        assert_eq!(downscale(&gray, 2, 2, 4), (gray, 2, 2));
    }

    #[test]
    fn test_frame_downscaled_keeps_metadata() {
        let frame = Frame {
            data: vec![200u8; 8 * 8],
            width: 8,
            height: 8,
            captured_at: Utc::now(),
            sequence: 42,
            is_dark: false,
        };
        let small = frame.downscaled(4);
        assert_eq!((small.width, small.height), (2, 2));
        assert_eq!(small.sequence, 42);
        assert_eq!(small.captured_at, frame.captured_at);
        assert!((small.mean_luma() - 200.0).abs() < 1e-3);
    }
}

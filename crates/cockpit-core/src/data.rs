/// A single 16-bit camera image.
///
/// Pixels are row-major, `width * height` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    pub pixels: Vec<u16>,
}

impl Image {
    pub fn from_u16(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Get pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    /// Smallest and largest pixel value, `None` for an empty image.
    pub fn min_max(&self) -> Option<(u16, u16)> {
        let first = *self.pixels.first()?;
        Some(
            self.pixels
                .iter()
                .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
        )
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&v| v as u64).sum();
        sum as f64 / self.pixels.len() as f64
    }
}

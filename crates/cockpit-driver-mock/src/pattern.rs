//! Test pattern generation for simulated camera frames.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Full scale of the simulated 12-bit sensor.
pub const SENSOR_MAX: u16 = 4095;

/// Generates a frame for a simulated 12-bit sensor.
///
/// The frame holds a diagonal background gradient, a Gaussian spot that
/// orbits the centre from frame to frame, and a few counts of noise. Pixel
/// `(0, 0)` carries `frame_num` so saved planes can be traced back to the
/// trigger that produced them.
pub fn generate_test_pattern(width: u32, height: u32, frame_num: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];
    if buffer.is_empty() {
        return buffer;
    }

    let span = (w + h).max(1) as f64;
    let angle = frame_num as f64 * std::f64::consts::TAU / 16.0;
    let radius = w.min(h) as f64 / 4.0;
    let spot_x = w as f64 / 2.0 + radius * angle.cos();
    let spot_y = h as f64 / 2.0 + radius * angle.sin();
    let sigma2 = (w.min(h) as f64 / 8.0).max(1.0).powi(2);

    let mut seed = frame_num.wrapping_add(1);
    for y in 0..h {
        for x in 0..w {
            seed = prng(seed);
            let background = 200.0 + 800.0 * (x + y) as f64 / span;
            let d2 = (x as f64 - spot_x).powi(2) + (y as f64 - spot_y).powi(2);
            let spot = 2500.0 * (-d2 / (2.0 * sigma2)).exp();
            let noise = (seed % 16) as f64;
            buffer[y * w + x] = (background + spot + noise).min(SENSOR_MAX as f64) as u16;
        }
    }
    buffer[0] = (frame_num & 0xffff) as u16;
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_number_is_stamped() {
        let frame = generate_test_pattern(8, 6, 3);
        assert_eq!(frame.len(), 48);
        assert_eq!(frame[0], 3);
        assert!(frame.iter().all(|&v| v <= SENSOR_MAX));
    }

    #[test]
    fn frames_differ_and_repeat_deterministically() {
        let a = generate_test_pattern(32, 32, 1);
        let b = generate_test_pattern(32, 32, 2);
        assert_ne!(a, b);
        assert_eq!(a, generate_test_pattern(32, 32, 1));
    }

    #[test]
    fn empty_frame() {
        assert!(generate_test_pattern(0, 10, 0).is_empty());
    }
}

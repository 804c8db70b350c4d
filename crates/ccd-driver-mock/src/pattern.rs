//! Synthetic star field for simulated frames.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

const SKY_LEVEL: f64 = 1200.0;
const STAR_COUNT: u64 = 24;

/// Render a star field into `buffer`.
///
/// Pixels are written little-endian with `bytes_per_pixel` bytes each (1 or 2;
/// wider depths are written as 16-bit values zero-extended). Star positions are
/// fixed for a given frame size so successive frames line up; sky noise varies
/// with `frame_number`. Returns the number of bytes written, which is
/// `width * height * bytes_per_pixel` clamped to the buffer length.
pub fn render_star_field(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    frame_number: u64,
) -> usize {
    let w = width as usize;
    let h = height as usize;
    let bpp = bytes_per_pixel.max(1);
    let pixels = (w * h).min(buffer.len() / bpp);
    let full_scale = if bpp == 1 { 255.0 } else { 65535.0 };
    let scale = full_scale / 65535.0;

    let stars: Vec<(f64, f64, f64)> = (0..STAR_COUNT)
        .map(|i| {
            let a = prng(i.wrapping_mul(7919) ^ ((w as u64) << 16));
            let b = prng(a ^ h as u64);
            let c = prng(b);
            (
                (a % w.max(1) as u64) as f64,
                (b % h.max(1) as u64) as f64,
                4000.0 + (c % 40000) as f64,
            )
        })
        .collect();

    let frame_seed = frame_number.wrapping_mul(2654435761);
    for idx in 0..pixels {
        let x = (idx % w.max(1)) as f64;
        let y = (idx / w.max(1)) as f64;

        let noise = (prng(frame_seed ^ idx as u64) & 0xFF) as f64 - 128.0;
        let mut value = SKY_LEVEL + noise;
        for &(sx, sy, peak) in &stars {
            let d2 = (x - sx).powi(2) + (y - sy).powi(2);
            if d2 < 64.0 {
                // Gaussian PSF, sigma 1.5 px
                value += peak * (-d2 / 4.5).exp();
            }
        }

        let value = (value * scale).clamp(0.0, full_scale) as u16;
        let offset = idx * bpp;
        if bpp == 1 {
            buffer[offset] = value as u8;
        } else {
            buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            buffer[offset + 2..offset + bpp].fill(0);
        }
    }
    pixels * bpp
}

use std::f32::consts::PI;

use num_complex::Complex32;

/// Symmetric Hanning window of length `len`.
pub fn hann_window(len: usize) -> Vec<f32> {
    (0..len).map(|index| hann_value(index, len)).collect()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 * (1.0 - ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos())
}

/// Iterative radix-2 decimation-in-time FFT, computed in place.
///
/// Output is in standard bin order: bin 0 is DC and bin `k` corresponds to
/// `k * sample_rate / len`.
///
/// # Panics
///
/// Panics if `buf.len()` is not a power of two.
pub fn fft_in_place(buf: &mut [Complex32]) {
    let n = buf.len();
    assert!(
        n.is_power_of_two(),
        "fft length must be a power of two, got {n}"
    );

    bit_reverse(buf);

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f32;
        let step = Complex32::new(angle.cos(), angle.sin());
        let half = len / 2;

        for start in (0..n).step_by(len) {
            let mut twiddle = Complex32::new(1.0, 0.0);
            for j in 0..half {
                let u = buf[start + j];
                let v = buf[start + j + half] * twiddle;
                buf[start + j] = u + v;
                buf[start + j + half] = u - v;
                twiddle *= step;
            }
        }

        len <<= 1;
    }
}

fn bit_reverse(buf: &mut [Complex32]) {
    let n = buf.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            buf.swap(i, j);
        }
    }
}

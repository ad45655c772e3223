use crate::codec::SAMPLE_BITS;

/// Largest positive sample value at the working bit depth.
pub const FULL_SCALE: f64 = ((1_i64 << (SAMPLE_BITS - 1)) - 1) as f64;

/// Root mean square of `samples` in the integer sample domain.
///
/// The sum of squares is accumulated exactly, so the result depends only on
/// the samples and not on summation order.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: u128 = samples
        .iter()
        .map(|&sample| {
            let sample = i64::from(sample);
            (sample * sample) as u128
        })
        .sum();
    (sum_of_squares as f64 / samples.len() as f64).sqrt()
}

/// Loudness of `samples` in dBFS.
///
/// Pure silence has no finite level and yields [`f64::NEG_INFINITY`].
pub fn measure_dbfs(samples: &[i16]) -> f64 {
    let rms = rms(samples);
    if rms == 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * (rms / FULL_SCALE).log10()
    }
}

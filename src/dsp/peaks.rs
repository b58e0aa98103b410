//! Per-frame spectral peak picking
//!
//! A bin is a candidate when it clears the noise floor and exceeds each of
//! its two neighbors on both sides; the strongest `top` candidates survive.
//! Optional median whitening raises the floor by a coarse per-frame median,
//! and optional parabolic refinement replaces kept bins by their vertex.

/// One spectral peak in a frame
///
/// `bin` is fractional only when parabolic refinement is enabled; consumers
/// indexing magnitudes round it to the nearest integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Frequency bin, possibly refined to a fractional vertex
    pub bin: f32,
    /// Raw log1p magnitude at the original bin
    pub magnitude: f32,
}

/// Select up to `top` peaks from a log-magnitude half-spectrum
///
/// # Arguments
///
/// * `mags` - Log-magnitude spectrum of one frame
/// * `top` - Maximum peaks to keep
/// * `min_magnitude` - Noise floor
/// * `whiten` - Raise the floor by a coarse per-frame median
/// * `refine` - Parabolic vertex refinement of kept bins
///
/// Ties in the top-`top` selection break on magnitude descending, then bin
/// ascending; the rule is total, so fingerprinting is deterministic.
pub fn pick_peaks(
    mags: &[f32],
    top: usize,
    min_magnitude: f32,
    whiten: bool,
    refine: bool,
) -> Vec<Peak> {
    if mags.len() < 5 || top == 0 {
        return Vec::new();
    }

    // Whitening shifts every bin by the same amount, which leaves the
    // local-maximum structure intact; only the floor test moves.
    let floor = if whiten {
        min_magnitude + coarse_median(mags)
    } else {
        min_magnitude
    };

    let mut candidates: Vec<(usize, f32)> = Vec::new();
    for k in 2..mags.len() - 2 {
        let m = mags[k];
        if m >= floor
            && m > mags[k - 1]
            && m > mags[k + 1]
            && m > mags[k - 2]
            && m > mags[k + 2]
        {
            candidates.push((k, m));
        }
    }

    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    candidates.truncate(top);

    candidates
        .into_iter()
        .map(|(k, m)| {
            let bin = if refine {
                parabolic_vertex(mags, k)
            } else {
                k as f32
            };
            Peak { bin, magnitude: m }
        })
        .collect()
}

/// Coarse per-frame median, sampled from every ~0.5 % of bins
fn coarse_median(mags: &[f32]) -> f32 {
    let step = (mags.len() / 200).max(1);
    let mut sampled: Vec<f32> = mags.iter().step_by(step).copied().collect();
    if sampled.is_empty() {
        return 0.0;
    }
    sampled.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sampled[sampled.len() / 2]
}

/// Vertex of the parabola through `(k-1, L), (k, C), (k+1, R)`
fn parabolic_vertex(mags: &[f32], k: usize) -> f32 {
    let left = mags[k - 1];
    let center = mags[k];
    let right = mags[k + 1];
    let denom = left - 2.0 * center + right;
    if denom.abs() < 1e-12 {
        return k as f32;
    }
    k as f32 + 0.5 * (left - right) / denom
}

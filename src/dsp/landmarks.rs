//! Landmark hashing
//!
//! Pairs each anchor peak with target peaks from up to `zone` future
//! frames and packs every retained pair into a 32-bit key:
//!
//! ```text
//! key = (f1_q & 0x3FF) << 22 | (f2_q & 0x3FF) << 12 | (dt_q & 0xFFF)
//! ```
//!
//! Only the frame *difference* enters the key, so the hash set is
//! translation invariant; the anchor time rides alongside each key and
//! makes offset reconstruction possible at match time.
//!
//! Peak bins are quantized by `freq_quant` as each frame's peak set enters
//! the ring, before pairing; peaks collapsing onto one quantized bin keep
//! the strongest representative.

use std::collections::VecDeque;

use crate::config::FingerprintConfig;
use crate::dsp::peaks::pick_peaks;
use crate::dsp::stft::Stft;
use crate::error::EngineError;

/// Bits for each quantized frequency in the packed key
pub const FREQ_BITS: u32 = 10;
/// Bits for the quantized frame delta in the packed key
pub const DT_BITS: u32 = 12;

const FREQ_MASK: u32 = (1 << FREQ_BITS) - 1;
const DT_MASK: u32 = (1 << DT_BITS) - 1;

/// Pack `(f1_q, f2_q, dt_q)` into a 32-bit landmark key
pub fn pack_key(f1: u32, f2: u32, dt: u32) -> u32 {
    ((f1 & FREQ_MASK) << (FREQ_BITS + DT_BITS)) | ((f2 & FREQ_MASK) << DT_BITS) | (dt & DT_MASK)
}

/// Split a packed key back into `(f1_q, f2_q, dt_q)`
pub fn unpack_key(key: u32) -> (u32, u32, u32) {
    (
        (key >> (FREQ_BITS + DT_BITS)) & FREQ_MASK,
        (key >> DT_BITS) & FREQ_MASK,
        key & DT_MASK,
    )
}

/// One landmark: packed key plus the anchor frame index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landmark {
    /// Packed `(f1_q, f2_q, dt_q)` key
    pub key: u32,
    /// Anchor time in frame units
    pub time: u32,
}

/// Peak with its pre-pairing quantized bin
#[derive(Debug, Clone, Copy)]
struct QuantPeak {
    qbin: u32,
    magnitude: f32,
}

/// Landmark extraction pipeline
///
/// Owns one FFT plan and its scratch buffers plus the ring of the last
/// `zone + 1` peak sets; workers hold one instance each and reuse it
/// across files.
pub struct LandmarkExtractor {
    stft: Stft,
    config: FingerprintConfig,
    ring: VecDeque<Vec<QuantPeak>>,
}

impl LandmarkExtractor {
    /// Create an extractor for the given configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidInput` on an invalid analysis grid.
    pub fn new(config: &FingerprintConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let stft = Stft::new(config.win, config.hop)?;
        Ok(Self {
            stft,
            config: config.clone(),
            ring: VecDeque::with_capacity(config.zone + 1),
        })
    }

    /// Hash a sample buffer into its landmark sequence
    ///
    /// Landmarks are emitted in anchor-time order. Buffers shorter than one
    /// window produce an empty sequence.
    pub fn extract(&mut self, samples: &[f32]) -> Vec<Landmark> {
        self.ring.clear();
        let n_frames = self.stft.frame_count(samples.len());
        let zone = self.config.zone;
        let mut landmarks = Vec::new();

        for t in 0..n_frames {
            let peaks = match self.stft.magnitudes(samples, t) {
                Some(mags) => pick_peaks(
                    mags,
                    self.config.peaks_per_frame,
                    self.config.min_magnitude,
                    self.config.whiten,
                    self.config.refine,
                ),
                None => break,
            };

            let mut qpeaks: Vec<QuantPeak> = peaks
                .iter()
                .map(|p| QuantPeak {
                    qbin: ((p.bin / self.config.freq_quant).round() as u32).min(FREQ_MASK),
                    magnitude: p.magnitude,
                })
                .collect();

            // Strongest first; duplicate quantized bins keep the first
            // (strongest) representative.
            qpeaks.sort_by(|a, b| {
                b.magnitude
                    .partial_cmp(&a.magnitude)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.qbin.cmp(&b.qbin))
            });
            let mut seen: Vec<u32> = Vec::with_capacity(qpeaks.len());
            qpeaks.retain(|p| {
                if seen.contains(&p.qbin) {
                    false
                } else {
                    seen.push(p.qbin);
                    true
                }
            });

            self.ring.push_back(qpeaks);

            if self.ring.len() == zone + 1 {
                self.emit_anchor(t - zone, &mut landmarks);
                self.ring.pop_front();
            }
        }

        // Tail frames still in the ring have a shortened forward window.
        let mut t0 = n_frames.saturating_sub(self.ring.len());
        while self.ring.len() > 1 {
            self.emit_anchor(t0, &mut landmarks);
            self.ring.pop_front();
            t0 += 1;
        }
        self.ring.clear();

        log::debug!(
            "Extracted {} landmarks from {} frames",
            landmarks.len(),
            n_frames
        );

        landmarks
    }

    /// Pair the ring's front frame (anchor time `t0`) against its future frames
    fn emit_anchor(&self, t0: usize, landmarks: &mut Vec<Landmark>) {
        if t0 % self.config.anchor_every != 0 {
            return;
        }

        let anchors = &self.ring[0];

        for anchor in anchors {
            // (score, dt, target bin) per candidate pair; scored by the
            // product of the original frame magnitudes.
            let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
            for dt in 1..self.ring.len() {
                for target in self.ring[dt].iter().take(self.config.fan) {
                    candidates.push((anchor.magnitude * target.magnitude, dt, target.qbin));
                }
            }

            candidates.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            });
            candidates.truncate(self.config.pairs_per_anchor);

            for (_, dt, target_bin) in candidates {
                let dt_q = ((dt as f32 / self.config.dt_quant).round() as u32).max(1);
                landmarks.push(Landmark {
                    key: pack_key(anchor.qbin, target_bin, dt_q),
                    time: t0 as u32,
                });
            }
        }
    }
}

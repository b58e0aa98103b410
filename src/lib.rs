//! # Waveprint
//!
//! A content-based audio fingerprint index for local corpora: find
//! near-duplicate recordings, overlapping clips and re-encodings of the
//! same source without comparing raw bytes.
//!
//! ## Features
//!
//! - **Landmark fingerprinting**: spectral-peak pairs packed into
//!   translation-invariant 32-bit hashes
//! - **Inverted index**: hash -> `(track, time)` postings with bounded
//!   buckets, incremental checkpoints and resumable builds
//! - **Duplicate detection**: per-pair offset histograms with a
//!   consistency score
//! - **Clip lookup**: best-matching tracks with alignment offsets
//!
//! ## Quick Start
//!
//! ```no_run
//! use waveprint::{fingerprint_samples, FingerprintConfig};
//!
//! // Mono f32 samples at the configured sample rate
//! let samples: Vec<f32> = vec![];
//! let config = FingerprintConfig::default();
//!
//! let landmarks = fingerprint_samples(&samples, &config)?;
//! println!("{} landmarks", landmarks.len());
//! # Ok::<(), waveprint::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! decoder subprocess -> STFT frames -> peaks -> landmarks -> inverted index
//!                                                                  |
//!                                duplicate pass / clip lookup  <---+
//! ```
//!
//! Decoding is delegated to an external PCM decoder on `PATH` (ffmpeg by
//! default); everything downstream operates on mono f32 sample buffers.
//! Invariance is designed for same-speed re-encodes, trims and partial
//! overlaps, not for time-stretching or pitch-shifting.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dsp;
pub mod error;
pub mod index;
pub mod io;
pub mod matcher;
pub mod pipeline;

// Re-export main types
pub use config::{FingerprintConfig, IndexParams, MatchConfig};
pub use dsp::landmarks::Landmark;
pub use error::EngineError;
pub use index::Index;

/// Fingerprint a sample buffer into its landmark sequence
///
/// Convenience wrapper constructing a one-shot DSP pipeline; batch callers
/// should hold a [`dsp::LandmarkExtractor`] and reuse it across files.
///
/// # Arguments
///
/// * `samples` - Mono samples at `config.sample_rate`, nominal `[-1.0, 1.0]`
/// * `config` - Analysis parameters; must match the target index
///
/// # Errors
///
/// Returns `EngineError::InvalidInput` on an invalid analysis grid.
pub fn fingerprint_samples(
    samples: &[f32],
    config: &FingerprintConfig,
) -> Result<Vec<Landmark>, EngineError> {
    let mut extractor = dsp::LandmarkExtractor::new(config)?;
    Ok(extractor.extract(samples))
}

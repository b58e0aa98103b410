//! Configuration parameters for fingerprinting and matching

use serde::{Deserialize, Serialize};

/// Fingerprinting configuration parameters
///
/// The analysis grid (`sample_rate`, `win`, `hop`) and the key quantizers
/// (`freq_quant`, `dt_quant`) must be identical between index build and
/// query; they are recorded in the index header and checked on open.
#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    // Analysis grid
    /// Target sample rate in Hz the decoder resamples to (default: 11025)
    pub sample_rate: u32,

    /// STFT window size in samples, power of two (default: 4096)
    pub win: usize,

    /// Hop between adjacent frames in samples (default: win/8 = 512)
    pub hop: usize,

    // Peak picking
    /// Maximum peaks kept per frame (default: 5)
    pub peaks_per_frame: usize,

    /// Noise floor: minimum log1p magnitude for a candidate peak (default: 0.08)
    pub min_magnitude: f32,

    /// Subtract a coarse per-frame median before the floor test (default: true)
    pub whiten: bool,

    /// Replace peak bins by their parabolic vertex (default: false)
    pub refine: bool,

    // Pairing
    /// Maximum forward distance from anchor to target, in frames (default: 48)
    pub zone: usize,

    /// Maximum targets retained per anchor (default: 3)
    pub pairs_per_anchor: usize,

    /// Maximum target peaks considered per future frame (default: 3)
    pub fan: usize,

    /// Use only every n-th frame as an anchor frame (default: 1 = all)
    pub anchor_every: usize,

    // Key quantization
    /// Frequency-bin quantizer applied before pairing (default: 2.0)
    pub freq_quant: f32,

    /// Frame-delta quantizer applied at key packing (default: 1.0)
    pub dt_quant: f32,

    // Indexing
    /// Maximum postings per bucket; overflow is silently dropped (default: 250)
    pub bucket_cap: usize,

    /// Per-file decode cap in seconds (default: None = whole file)
    pub max_seconds: Option<f32>,

    /// Soft per-file decoder timeout in seconds (default: None = no timeout)
    pub timeout_secs: Option<u64>,

    /// Worker thread count (default: 0 = one per CPU)
    pub threads: usize,

    /// Checkpoint the index every n accepted tracks (default: 16)
    pub checkpoint_every: usize,

    /// External decoder program name (default: "ffmpeg")
    pub decoder: String,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_rate: 11025,
            win: 4096,
            hop: 512,
            peaks_per_frame: 5,
            min_magnitude: 0.08,
            whiten: true,
            refine: false,
            zone: 48,
            pairs_per_anchor: 3,
            fan: 3,
            anchor_every: 1,
            freq_quant: 2.0,
            dt_quant: 1.0,
            bucket_cap: 250,
            max_seconds: None,
            timeout_secs: None,
            threads: 0,
            checkpoint_every: 16,
            decoder: "ffmpeg".to_string(),
        }
    }
}

impl FingerprintConfig {
    /// Validate grid and pairing parameters
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        use crate::error::EngineError;

        if self.win == 0 || !self.win.is_power_of_two() {
            return Err(EngineError::InvalidInput(format!(
                "Window size must be a power of two, got {}",
                self.win
            )));
        }
        if self.hop == 0 || self.hop > self.win {
            return Err(EngineError::InvalidInput(format!(
                "Hop size must be in 1..={}, got {}",
                self.win, self.hop
            )));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidInput("Sample rate must be > 0".to_string()));
        }
        if self.peaks_per_frame == 0 {
            return Err(EngineError::InvalidInput("Peaks per frame must be > 0".to_string()));
        }
        if self.zone == 0 {
            return Err(EngineError::InvalidInput("Pairing zone must be > 0".to_string()));
        }
        if self.anchor_every == 0 {
            return Err(EngineError::InvalidInput("Anchor stride must be > 0".to_string()));
        }
        if self.freq_quant <= 0.0 || self.dt_quant <= 0.0 {
            return Err(EngineError::InvalidInput(
                "Quantizers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parameter header recorded in the persisted index
    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            version: INDEX_FORMAT_VERSION,
            sample_rate: self.sample_rate,
            win: self.win,
            hop: self.hop,
            freq_quant: self.freq_quant,
            dt_quant: self.dt_quant,
            whiten: self.whiten,
            refine: self.refine,
        }
    }
}

/// Current on-disk index format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Build parameters pinned inside the persisted index
///
/// Anything that changes the landmark stream for the same audio lives here,
/// so that a query can refuse an index built on a different analysis grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParams {
    /// Index format version
    pub version: u32,
    /// Decoder target sample rate in Hz
    pub sample_rate: u32,
    /// STFT window size in samples
    pub win: usize,
    /// Hop between frames in samples
    pub hop: usize,
    /// Frequency-bin quantizer
    pub freq_quant: f32,
    /// Frame-delta quantizer
    pub dt_quant: f32,
    /// Median whitening enabled
    pub whiten: bool,
    /// Parabolic peak refinement enabled
    pub refine: bool,
}

impl IndexParams {
    /// Check that a config reproduces the landmark stream this index was built with
    pub fn check(&self, config: &FingerprintConfig) -> Result<(), crate::error::EngineError> {
        let expected = config.index_params();
        if *self != expected {
            return Err(crate::error::EngineError::BadParams(format!(
                "index was built with {:?}, current config gives {:?}",
                self, expected
            )));
        }
        Ok(())
    }
}

/// Matcher configuration parameters
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Minimum votes on the best offset for a pair to be emitted (default: 6)
    pub min_matches: usize,

    /// Minimum best_count / total_pairs consistency ratio (default: 0.1)
    pub min_ratio: f32,

    /// Cap applied to each surviving bucket during the duplicate pass (default: 250)
    pub max_bucket: usize,

    /// Buckets larger than this behave as stop words and are skipped (default: 500)
    pub drop_above: usize,

    /// Buckets smaller than this cannot vote and are skipped (default: 2)
    pub min_bucket: usize,

    /// Number of tracks reported by clip lookup (default: 5)
    pub top_n: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_matches: 6,
            min_ratio: 0.1,
            max_bucket: 250,
            drop_above: 500,
            min_bucket: 2,
            top_n: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FingerprintConfig::default().validate().is_ok());
    }

    #[test]
    fn test_non_power_of_two_window_rejected() {
        let config = FingerprintConfig {
            win: 4000,
            ..FingerprintConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_hop_rejected() {
        let config = FingerprintConfig {
            hop: 0,
            ..FingerprintConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_params_header_round_trip() {
        let config = FingerprintConfig::default();
        let params = config.index_params();
        assert!(params.check(&config).is_ok());

        let other = FingerprintConfig {
            hop: 1024,
            ..FingerprintConfig::default()
        };
        assert!(params.check(&other).is_err(), "grid mismatch must be rejected");
    }
}

//! DSP front end
//!
//! Turns a decoded sample buffer into a stream of spectral frames, picks
//! per-frame peaks, and pairs them into translation-invariant landmark
//! hashes:
//!
//! ```text
//! samples -> Hann + FFT -> log-magnitude frames -> peaks -> landmarks
//! ```

pub mod landmarks;
pub mod peaks;
pub mod stft;

pub use landmarks::{pack_key, unpack_key, Landmark, LandmarkExtractor};
pub use peaks::{pick_peaks, Peak};
pub use stft::Stft;

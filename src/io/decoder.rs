//! External decoder subprocess adapter
//!
//! Audio decoding is delegated to an external PCM decoder (ffmpeg by
//! default) asked to emit mono float32 little-endian at the configured
//! sample rate. The adapter drains the child's stdout to completion,
//! ignores its diagnostic stream, and treats any nonzero termination as
//! failure. Retries are the caller's decision.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::FingerprintConfig;
use crate::error::EngineError;
use crate::io::sample_buffer::SampleBuffer;

/// Read size for draining the decoder pipe
const CHUNK_BYTES: usize = 64 * 1024;

/// Decode an audio file to mono f32 PCM at the configured sample rate
///
/// # Arguments
///
/// * `path` - Audio file to decode
/// * `config` - Supplies the target sample rate, the optional per-file
///   decode cap and the decoder program name
///
/// # Errors
///
/// Returns `EngineError::DecoderFailed` if the subprocess cannot be
/// spawned, exits nonzero, times out, or emits a byte count that is not a
/// multiple of 4.
pub fn decode(path: &Path, config: &FingerprintConfig) -> Result<SampleBuffer, EngineError> {
    static NEVER: AtomicBool = AtomicBool::new(false);
    decode_with_cancel(path, config, &NEVER)
}

/// Decode with a cooperative cancellation flag
///
/// The flag is checked between pipe reads; when it flips, the child is
/// killed and the file fails with `DecoderFailed`.
pub fn decode_with_cancel(
    path: &Path,
    config: &FingerprintConfig,
    cancel: &AtomicBool,
) -> Result<SampleBuffer, EngineError> {
    let mut command = Command::new(&config.decoder);
    command
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(path)
        .arg("-f")
        .arg("f32le")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(config.sample_rate.to_string());

    if let Some(seconds) = config.max_seconds {
        command.arg("-t").arg(format!("{}", seconds));
    }

    command
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    log::debug!("Decoding {:?} with {}", path, config.decoder);

    let mut child = command.spawn().map_err(|e| {
        EngineError::DecoderFailed(format!("could not spawn {}: {}", config.decoder, e))
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::DecoderFailed("decoder stdout not captured".to_string()))?;

    let started = Instant::now();
    let mut bytes: Vec<u8> = Vec::new();
    let mut chunk = [0u8; CHUNK_BYTES];

    // Drain the pipe to completion; the child must never block on a full pipe.
    loop {
        if cancel.load(Ordering::Relaxed) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::DecoderFailed(format!(
                "decoding of {:?} cancelled",
                path
            )));
        }

        if let Some(limit) = config.timeout_secs {
            if started.elapsed().as_secs() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::DecoderFailed(format!(
                    "decoding of {:?} exceeded {} s timeout",
                    path, limit
                )));
            }
        }

        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::DecoderFailed(format!(
                    "pipe read from decoder failed: {}",
                    e
                )));
            }
        }
    }

    let status = child
        .wait()
        .map_err(|e| EngineError::DecoderFailed(format!("wait on decoder failed: {}", e)))?;

    if !status.success() {
        return Err(EngineError::DecoderFailed(format!(
            "{} exited with {} for {:?}",
            config.decoder, status, path
        )));
    }

    if bytes.len() % 4 != 0 {
        return Err(EngineError::DecoderFailed(format!(
            "decoder emitted {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    log::debug!(
        "Decoded {:?}: {} samples ({:.1} s) at {} Hz",
        path,
        samples.len(),
        samples.len() as f32 / config.sample_rate as f32,
        config.sample_rate
    );

    Ok(SampleBuffer::new(samples, config.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_decoder_program_fails() {
        let config = FingerprintConfig {
            decoder: "definitely-not-a-real-decoder".to_string(),
            ..FingerprintConfig::default()
        };
        let result = decode(Path::new("nothing.wav"), &config);
        assert!(matches!(result, Err(EngineError::DecoderFailed(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        // `true` reads the flag at the first loop turn, before any pipe read.
        let config = FingerprintConfig {
            decoder: "cat".to_string(),
            ..FingerprintConfig::default()
        };
        let cancel = AtomicBool::new(true);
        let result = decode_with_cancel(Path::new("/dev/zero"), &config, &cancel);
        assert!(matches!(result, Err(EngineError::DecoderFailed(_))));
    }
}

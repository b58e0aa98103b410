//! Index build orchestration
//!
//! Parallel workers (one DSP pipeline each) decode and hash files; a
//! single indexer owner serializes every index mutation and owns the
//! persisted artifact. Results flow worker -> indexer over a bounded
//! channel, so in-flight landmark memory stays capped when the indexer
//! falls behind.
//!
//! Parallelism is always per file; a single track's DSP is never split.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::bounded;

use crate::config::FingerprintConfig;
use crate::dsp::landmarks::{Landmark, LandmarkExtractor};
use crate::error::EngineError;
use crate::index::persist;
use crate::io::decoder;

/// Recognized audio file extensions, matched case-insensitively
pub const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "wav", "flac", "ogg", "opus", "m4a"];

/// Outcome summary of one build run
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Tracks fingerprinted and added in this run
    pub indexed: usize,
    /// Files skipped because their name was already in the index
    pub skipped: usize,
    /// Files that failed (decoder errors, lost workers)
    pub failed: usize,
    /// Whether the run was cancelled before draining the file list
    pub cancelled: bool,
}

enum FileOutcome {
    Hashed {
        name: String,
        landmarks: Vec<Landmark>,
    },
    Failed {
        path: PathBuf,
        error: EngineError,
    },
    Panicked {
        path: PathBuf,
        attempt: u8,
    },
    Cancelled,
}

/// List the recognized audio files of `dir`, sorted by file name
///
/// The sort fixes the scheduling order, which keeps resumed builds
/// deterministic in file-listing order.
pub fn scan_audio_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::InvalidInput(format!("cannot read {:?}: {}", dir, e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| {
                    let lower = e.to_ascii_lowercase();
                    AUDIO_EXTENSIONS.iter().any(|&known| known == lower)
                })
                .unwrap_or(false)
        })
        .collect();

    files.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    Ok(files)
}

/// Fingerprint a directory into the index artifact at `out`
///
/// Resumes an existing artifact (files whose name is already in `meta` are
/// skipped), checkpoints every `checkpoint_every` accepted tracks, and
/// finalizes on a clean finish. A cancelled run checkpoints once and
/// returns with `cancelled` set; the artifact stays resumable.
///
/// # Errors
///
/// Structural errors are fatal: `BadParams` on a grid mismatch with the
/// existing artifact, `WriteFailed` when a checkpoint cannot be renamed
/// into place. Per-file decoder failures are logged and skipped.
pub fn build_index(
    dir: &Path,
    out: &Path,
    config: &FingerprintConfig,
    cancel: &AtomicBool,
) -> Result<BuildReport, EngineError> {
    config.validate()?;

    let mut index = persist::open_or_create(out, config)?;
    let mut report = BuildReport::default();

    let files = scan_audio_files(dir)?;
    let pending: Vec<PathBuf> = files
        .into_iter()
        .filter(|path| {
            let name = track_name(path);
            if index.contains_track(&name) {
                log::debug!("Skipping {}: already indexed", name);
                report.skipped += 1;
                false
            } else {
                true
            }
        })
        .collect();

    if pending.is_empty() {
        log::info!("Nothing to do: {} files already indexed", report.skipped);
        return Ok(report);
    }

    let threads = if config.threads == 0 {
        num_cpus::get()
    } else {
        config.threads
    };
    let threads = threads.min(pending.len()).max(1);
    log::info!(
        "Fingerprinting {} files on {} workers",
        pending.len(),
        threads
    );

    // Jobs carry a retry attempt; capacity leaves room for requeues.
    let (job_tx, job_rx) = bounded::<(PathBuf, u8)>(pending.len() + threads);
    let (result_tx, result_rx) = bounded::<FileOutcome>(threads * 2);

    let mut outstanding = 0usize;
    for path in &pending {
        job_tx.send((path.clone(), 0)).expect("job queue sized for all files");
        outstanding += 1;
    }

    std::thread::scope(|scope| -> Result<(), EngineError> {
        for worker_id in 0..threads {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let mut extractor = match LandmarkExtractor::new(config) {
                    Ok(extractor) => extractor,
                    Err(e) => {
                        log::error!("Worker {} failed to start: {}", worker_id, e);
                        return;
                    }
                };

                while let Ok((path, attempt)) = job_rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        let _ = result_tx.send(FileOutcome::Cancelled);
                        continue;
                    }
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        process_file(&path, config, &mut extractor, cancel)
                    }));
                    let message = match outcome {
                        Ok(Ok((name, landmarks))) => FileOutcome::Hashed { name, landmarks },
                        Ok(Err(error)) => FileOutcome::Failed { path, error },
                        Err(_) => FileOutcome::Panicked { path, attempt },
                    };
                    if result_tx.send(message).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);

        let mut since_checkpoint = 0usize;
        while outstanding > 0 {
            let outcome = result_rx
                .recv()
                .map_err(|_| EngineError::WorkerLost("all workers exited early".to_string()))?;
            outstanding -= 1;

            match outcome {
                FileOutcome::Hashed { name, landmarks } => {
                    let id = index.begin_track(&name)?;
                    index.append(id, &landmarks);
                    report.indexed += 1;
                    since_checkpoint += 1;
                    log::info!("Indexed {} ({} landmarks)", name, landmarks.len());

                    if since_checkpoint >= config.checkpoint_every {
                        persist::save(&index, out)?;
                        since_checkpoint = 0;
                    }
                }
                FileOutcome::Failed { path, error } => {
                    log::warn!("Skipping {:?}: {}", path, error);
                    report.failed += 1;
                }
                FileOutcome::Panicked { path, attempt } => {
                    if attempt == 0 {
                        log::warn!("Worker lost on {:?}, rescheduling once", path);
                        job_tx
                            .send((path, 1))
                            .expect("job queue sized for requeues");
                        outstanding += 1;
                    } else {
                        log::error!(
                            "{}",
                            EngineError::WorkerLost(format!("{:?} failed twice", path))
                        );
                        report.failed += 1;
                    }
                }
                FileOutcome::Cancelled => {
                    report.cancelled = true;
                }
            }
        }

        drop(job_tx);
        Ok(())
    })?;

    if report.cancelled {
        // One final checkpoint; the artifact stays raw and resumable.
        persist::save(&index, out)?;
        log::info!(
            "Cancelled after {} tracks; checkpoint written to {:?}",
            report.indexed,
            out
        );
        return Ok(report);
    }

    index.finalize();
    persist::save(&index, out)?;
    if index.overflow_dropped() > 0 {
        log::debug!(
            "Bucket cap dropped {} landmarks during this build",
            index.overflow_dropped()
        );
    }
    log::info!(
        "Indexed {} tracks ({} skipped, {} failed) into {:?}",
        report.indexed,
        report.skipped,
        report.failed,
        out
    );

    Ok(report)
}

/// Track name recorded in `meta`: the file basename
pub fn track_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn process_file(
    path: &Path,
    config: &FingerprintConfig,
    extractor: &mut LandmarkExtractor,
    cancel: &AtomicBool,
) -> Result<(String, Vec<Landmark>), EngineError> {
    let buffer = decoder::decode_with_cancel(path, config, cancel)?;
    let landmarks = extractor.extract(&buffer.samples);
    Ok((track_name(path), landmarks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mp3", "a.FLAC", "notes.txt", "c.ogg", "d.mp3.bak"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = scan_audio_files(dir.path()).unwrap();
        let names: Vec<String> = files.iter().map(|p| track_name(p)).collect();
        assert_eq!(names, vec!["a.FLAC", "b.mp3", "c.ogg"]);
    }

    #[test]
    fn test_scan_missing_dir_fails() {
        assert!(scan_audio_files(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn test_build_skips_failing_decoder_and_stays_ok() {
        // Files exist but the decoder program does not: every file fails,
        // the build itself still succeeds with an empty index.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"junk").unwrap();
        std::fs::write(dir.path().join("b.wav"), b"junk").unwrap();

        let out = dir.path().join("index.json");
        let config = FingerprintConfig {
            decoder: "definitely-not-a-real-decoder".to_string(),
            threads: 2,
            ..FingerprintConfig::default()
        };

        let cancel = AtomicBool::new(false);
        let report = build_index(dir.path(), &out, &config, &cancel).unwrap();

        assert_eq!(report.indexed, 0);
        assert_eq!(report.failed, 2);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_cancelled_build_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"junk").unwrap();

        let out = dir.path().join("index.json");
        let config = FingerprintConfig {
            decoder: "definitely-not-a-real-decoder".to_string(),
            ..FingerprintConfig::default()
        };

        let cancel = AtomicBool::new(true);
        let report = build_index(dir.path(), &out, &config, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 0);
        assert!(out.exists(), "a cancelled run still checkpoints");
    }
}

//! Waveprint CLI - fingerprint indexing, clip lookup and duplicate detection
//!
//! Commands:
//! - `build <dir> [out]` - fingerprint a directory into an index artifact
//! - `query <index> <clip>` - print the tracks best matching a clip
//! - `duplicates <index> [out] [...]` - run the duplicate pass
//! - `stats <index>` - print index size figures

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};

use waveprint::index::persist;
use waveprint::matcher;
use waveprint::pipeline;
use waveprint::{EngineError, FingerprintConfig, MatchConfig};

/// Content-based audio fingerprint indexing and duplicate detection
#[derive(Parser)]
#[command(name = "waveprint")]
#[command(version)]
#[command(about = "Audio fingerprint index: find duplicates and look up clips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Analysis parameters shared by build and query
///
/// The grid options must be identical between build and query; they are
/// recorded in the index artifact and checked on open.
#[derive(Args)]
struct DspArgs {
    /// Decoder target sample rate in Hz
    #[arg(long, default_value = "11025")]
    sr: u32,

    /// STFT window size in samples (power of two)
    #[arg(long, default_value = "4096")]
    win: usize,

    /// Hop between frames in samples
    #[arg(long, default_value = "512")]
    hop: usize,

    /// Peaks kept per frame
    #[arg(long, default_value = "5")]
    top: usize,

    /// Noise floor for candidate peaks
    #[arg(long, default_value = "0.08")]
    min: f32,

    /// Target peaks considered per future frame
    #[arg(long, default_value = "3")]
    fan: usize,

    /// Use only every n-th frame as an anchor frame
    #[arg(long, default_value = "1")]
    anchor_every: usize,

    /// Forward pairing window in frames
    #[arg(long, default_value = "48")]
    zone: usize,

    /// Targets retained per anchor
    #[arg(long, default_value = "3")]
    pairs: usize,

    /// Frequency-bin quantizer
    #[arg(long, default_value = "2.0")]
    fq: f32,

    /// Frame-delta quantizer
    #[arg(long, default_value = "1.0")]
    dtq: f32,

    /// Disable per-frame median whitening
    #[arg(long)]
    no_whiten: bool,

    /// Enable parabolic peak refinement
    #[arg(long)]
    refine: bool,

    /// Postings cap per bucket
    #[arg(long, default_value = "250")]
    bucket_cap: usize,

    /// Per-file decode cap in seconds
    #[arg(long)]
    sec: Option<f32>,

    /// Soft per-file decoder timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Worker threads (0 = one per CPU)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// External decoder program
    #[arg(long, default_value = "ffmpeg")]
    decoder: String,
}

impl DspArgs {
    fn to_config(&self) -> FingerprintConfig {
        FingerprintConfig {
            sample_rate: self.sr,
            win: self.win,
            hop: self.hop,
            peaks_per_frame: self.top,
            min_magnitude: self.min,
            whiten: !self.no_whiten,
            refine: self.refine,
            zone: self.zone,
            pairs_per_anchor: self.pairs,
            fan: self.fan,
            anchor_every: self.anchor_every,
            freq_quant: self.fq,
            dt_quant: self.dtq,
            bucket_cap: self.bucket_cap,
            max_seconds: self.sec,
            timeout_secs: self.timeout,
            threads: self.threads,
            ..FingerprintConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint a directory of audio files into an index
    Build {
        /// Directory of audio files
        dir: PathBuf,

        /// Output index artifact
        #[arg(default_value = "index.json")]
        out: PathBuf,

        #[command(flatten)]
        dsp: DspArgs,
    },

    /// Look up a short clip against an index
    Query {
        /// Index artifact
        index: PathBuf,

        /// Clip audio file
        clip: PathBuf,

        /// Number of matches to print
        #[arg(long, default_value = "5")]
        top_n: usize,

        /// Skip buckets larger than this at match time
        #[arg(long, default_value = "500")]
        drop_above: usize,

        #[command(flatten)]
        dsp: DspArgs,
    },

    /// Find pairs of indexed tracks that share aligned fingerprints
    Duplicates {
        /// Index artifact
        index: PathBuf,

        /// Optional JSON report path
        out: Option<PathBuf>,

        /// Minimum votes on the best offset
        #[arg(default_value = "6")]
        min_matches: usize,

        /// Minimum best_count / total_pairs ratio
        #[arg(default_value = "0.1")]
        min_ratio: f32,

        /// Cap per surviving bucket
        #[arg(default_value = "250")]
        max_bucket: usize,

        /// Skip buckets larger than this
        #[arg(default_value = "500")]
        drop_above: usize,
    },

    /// Print index size figures
    Stats {
        /// Index artifact
        index: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), EngineError> {
    match command {
        Commands::Build { dir, out, dsp } => {
            let config = dsp.to_config();
            let cancel = AtomicBool::new(false);
            let report = pipeline::build_index(&dir, &out, &config, &cancel)?;
            println!(
                "Indexed {} tracks ({} skipped, {} failed) -> {}",
                report.indexed,
                report.skipped,
                report.failed,
                out.display()
            );
        }

        Commands::Query {
            index,
            clip,
            top_n,
            drop_above,
            dsp,
        } => {
            let config = dsp.to_config();
            let loaded = persist::load(&index, config.bucket_cap)?;
            let buffer = waveprint::io::decoder::decode(&clip, &config)?;

            let match_config = MatchConfig {
                top_n,
                drop_above,
                ..MatchConfig::default()
            };
            let results = matcher::query(&loaded, &buffer.samples, &config, &match_config)?;

            if results.is_empty() {
                println!("No matches");
                return Ok(());
            }

            let params = loaded.params();
            let frame_seconds = params.hop as f64 / params.sample_rate as f64;
            for (rank, m) in results.iter().enumerate() {
                println!(
                    "{:2}. {}  offset {} frames ({:+.2} s)  votes {}",
                    rank + 1,
                    m.name,
                    m.best_offset,
                    m.best_offset as f64 * frame_seconds,
                    m.votes
                );
            }
        }

        Commands::Duplicates {
            index,
            out,
            min_matches,
            min_ratio,
            max_bucket,
            drop_above,
        } => {
            let loaded = persist::load(&index, max_bucket)?;
            let config = MatchConfig {
                min_matches,
                min_ratio,
                max_bucket,
                drop_above,
                ..MatchConfig::default()
            };
            let pairs = matcher::find_duplicates(&loaded, &config);

            let params = loaded.params();
            let frame_seconds = params.hop as f64 / params.sample_rate as f64;
            for pair in &pairs {
                println!(
                    "{}  <->  {}  offset {} frames ({:+.2} s)  {}/{} votes  score {:.3}",
                    pair.name_a,
                    pair.name_b,
                    pair.best_offset,
                    pair.best_offset as f64 * frame_seconds,
                    pair.best_count,
                    pair.total_pairs,
                    pair.score
                );
            }
            println!("{} duplicate pairs", pairs.len());

            if let Some(out) = out {
                let json = serde_json::to_vec_pretty(&pairs)
                    .map_err(|e| EngineError::WriteFailed(e.to_string()))?;
                std::fs::write(&out, json)
                    .map_err(|e| EngineError::WriteFailed(format!("{}: {}", out.display(), e)))?;
                println!("Report written to {}", out.display());
            }
        }

        Commands::Stats { index } => {
            let loaded = persist::load(&index, usize::MAX)?;
            let mut sizes = loaded.bucket_sizes();
            sizes.sort_unstable();

            let percentile = |p: f64| -> usize {
                if sizes.is_empty() {
                    return 0;
                }
                let i = ((sizes.len() - 1) as f64 * p).round() as usize;
                sizes[i]
            };

            println!("tracks:    {}", loaded.track_count());
            println!("keys:      {}", loaded.key_count());
            println!("postings:  {}", loaded.posting_count());
            println!(
                "bucket size p50/p90/p99/max: {}/{}/{}/{}",
                percentile(0.50),
                percentile(0.90),
                percentile(0.99),
                sizes.last().copied().unwrap_or(0)
            );
            println!("finalized: {}", loaded.is_finalized());
        }
    }

    Ok(())
}

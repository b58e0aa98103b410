//! Clip lookup
//!
//! Hashes the query clip exactly as during indexing, then votes per
//! `(track, offset)` over the postings of every bucket the clip's keys hit.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{FingerprintConfig, MatchConfig};
use crate::dsp::landmarks::LandmarkExtractor;
use crate::error::EngineError;
use crate::index::Index;

/// One clip-lookup result
#[derive(Debug, Clone, Serialize)]
pub struct QueryMatch {
    /// Matched track id
    pub track: u32,
    /// Matched track name
    pub name: String,
    /// Best `t_track - t_clip` alignment, in frames
    pub best_offset: i64,
    /// Votes on the best offset
    pub votes: usize,
}

/// Report the indexed tracks best matching a clip
///
/// The clip is fingerprinted with `fp_config`, which must reproduce the
/// landmark stream the index was built with.
///
/// # Errors
///
/// Returns `EngineError::BadParams` when `fp_config` disagrees with the
/// index header, `EngineError::InvalidInput` on an invalid configuration.
pub fn query(
    index: &Index,
    clip: &[f32],
    fp_config: &FingerprintConfig,
    match_config: &MatchConfig,
) -> Result<Vec<QueryMatch>, EngineError> {
    index.params().check(fp_config)?;

    let mut extractor = LandmarkExtractor::new(fp_config)?;
    let landmarks = extractor.extract(clip);
    log::debug!("Query clip hashed to {} landmarks", landmarks.len());

    let mut votes: HashMap<(u32, i64), usize> = HashMap::new();
    for landmark in &landmarks {
        let bucket = match index.bucket(landmark.key) {
            Some(bucket) => bucket,
            None => continue,
        };
        // Stop keys vote for everything; skip them like the duplicate pass.
        if bucket.len() > match_config.drop_above {
            continue;
        }
        for posting in bucket {
            let offset = posting.time as i64 - landmark.time as i64;
            *votes.entry((posting.track, offset)).or_insert(0) += 1;
        }
    }

    // Reduce to each track's best offset.
    let mut best: HashMap<u32, (i64, usize)> = HashMap::new();
    for ((track, offset), count) in votes {
        let slot = best.entry(track).or_insert((offset, 0));
        if count > slot.1 || (count == slot.1 && offset < slot.0) {
            *slot = (offset, count);
        }
    }

    let mut results: Vec<QueryMatch> = best
        .into_iter()
        .map(|(track, (best_offset, votes))| QueryMatch {
            track,
            name: index.name(track).unwrap_or("?").to_string(),
            best_offset,
            votes,
        })
        .collect();

    results.sort_by(|x, y| y.votes.cmp(&x.votes).then_with(|| x.track.cmp(&y.track)));
    results.truncate(match_config.top_n);

    Ok(results)
}

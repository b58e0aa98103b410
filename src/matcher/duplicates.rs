//! Duplicate pass
//!
//! Two passes over the bucket list: the first counts cross-track hash
//! co-occurrences to admit candidate pairs, the second builds a per-pair
//! offset histogram and scores its mode. The enumeration is quadratic in
//! bucket size; `bucket_cap` at build time plus `drop_above`/`max_bucket`
//! here keep it near-linear on realistic corpora.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::MatchConfig;
use crate::index::{Index, Posting};

/// One emitted duplicate candidate, canonical order `track_a < track_b`
#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    /// Lower track id
    pub track_a: u32,
    /// Higher track id
    pub track_b: u32,
    /// Name of `track_a`
    pub name_a: String,
    /// Name of `track_b`
    pub name_b: String,
    /// Histogram mode of `t_a - t_b`, in frames
    pub best_offset: i64,
    /// Votes on the best offset
    pub best_count: usize,
    /// All cross-track co-occurrences of the pair
    pub total_pairs: usize,
    /// Consistency: `best_count / total_pairs`
    pub score: f32,
}

/// Find track pairs whose hash co-occurrences cluster on one offset
///
/// Results are ordered by `(best_count desc, score desc, pair asc)`; each
/// pair appears at most once, in canonical id order.
pub fn find_duplicates(index: &Index, config: &MatchConfig) -> Vec<DuplicatePair> {
    let buckets = surviving_buckets(index, config);
    log::debug!(
        "Duplicate pass over {} of {} buckets",
        buckets.len(),
        index.key_count()
    );

    // Pass 1: count cross-track co-occurrences per unordered pair.
    let pair_counts: HashMap<(u32, u32), usize> = buckets
        .par_iter()
        .fold(HashMap::new, |mut acc: HashMap<(u32, u32), usize>, bucket| {
            for_each_cross_pair(bucket, |pair, _| {
                *acc.entry(pair).or_insert(0) += 1;
            });
            acc
        })
        .reduce(HashMap::new, |mut left, right| {
            for (pair, n) in right {
                *left.entry(pair).or_insert(0) += n;
            }
            left
        });

    let candidates: HashMap<(u32, u32), usize> = pair_counts
        .into_iter()
        .filter(|(_, n)| *n >= config.min_matches)
        .collect();

    if candidates.is_empty() {
        return Vec::new();
    }
    log::debug!("{} candidate pairs after counting", candidates.len());

    // Pass 2: per-candidate offset histogram and total.
    type Histograms = HashMap<(u32, u32), (HashMap<i64, usize>, usize)>;
    let histograms: Histograms = buckets
        .par_iter()
        .fold(HashMap::new, |mut acc: Histograms, bucket| {
            for_each_cross_pair(bucket, |pair, offset| {
                if candidates.contains_key(&pair) {
                    let slot = acc.entry(pair).or_default();
                    *slot.0.entry(offset).or_insert(0) += 1;
                    slot.1 += 1;
                }
            });
            acc
        })
        .reduce(HashMap::new, |mut left, right| {
            for (pair, (offsets, total)) in right {
                let slot = left.entry(pair).or_default();
                for (offset, n) in offsets {
                    *slot.0.entry(offset).or_insert(0) += n;
                }
                slot.1 += total;
            }
            left
        });

    let mut results: Vec<DuplicatePair> = histograms
        .into_iter()
        .filter_map(|((a, b), (offsets, total))| {
            let (best_offset, best_count) = offsets
                .into_iter()
                .max_by(|x, y| x.1.cmp(&y.1).then_with(|| y.0.cmp(&x.0)))?;

            let score = best_count as f32 / total as f32;
            if best_count < config.min_matches || score < config.min_ratio {
                return None;
            }

            Some(DuplicatePair {
                track_a: a,
                track_b: b,
                name_a: index.name(a).unwrap_or("?").to_string(),
                name_b: index.name(b).unwrap_or("?").to_string(),
                best_offset,
                best_count,
                total_pairs: total,
                score,
            })
        })
        .collect();

    results.sort_by(|x, y| {
        y.best_count
            .cmp(&x.best_count)
            .then_with(|| y.score.partial_cmp(&x.score).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| (x.track_a, x.track_b).cmp(&(y.track_a, y.track_b)))
    });

    log::info!("Duplicate pass emitted {} pairs", results.len());
    results
}

/// Stop-key filter plus per-bucket normalization
///
/// Drops buckets outside `[min_bucket, drop_above]` by raw size, dedupes
/// exact `(track, time)` duplicates and caps the rest at `max_bucket`.
/// Buckets left with fewer than two postings cannot form a pair and are
/// dropped regardless of `min_bucket`.
fn surviving_buckets(index: &Index, config: &MatchConfig) -> Vec<Vec<Posting>> {
    index
        .iter_buckets()
        .filter(|(_, bucket)| {
            bucket.len() >= config.min_bucket && bucket.len() <= config.drop_above
        })
        .map(|(_, bucket)| {
            let mut postings = bucket.to_vec();
            postings.sort_by_key(|p| (p.track, p.time));
            postings.dedup();
            postings.truncate(config.max_bucket);
            postings
        })
        .filter(|postings| postings.len() >= 2)
        .collect()
}

/// Invoke `f` for every cross-track entry pair, canonicalized
///
/// The pair key is `(min_id, max_id)` and the offset is
/// `time(min_id entry) - time(max_id entry)`, so `best_offset(a, b)` and
/// `best_offset(b, a)` are negations of one another by construction.
fn for_each_cross_pair<F: FnMut((u32, u32), i64)>(bucket: &[Posting], mut f: F) {
    for i in 0..bucket.len() {
        for j in i + 1..bucket.len() {
            let (x, y) = (bucket[i], bucket[j]);
            if x.track == y.track {
                continue;
            }
            let (pair, offset) = if x.track < y.track {
                ((x.track, y.track), x.time as i64 - y.time as i64)
            } else {
                ((y.track, x.track), y.time as i64 - x.time as i64)
            };
            f(pair, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FingerprintConfig;
    use crate::dsp::landmarks::Landmark;

    /// Two tracks sharing `shared` keys at a constant frame offset, plus
    /// per-track noise keys nothing else holds.
    fn index_with_offset_pair(shared: usize, offset: u32) -> Index {
        let config = FingerprintConfig::default();
        let mut index = Index::new(&config);
        let a = index.begin_track("a.mp3").unwrap();
        let b = index.begin_track("b.mp3").unwrap();

        for k in 0..shared as u32 {
            index.append(a, &[Landmark { key: k, time: k + offset }]);
            index.append(b, &[Landmark { key: k, time: k }]);
        }
        // Unshared noise
        for k in 0..10u32 {
            index.append(a, &[Landmark { key: 1000 + k, time: k }]);
            index.append(b, &[Landmark { key: 2000 + k, time: k }]);
        }
        index
    }

    #[test]
    fn test_consistent_offset_pair_is_found() {
        let index = index_with_offset_pair(30, 5);
        let results = find_duplicates(&index, &MatchConfig::default());

        assert_eq!(results.len(), 1);
        let pair = &results[0];
        assert_eq!((pair.track_a, pair.track_b), (0, 1));
        assert_eq!(pair.best_offset, 5);
        assert_eq!(pair.best_count, 30);
        assert_eq!(pair.total_pairs, 30);
        assert!((pair.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pair_is_emitted_once_in_canonical_order() {
        let index = index_with_offset_pair(20, 3);
        let results = find_duplicates(&index, &MatchConfig::default());

        assert_eq!(results.len(), 1);
        assert!(results[0].track_a < results[0].track_b);
    }

    #[test]
    fn test_thresholds_are_monotone() {
        let index = index_with_offset_pair(12, 2);

        let loose = MatchConfig {
            min_matches: 6,
            ..MatchConfig::default()
        };
        let tight = MatchConfig {
            min_matches: 13,
            ..MatchConfig::default()
        };

        let loose_pairs = find_duplicates(&index, &loose).len();
        let tight_pairs = find_duplicates(&index, &tight).len();
        assert_eq!(loose_pairs, 1);
        assert_eq!(tight_pairs, 0, "raising min_matches may only remove pairs");

        let strict_ratio = MatchConfig {
            min_ratio: 1.1,
            ..MatchConfig::default()
        };
        assert!(find_duplicates(&index, &strict_ratio).is_empty());
    }

    #[test]
    fn test_stop_keys_are_ignored() {
        let config = FingerprintConfig {
            bucket_cap: 10_000,
            ..FingerprintConfig::default()
        };
        let mut index = Index::new(&config);
        let a = index.begin_track("a.mp3").unwrap();
        let b = index.begin_track("b.mp3").unwrap();

        // One enormous bucket where both tracks agree on offset 0: pure
        // stop-word behavior.
        for t in 0..400u32 {
            index.append(a, &[Landmark { key: 5, time: t }]);
            index.append(b, &[Landmark { key: 5, time: t }]);
        }

        let dropping = MatchConfig {
            drop_above: 500,
            ..MatchConfig::default()
        };
        assert!(
            find_duplicates(&index, &dropping).is_empty(),
            "a bucket over drop_above must not vote"
        );

        // Without the filter the pair surfaces, at a heavily diluted score.
        let keeping = MatchConfig {
            drop_above: 10_000,
            max_bucket: 10_000,
            min_ratio: 0.0,
            ..MatchConfig::default()
        };
        assert!(!find_duplicates(&index, &keeping).is_empty());
    }

    #[test]
    fn test_diffuse_offsets_score_low() {
        let config = FingerprintConfig::default();
        let mut index = Index::new(&config);
        let a = index.begin_track("a.mp3").unwrap();
        let b = index.begin_track("b.mp3").unwrap();

        // Shared keys but scattered offsets: many co-occurrences, no
        // consistent alignment.
        for k in 0..40u32 {
            index.append(a, &[Landmark { key: k, time: (k * 17) % 97 }]);
            index.append(b, &[Landmark { key: k, time: (k * 41) % 89 }]);
        }

        let config = MatchConfig {
            min_ratio: 0.5,
            ..MatchConfig::default()
        };
        assert!(
            find_duplicates(&index, &config).is_empty(),
            "diffuse offset histogram must not clear the ratio threshold"
        );
    }
}

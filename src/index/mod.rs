//! Inverted landmark index
//!
//! Maps each landmark key to a bucket of postings `(track_id, anchor_time)`
//! with a sidecar `meta` list of track names indexed by `track_id`. Buckets
//! are bounded by `bucket_cap`; overflow is dropped silently. Popular keys
//! add little signal and are the dominant cost.
//!
//! The in-memory bucket shape is always flat postings; the grouped
//! per-track delta lists of the finalized artifact exist only on disk and
//! are decoded back to flat postings at load.

pub mod persist;

use std::collections::HashMap;

use crate::config::{FingerprintConfig, IndexParams};
use crate::dsp::landmarks::Landmark;
use crate::error::EngineError;

/// One index entry: track id and anchor time in frame units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Dense track id
    pub track: u32,
    /// Anchor time in frame units
    pub time: u32,
}

/// In-memory inverted index
#[derive(Debug)]
pub struct Index {
    params: IndexParams,
    meta: Vec<String>,
    names: HashMap<String, u32>,
    buckets: HashMap<u32, Vec<Posting>>,
    bucket_cap: usize,
    finalized: bool,
    overflow_dropped: u64,
}

impl Index {
    /// Create an empty index for the given build configuration
    pub fn new(config: &FingerprintConfig) -> Self {
        Self {
            params: config.index_params(),
            meta: Vec::new(),
            names: HashMap::new(),
            buckets: HashMap::new(),
            bucket_cap: config.bucket_cap,
            finalized: false,
            overflow_dropped: 0,
        }
    }

    /// Parameters this index was built with
    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    /// Track names, indexed by track id
    pub fn meta(&self) -> &[String] {
        &self.meta
    }

    /// Name of one track
    pub fn name(&self, track: u32) -> Option<&str> {
        self.meta.get(track as usize).map(|s| s.as_str())
    }

    /// Whether a track name is already indexed
    pub fn contains_track(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Number of indexed tracks
    pub fn track_count(&self) -> usize {
        self.meta.len()
    }

    /// Number of distinct landmark keys
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total postings across all buckets
    pub fn posting_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Assign the next dense track id to `name`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidInput` when the name is already indexed;
    /// names are unique within one index.
    pub fn begin_track(&mut self, name: &str) -> Result<u32, EngineError> {
        if self.names.contains_key(name) {
            return Err(EngineError::InvalidInput(format!(
                "track {:?} is already indexed",
                name
            )));
        }
        let id = self.meta.len() as u32;
        self.meta.push(name.to_string());
        self.names.insert(name.to_string(), id);
        log::debug!("Track {} -> id {}", name, id);
        Ok(id)
    }

    /// Append a track's landmarks to their buckets
    ///
    /// Postings past `bucket_cap` are dropped silently; the drop is policy,
    /// not an error.
    pub fn append(&mut self, track: u32, landmarks: &[Landmark]) {
        for landmark in landmarks {
            let bucket = self.buckets.entry(landmark.key).or_default();
            if bucket.len() < self.bucket_cap {
                bucket.push(Posting {
                    track,
                    time: landmark.time,
                });
            } else {
                self.overflow_dropped += 1;
            }
        }
        self.finalized = false;
    }

    /// Landmarks dropped so far by the bucket cap
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    /// Whether `finalize` has run since the last mutation
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Regroup every bucket by track with times ascending
    ///
    /// After finalization the persisted artifact uses grouped per-track
    /// delta lists; the in-memory shape stays flat.
    pub fn finalize(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.sort_by(|a, b| a.track.cmp(&b.track).then_with(|| a.time.cmp(&b.time)));
        }
        self.finalized = true;
        log::debug!(
            "Finalized index: {} tracks, {} keys, {} postings",
            self.track_count(),
            self.key_count(),
            self.posting_count()
        );
    }

    /// Look up the bucket for one key
    pub fn bucket(&self, key: u32) -> Option<&[Posting]> {
        self.buckets.get(&key).map(Vec::as_slice)
    }

    /// Iterate all `(key, bucket)` entries
    pub fn iter_buckets(&self) -> impl Iterator<Item = (u32, &[Posting])> {
        self.buckets.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Bucket sizes, for stats reporting
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.values().map(Vec::len).collect()
    }

    pub(crate) fn from_parts(
        params: IndexParams,
        meta: Vec<String>,
        buckets: HashMap<u32, Vec<Posting>>,
        bucket_cap: usize,
        finalized: bool,
    ) -> Result<Self, EngineError> {
        let mut names = HashMap::with_capacity(meta.len());
        for (id, name) in meta.iter().enumerate() {
            if names.insert(name.clone(), id as u32).is_some() {
                return Err(EngineError::IndexUnreadable(format!(
                    "duplicate track name {:?} in meta",
                    name
                )));
            }
        }
        Ok(Self {
            params,
            meta,
            names,
            buckets,
            bucket_cap,
            finalized,
            overflow_dropped: 0,
        })
    }

    pub(crate) fn buckets_map(&self) -> &HashMap<u32, Vec<Posting>> {
        &self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::landmarks::Landmark;

    fn landmark(key: u32, time: u32) -> Landmark {
        Landmark { key, time }
    }

    fn small_index(bucket_cap: usize) -> Index {
        let config = FingerprintConfig {
            bucket_cap,
            ..FingerprintConfig::default()
        };
        Index::new(&config)
    }

    #[test]
    fn test_track_ids_are_dense() {
        let mut index = small_index(8);
        assert_eq!(index.begin_track("a.mp3").unwrap(), 0);
        assert_eq!(index.begin_track("b.mp3").unwrap(), 1);
        assert_eq!(index.begin_track("c.mp3").unwrap(), 2);
        assert_eq!(index.name(1), Some("b.mp3"));
    }

    #[test]
    fn test_duplicate_track_name_rejected() {
        let mut index = small_index(8);
        index.begin_track("a.mp3").unwrap();
        assert!(index.begin_track("a.mp3").is_err());
        assert_eq!(index.track_count(), 1);
    }

    #[test]
    fn test_bucket_cap_discipline() {
        let mut index = small_index(3);
        let id = index.begin_track("a.mp3").unwrap();
        let landmarks: Vec<Landmark> = (0..10).map(|t| landmark(42, t)).collect();
        index.append(id, &landmarks);

        assert_eq!(index.bucket(42).unwrap().len(), 3);
        assert_eq!(index.overflow_dropped(), 7);
    }

    #[test]
    fn test_raising_cap_is_monotone_in_postings() {
        let landmarks: Vec<Landmark> = (0..50).map(|t| landmark(7, t)).collect();

        let mut counts = Vec::new();
        for cap in [4, 16, 64] {
            let mut index = small_index(cap);
            let id = index.begin_track("a.mp3").unwrap();
            index.append(id, &landmarks);
            counts.push(index.posting_count());
        }

        assert!(
            counts.windows(2).all(|w| w[0] <= w[1]),
            "total postings must be non-decreasing in the cap: {:?}",
            counts
        );
    }

    #[test]
    fn test_finalize_groups_and_sorts() {
        let mut index = small_index(100);
        let a = index.begin_track("a.mp3").unwrap();
        let b = index.begin_track("b.mp3").unwrap();
        index.append(b, &[landmark(9, 30), landmark(9, 10)]);
        index.append(a, &[landmark(9, 20), landmark(9, 5)]);

        index.finalize();

        let bucket = index.bucket(9).unwrap();
        let expected = [
            Posting { track: 0, time: 5 },
            Posting { track: 0, time: 20 },
            Posting { track: 1, time: 10 },
            Posting { track: 1, time: 30 },
        ];
        assert_eq!(bucket, expected);
        assert!(index.is_finalized());
    }

    #[test]
    fn test_append_clears_finalized() {
        let mut index = small_index(100);
        let a = index.begin_track("a.mp3").unwrap();
        index.append(a, &[landmark(1, 1)]);
        index.finalize();
        index.append(a, &[landmark(1, 2)]);
        assert!(!index.is_finalized());
    }
}

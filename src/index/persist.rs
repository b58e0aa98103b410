//! Index persistence
//!
//! The artifact is a JSON document `{params, meta, index}` where each
//! bucket is either a flat list of `[track, time]` pairs (checkpoints) or a
//! list of `[track, [t0, dt1, ...]]` per-track delta groups (after
//! finalization). Documents larger than the shard cap are split into
//! numbered sibling parts, each self-contained except that all parts carry
//! the same `meta` and `params`; the artifact path then holds a small
//! manifest naming the live parts.
//!
//! Writes go to a uniquely named temporary sibling that is renamed into
//! place, so readers always see either the previous artifact or the new
//! one, never a torn file. Part files alternate between two generation
//! namespaces (`<stem>.a.<k>.json` / `<stem>.b.<k>.json`), a new save never
//! overwrites a live part, and readers open only the parts the manifest
//! names. The manifest rename is the single commit point: a crash anywhere
//! in a save leaves the previous artifact fully intact, and any
//! already-written files of the next generation are unreferenced strays
//! that the following save sweeps up.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{FingerprintConfig, IndexParams};
use crate::error::EngineError;
use crate::index::{Index, Posting};

/// Default cap on one serialized document part
pub const DEFAULT_MAX_SHARD_BYTES: usize = 64 * 1024 * 1024;

/// Part-file namespaces a save alternates between
const GENERATIONS: [&str; 2] = ["a", "b"];

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    params: IndexParams,
    meta: Vec<String>,
    index: HashMap<u32, Vec<BucketEntry>>,
}

/// Manifest committed at the artifact path when the index is sharded
///
/// Unknown fields are denied so a full document is rejected on its first
/// field instead of being scanned to the end.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShardManifest {
    generation: String,
    shards: Vec<String>,
}

/// Either form the artifact path can hold
#[derive(Debug)]
enum ArtifactFile {
    Document(IndexDocument),
    Manifest(ShardManifest),
}

/// On-disk bucket entry, in either of the two persisted shapes
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BucketEntry {
    /// `[track, time]`: raw checkpoint shape
    Flat(u32, u32),
    /// `[track, [t0, dt1, dt2, ...]]`: finalized per-track delta list
    Grouped(u32, Vec<u32>),
}

/// Load an index artifact, following its shard manifest when present
///
/// # Errors
///
/// * `IndexUnreadable` - no artifact found, a manifest-listed part is
///   missing, or the document structure is invalid (duplicate names, meta
///   disagreement between parts).
/// * `IndexTruncated` - an artifact file exists but does not parse.
pub fn load(path: &Path, bucket_cap: usize) -> Result<Index, EngineError> {
    let documents = match read_artifact(path)? {
        ArtifactFile::Document(document) => vec![document],
        ArtifactFile::Manifest(manifest) => {
            let mut documents = Vec::with_capacity(manifest.shards.len());
            for shard in &manifest.shards {
                documents.push(read_document(&path.with_file_name(shard))?);
            }
            documents
        }
    };

    merge_documents(path, documents, bucket_cap)
}

/// Load whatever parses, for resumable builds
///
/// Unreadable files are logged and skipped; the merged result holds every
/// track from the readable parts of the artifact.
pub fn load_lenient(path: &Path, bucket_cap: usize) -> Result<Index, EngineError> {
    let documents = match read_artifact(path) {
        Ok(ArtifactFile::Document(document)) => vec![document],
        Ok(ArtifactFile::Manifest(manifest)) => {
            let mut documents = Vec::with_capacity(manifest.shards.len());
            for shard in &manifest.shards {
                let part = path.with_file_name(shard);
                match read_document(&part) {
                    Ok(document) => documents.push(document),
                    Err(e) => log::warn!("Skipping unreadable index part {:?}: {}", part, e),
                }
            }
            documents
        }
        Err(e) => {
            if path.exists() {
                log::warn!("Skipping unreadable index file {:?}: {}", path, e);
            }
            Vec::new()
        }
    };

    merge_documents(path, documents, bucket_cap)
}

/// Open an index for building: resume when an artifact exists, start empty
/// otherwise
///
/// # Errors
///
/// Returns `BadParams` when an existing artifact was built on a different
/// analysis grid; resuming would mix incompatible landmark streams.
pub fn open_or_create(path: &Path, config: &FingerprintConfig) -> Result<Index, EngineError> {
    match load_lenient(path, config.bucket_cap) {
        Ok(index) => {
            index.params().check(config)?;
            log::info!(
                "Resuming index {:?}: {} tracks, {} keys",
                path,
                index.track_count(),
                index.key_count()
            );
            Ok(index)
        }
        Err(EngineError::IndexUnreadable(_)) => {
            log::debug!("No readable index at {:?}, starting empty", path);
            Ok(Index::new(config))
        }
        Err(e) => Err(e),
    }
}

/// Persist the index atomically, sharding above the default size cap
pub fn save(index: &Index, path: &Path) -> Result<(), EngineError> {
    save_with_shard_cap(index, path, DEFAULT_MAX_SHARD_BYTES)
}

/// Persist the index atomically with an explicit shard size cap
pub fn save_with_shard_cap(
    index: &Index,
    path: &Path,
    max_shard_bytes: usize,
) -> Result<(), EngineError> {
    let params = index.params().clone();
    let meta: Vec<String> = index.meta().to_vec();

    // Greedily pack buckets into parts bounded by the byte cap. The size
    // estimate is the serialized entry list plus the key and separators.
    let base_bytes = serde_json::to_string(&params)
        .map_err(|e| EngineError::WriteFailed(e.to_string()))?
        .len()
        + serde_json::to_string(&meta)
            .map_err(|e| EngineError::WriteFailed(e.to_string()))?
            .len()
        + 64;

    let mut keys: Vec<u32> = index.buckets_map().keys().copied().collect();
    keys.sort_unstable();

    let mut parts: Vec<HashMap<u32, Vec<BucketEntry>>> = Vec::new();
    let mut current: HashMap<u32, Vec<BucketEntry>> = HashMap::new();
    let mut current_bytes = base_bytes;

    for key in keys {
        let entries = encode_bucket(&index.buckets_map()[&key], index.is_finalized());
        let entry_bytes = serde_json::to_string(&entries)
            .map_err(|e| EngineError::WriteFailed(e.to_string()))?
            .len()
            + 16;

        if !current.is_empty() && current_bytes + entry_bytes > max_shard_bytes {
            parts.push(std::mem::take(&mut current));
            current_bytes = base_bytes;
        }
        current_bytes += entry_bytes;
        current.insert(key, entries);
    }
    parts.push(current);

    if parts.len() == 1 {
        let document = IndexDocument {
            params,
            meta,
            index: parts.pop().unwrap_or_default(),
        };
        write_json_atomic(&document, path)?;
        for generation in GENERATIONS {
            sweep_parts(path, generation, 0);
        }
    } else {
        // Strays of the target generation can only be leftovers of a save
        // that never committed; the live parts sit in the other namespace.
        let generation = next_generation(path);
        let n = parts.len();
        let mut shards = Vec::with_capacity(n);
        for (k, index_part) in parts.into_iter().enumerate() {
            let document = IndexDocument {
                params: params.clone(),
                meta: meta.clone(),
                index: index_part,
            };
            let shard = part_name(path, generation, k);
            write_json_atomic(&document, &path.with_file_name(&shard))?;
            shards.push(shard);
        }

        // Commit point: until this rename lands, readers still see the
        // previous artifact in full.
        let manifest = ShardManifest {
            generation: generation.to_string(),
            shards,
        };
        write_json_atomic(&manifest, path)?;

        let other = GENERATIONS[usize::from(generation == GENERATIONS[0])];
        sweep_parts(path, other, 0);
        sweep_parts(path, generation, n);
        log::info!("Index written as {} parts at {:?}", n, path);
    }

    Ok(())
}

fn encode_bucket(postings: &[Posting], finalized: bool) -> Vec<BucketEntry> {
    if !finalized {
        return postings
            .iter()
            .map(|p| BucketEntry::Flat(p.track, p.time))
            .collect();
    }

    // finalize() sorted by (track, time); emit one delta group per track
    let mut entries: Vec<BucketEntry> = Vec::new();
    let mut i = 0;
    while i < postings.len() {
        let track = postings[i].track;
        let mut times = Vec::new();
        let mut prev = 0u32;
        while i < postings.len() && postings[i].track == track {
            let t = postings[i].time;
            times.push(if times.is_empty() { t } else { t - prev });
            prev = t;
            i += 1;
        }
        entries.push(BucketEntry::Grouped(track, times));
    }
    entries
}

fn decode_bucket(entries: Vec<BucketEntry>) -> (Vec<Posting>, bool) {
    let mut postings = Vec::new();
    let mut all_grouped = !entries.is_empty();

    for entry in entries {
        match entry {
            BucketEntry::Flat(track, time) => {
                all_grouped = false;
                postings.push(Posting { track, time });
            }
            BucketEntry::Grouped(track, deltas) => {
                let mut t = 0u32;
                for (i, d) in deltas.into_iter().enumerate() {
                    t = if i == 0 { d } else { t.wrapping_add(d) };
                    postings.push(Posting { track, time: t });
                }
            }
        }
    }

    (postings, all_grouped)
}

fn merge_documents(
    path: &Path,
    documents: Vec<IndexDocument>,
    bucket_cap: usize,
) -> Result<Index, EngineError> {
    let mut documents = documents.into_iter();
    let first = match documents.next() {
        Some(doc) => doc,
        None => {
            return Err(EngineError::IndexUnreadable(format!(
                "no index artifact at {:?}",
                path
            )))
        }
    };

    let params = first.params;
    let meta = first.meta;
    let mut buckets: HashMap<u32, Vec<Posting>> = HashMap::new();
    let mut finalized = true;

    let mut absorb = |index: HashMap<u32, Vec<BucketEntry>>, finalized: &mut bool| {
        for (key, entries) in index {
            let (postings, grouped) = decode_bucket(entries);
            *finalized &= grouped;
            buckets.entry(key).or_default().extend(postings);
        }
    };
    absorb(first.index, &mut finalized);

    for document in documents {
        if document.meta != meta {
            return Err(EngineError::IndexUnreadable(
                "index parts disagree on track meta".to_string(),
            ));
        }
        if document.params != params {
            return Err(EngineError::IndexUnreadable(
                "index parts disagree on build parameters".to_string(),
            ));
        }
        absorb(document.index, &mut finalized);
    }
    drop(absorb);

    let finalized = finalized && !buckets.is_empty();
    Index::from_parts(params, meta, buckets, bucket_cap, finalized)
}

fn read_artifact(path: &Path) -> Result<ArtifactFile, EngineError> {
    let bytes = fs::read(path)
        .map_err(|e| EngineError::IndexUnreadable(format!("{:?}: {}", path, e)))?;
    if let Ok(manifest) = serde_json::from_slice::<ShardManifest>(&bytes) {
        return Ok(ArtifactFile::Manifest(manifest));
    }
    serde_json::from_slice::<IndexDocument>(&bytes)
        .map(ArtifactFile::Document)
        .map_err(|e| EngineError::IndexTruncated(format!("{:?}: {}", path, e)))
}

fn read_document(path: &Path) -> Result<IndexDocument, EngineError> {
    let bytes = fs::read(path)
        .map_err(|e| EngineError::IndexUnreadable(format!("{:?}: {}", path, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::IndexTruncated(format!("{:?}: {}", path, e)))
}

/// Counter making temporary sibling names unique within the process
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec(value).map_err(|e| EngineError::WriteFailed(e.to_string()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("index.json");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(EngineError::WriteFailed(format!("{:?}: {}", tmp, e)));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(EngineError::WriteFailed(format!(
            "rename {:?} -> {:?}: {}",
            tmp, path, e
        )));
    }

    log::debug!("Wrote {} bytes to {:?}", bytes.len(), path);
    Ok(())
}

/// File name of shard `k` in the given generation namespace
fn part_name(path: &Path, generation: &str, k: usize) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("index");
    format!("{}.{}.{}.json", stem, generation, k)
}

fn part_path(path: &Path, generation: &str, k: usize) -> PathBuf {
    path.with_file_name(part_name(path, generation, k))
}

/// Generation namespace the live manifest occupies, if any
fn live_generation(path: &Path) -> Option<String> {
    match read_artifact(path) {
        Ok(ArtifactFile::Manifest(manifest)) => Some(manifest.generation),
        _ => None,
    }
}

fn next_generation(path: &Path) -> &'static str {
    match live_generation(path) {
        Some(live) if live == GENERATIONS[0] => GENERATIONS[1],
        _ => GENERATIONS[0],
    }
}

/// Best-effort removal of consecutive part files `from..` of one generation
fn sweep_parts(path: &Path, generation: &str, from: usize) {
    for k in from.. {
        let part = part_path(path, generation, k);
        if !part.exists() {
            break;
        }
        let _ = fs::remove_file(&part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::landmarks::Landmark;

    fn sample_index() -> Index {
        let config = FingerprintConfig::default();
        let mut index = Index::new(&config);
        let a = index.begin_track("a.mp3").unwrap();
        let b = index.begin_track("b.mp3").unwrap();
        index.append(
            a,
            &[
                Landmark { key: 10, time: 4 },
                Landmark { key: 10, time: 9 },
                Landmark { key: 77, time: 1 },
            ],
        );
        index.append(b, &[Landmark { key: 10, time: 6 }]);
        index
    }

    fn postings_sorted(index: &Index, key: u32) -> Vec<Posting> {
        let mut postings = index.bucket(key).unwrap().to_vec();
        postings.sort_by_key(|p| (p.track, p.time));
        postings
    }

    #[test]
    fn test_raw_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        save(&index, &path).unwrap();
        let loaded = load(&path, 250).unwrap();

        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(loaded.params(), index.params());
        assert!(!loaded.is_finalized());
        assert_eq!(postings_sorted(&loaded, 10), postings_sorted(&index, 10));
        assert_eq!(postings_sorted(&loaded, 77), postings_sorted(&index, 77));
    }

    #[test]
    fn test_finalized_round_trip_decodes_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = sample_index();
        index.finalize();
        save(&index, &path).unwrap();
        let loaded = load(&path, 250).unwrap();

        assert!(loaded.is_finalized());
        assert_eq!(postings_sorted(&loaded, 10), postings_sorted(&index, 10));
    }

    #[test]
    fn test_sharded_save_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        // A tiny cap forces one bucket per part.
        save_with_shard_cap(&index, &path, 1).unwrap();

        assert!(path.exists(), "the manifest lives at the artifact path");
        assert!(part_path(&path, "a", 0).exists());
        assert!(part_path(&path, "a", 1).exists());

        let loaded = load(&path, 250).unwrap();
        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(postings_sorted(&loaded, 10), postings_sorted(&index, 10));
        assert_eq!(postings_sorted(&loaded, 77), postings_sorted(&index, 77));
    }

    #[test]
    fn test_resharding_alternates_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        save_with_shard_cap(&index, &path, 1).unwrap();
        assert!(part_path(&path, "a", 0).exists());

        save_with_shard_cap(&index, &path, 1).unwrap();
        assert!(part_path(&path, "b", 0).exists());
        assert!(
            !part_path(&path, "a", 0).exists(),
            "committing the next generation sweeps the previous one"
        );

        let loaded = load(&path, 250).unwrap();
        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(postings_sorted(&loaded, 10), postings_sorted(&index, 10));
    }

    #[test]
    fn test_single_save_removes_stale_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        save_with_shard_cap(&index, &path, 1).unwrap();
        assert!(part_path(&path, "a", 0).exists());

        save(&index, &path).unwrap();
        assert!(path.exists());
        assert!(!part_path(&path, "a", 0).exists(), "stale shard parts must go");
        let loaded = load(&path, 250).unwrap();
        assert_eq!(loaded.meta(), index.meta());
    }

    #[test]
    fn test_interrupted_reshard_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        save(&index, &path).unwrap();

        // A save that grew past the cap but died before committing its
        // manifest leaves next-generation parts with a longer meta behind.
        let config = FingerprintConfig::default();
        let mut grown = Index::new(&config);
        grown.begin_track("a.mp3").unwrap();
        grown.begin_track("b.mp3").unwrap();
        grown.begin_track("c.mp3").unwrap();
        grown.append(2, &[Landmark { key: 5, time: 3 }]);
        save(&grown, &part_path(&path, "a", 0)).unwrap();

        // Readers must resolve to the committed artifact, not the stray.
        let loaded = load(&path, 250).unwrap();
        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(loaded.track_count(), 2);

        let resumed = open_or_create(&path, &config).unwrap();
        assert_eq!(resumed.track_count(), 2, "resume must keep prior progress");
        assert!(resumed.contains_track("a.mp3"));
        assert!(!resumed.contains_track("c.mp3"));
    }

    #[test]
    fn test_missing_artifact_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(
            load(&path, 250),
            Err(EngineError::IndexUnreadable(_))
        ));
    }

    #[test]
    fn test_garbage_artifact_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, b"{\"params\": {\"version\": 1").unwrap();

        assert!(matches!(
            load(&path, 250),
            Err(EngineError::IndexTruncated(_))
        ));
    }

    #[test]
    fn test_open_or_create_starts_empty_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, b"not json").unwrap();

        let config = FingerprintConfig::default();
        let index = open_or_create(&path, &config).unwrap();
        assert_eq!(index.track_count(), 0);
    }

    #[test]
    fn test_open_or_create_rejects_grid_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = sample_index();
        save(&index, &path).unwrap();

        let other = FingerprintConfig {
            hop: 1024,
            ..FingerprintConfig::default()
        };
        assert!(matches!(
            open_or_create(&path, &other),
            Err(EngineError::BadParams(_))
        ));
    }

    #[test]
    fn test_open_or_create_resumes_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let config = FingerprintConfig::default();
        save(&sample_index(), &path).unwrap();

        let resumed = open_or_create(&path, &config).unwrap();
        assert!(resumed.contains_track("a.mp3"));
        assert!(resumed.contains_track("b.mp3"));
        assert_eq!(resumed.track_count(), 2);
    }
}

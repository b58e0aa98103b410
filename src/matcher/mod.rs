//! Alignment matching over the inverted index
//!
//! Both matchers reduce hash co-occurrences to per-pair or per-track
//! offset histograms. On a true match the surviving shared landmarks fall
//! on one constant frame offset, so the histogram is sharply peaked;
//! unrelated tracks vote on diffuse offsets. Neither matcher mutates the
//! index.

pub mod duplicates;
pub mod query;

pub use duplicates::{find_duplicates, DuplicatePair};
pub use query::{query, QueryMatch};

//! Dataset loading, grid-target encoding, and Burn-compatible batching.
//!
//! This crate provides:
//! - Indexing and loading of JSON-labelled detection datasets
//! - Encoding of per-image annotation lists into dense S×S grid targets
//! - Seeded train/val splitting
//! - Batch iteration with a prefetching decode pool

pub mod batch;
pub mod encode;
pub mod index;
pub mod types;

pub use batch::{BatchIter, GridBatch};
pub use encode::{encode_target, EncodingError, GridSpec};
pub use index::{index_labels, load_class_list, load_sample, split_indices};
pub use types::{DatasetResult, DatasetSample, GridDatasetError, LoaderConfig, SampleIndex};

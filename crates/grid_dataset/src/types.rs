//! Core types and error definitions for grid_dataset.

use crate::encode::EncodingError;
use data_contracts::Annotation;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, GridDatasetError>;

#[derive(Debug, Error)]
pub enum GridDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("label validation failed at {path}: {source}")]
    Label {
        path: PathBuf,
        #[source]
        source: data_contracts::ValidationError,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("target encoding failed at {path}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: EncodingError,
    },
    #[error("{0}")]
    Other(String),
}

/// Location of one sample: the dataset root plus its label file.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    pub root: PathBuf,
    pub label_path: PathBuf,
}

/// One decoded sample ready for batching.
#[derive(Debug, Clone)]
pub struct DatasetSample {
    /// Image in CHW layout, normalized to [0, 1].
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<Annotation>,
}

/// Batching and prefetch configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Resize all images to this (width, height) at load time.
    pub target_size: (u32, u32),
    pub batch_size: usize,
    /// Shuffle sample order before iteration.
    pub shuffle: bool,
    /// Seed for reproducible shuffling.
    pub seed: Option<u64>,
    /// Decode pool size.
    pub workers: usize,
    /// Bounded prefetch queue depth (batches).
    pub prefetch: usize,
    /// Skip frames with no annotations.
    pub skip_empty_labels: bool,
    /// Drop the last partial batch.
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            target_size: (448, 448),
            batch_size: 16,
            shuffle: true,
            seed: None,
            workers: 4,
            prefetch: 2,
            skip_empty_labels: false,
            drop_last: false,
        }
    }
}

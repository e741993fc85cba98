//! Indexing and loading of JSON-labelled detection datasets.
//!
//! Layout on disk: a dataset root containing a `labels/` directory of
//! per-image JSON files ([`ImageLabel`]) whose `image` field is a path
//! relative to the root, plus a class file with one name per line.

use crate::types::{DatasetResult, DatasetSample, GridDatasetError, SampleIndex};
use data_contracts::{ClassList, ImageLabel};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// Scan `root/labels` and index all label files, sorted for determinism.
pub fn index_labels(root: &Path) -> DatasetResult<Vec<SampleIndex>> {
    let labels_dir = root.join("labels");
    let entries = fs::read_dir(&labels_dir).map_err(|e| GridDatasetError::Io {
        path: labels_dir.clone(),
        source: e,
    })?;
    let mut indices = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let label_path = entry.path();
        if label_path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        indices.push(SampleIndex {
            root: root.to_path_buf(),
            label_path,
        });
    }
    indices.sort_by(|a, b| a.label_path.cmp(&b.label_path));
    Ok(indices)
}

/// Load and validate the class file (one name per line).
pub fn load_class_list(path: &Path) -> DatasetResult<ClassList> {
    let raw = fs::read_to_string(path).map_err(|e| GridDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    ClassList::parse(&raw).map_err(|e| GridDatasetError::Label {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Seeded split into (train, val) index lists.
pub fn split_indices(
    mut indices: Vec<SampleIndex>,
    val_ratio: f32,
    seed: Option<u64>,
) -> (Vec<SampleIndex>, Vec<SampleIndex>) {
    let mut rng = match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
    };
    indices.shuffle(&mut rng);
    let val_count =
        ((val_ratio.clamp(0.0, 1.0) * indices.len() as f32).round() as usize).min(indices.len());
    let val = indices.split_off(indices.len() - val_count);
    (indices, val)
}

/// Load one sample: parse the label, validate it, decode the image, and
/// resize to `target_size` in CHW float layout.
pub fn load_sample(idx: &SampleIndex, target_size: (u32, u32)) -> DatasetResult<DatasetSample> {
    let raw = fs::read(&idx.label_path).map_err(|e| GridDatasetError::Io {
        path: idx.label_path.clone(),
        source: e,
    })?;
    let label: ImageLabel = serde_json::from_slice(&raw).map_err(|e| GridDatasetError::Json {
        path: idx.label_path.clone(),
        source: e,
    })?;
    label.validate().map_err(|e| GridDatasetError::Label {
        path: idx.label_path.clone(),
        source: e,
    })?;

    let image_path: PathBuf = idx.root.join(&label.image);
    let img = image::open(&image_path)
        .map_err(|e| GridDatasetError::Image {
            path: image_path.clone(),
            source: e,
        })?
        .to_rgb8();

    let (tw, th) = target_size;
    let img = if img.dimensions() == (tw, th) {
        img
    } else {
        // Stretch resize; annotation coordinates are already normalized
        // so they survive the distortion unchanged.
        image::imageops::resize(&img, tw, th, FilterType::Triangle)
    };

    let num_pixels = (tw * th) as usize;
    let mut image_chw = Vec::with_capacity(3 * num_pixels);
    for c in 0..3 {
        for y in 0..th {
            for x in 0..tw {
                image_chw.push(img.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }

    Ok(DatasetSample {
        image_chw,
        width: tw,
        height: th,
        objects: label.objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_labels_dir_is_io_error() {
        let err = index_labels(Path::new("/nonexistent/dataset")).unwrap_err();
        assert!(matches!(err, GridDatasetError::Io { .. }));
    }

    #[test]
    fn split_is_deterministic_under_seed() {
        let indices: Vec<SampleIndex> = (0..10)
            .map(|i| SampleIndex {
                root: PathBuf::from("."),
                label_path: PathBuf::from(format!("labels/{i:04}.json")),
            })
            .collect();
        let (train_a, val_a) = split_indices(indices.clone(), 0.3, Some(7));
        let (train_b, val_b) = split_indices(indices, 0.3, Some(7));
        assert_eq!(val_a.len(), 3);
        assert_eq!(train_a.len(), 7);
        let paths = |v: &[SampleIndex]| v.iter().map(|i| i.label_path.clone()).collect::<Vec<_>>();
        assert_eq!(paths(&train_a), paths(&train_b));
        assert_eq!(paths(&val_a), paths(&val_b));
    }
}

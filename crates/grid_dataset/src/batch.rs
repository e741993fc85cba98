//! Batch iteration with a prefetching decode pool.
//!
//! A producer thread decodes and grid-encodes samples through a rayon
//! pool of configurable size, then pushes assembled host-side batches
//! into a bounded channel. The consumer blocks on an empty queue and the
//! producer blocks on a full one, so backpressure needs no extra
//! machinery. Tensors are only materialized on the consumer side, one
//! batch at a time.

use crate::encode::{encode_target, GridSpec};
use crate::index::load_sample;
use crate::types::{DatasetResult, GridDatasetError, LoaderConfig, SampleIndex};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// One batch on the device: images `[N, 3, H, W]`, targets `[N, S, S, 5B+C]`.
#[derive(Debug)]
pub struct GridBatch<B: burn::tensor::backend::Backend> {
    pub images: burn::tensor::Tensor<B, 4>,
    pub targets: burn::tensor::Tensor<B, 4>,
    pub len: usize,
}

struct HostBatch {
    images: Vec<f32>,
    targets: Vec<f32>,
    len: usize,
    width: u32,
    height: u32,
    /// Samples skipped as empty since the previous batch was sent.
    skipped_empty: usize,
}

enum ProducerMsg {
    Batch(HostBatch),
    /// End of the pass, carrying skips after the last sent batch.
    End { skipped_empty: usize },
}

pub struct BatchIter {
    rx: Receiver<DatasetResult<ProducerMsg>>,
    spec: GridSpec,
    ended: bool,
    processed_samples: usize,
    processed_batches: usize,
    skipped_empty: usize,
    started: Instant,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
}

impl BatchIter {
    /// Spawn the producer over `indices` and return the consuming end.
    pub fn spawn(indices: Vec<SampleIndex>, spec: GridSpec, cfg: LoaderConfig) -> Self {
        let (tx, rx) = bounded(cfg.prefetch.max(1));
        let producer_spec = spec;
        thread::spawn(move || {
            let pool = match rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.workers.max(1))
                .build()
            {
                Ok(pool) => pool,
                Err(e) => {
                    let _ = tx.send(Err(GridDatasetError::Other(format!(
                        "failed to build decode pool: {e}"
                    ))));
                    return;
                }
            };

            let mut indices = indices;
            if cfg.shuffle {
                let mut rng = match cfg.seed {
                    Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
                    None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
                };
                indices.shuffle(&mut rng);
            }

            let batch_size = cfg.batch_size.max(1);
            let mut pending_skipped = 0usize;
            for chunk in indices.chunks(batch_size) {
                if cfg.drop_last && chunk.len() < batch_size {
                    break;
                }
                let decoded: DatasetResult<Vec<_>> = pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|idx| {
                            let sample = load_sample(idx, cfg.target_size)?;
                            let target =
                                encode_target(&producer_spec, &sample.objects).map_err(|e| {
                                    GridDatasetError::Encoding {
                                        path: idx.label_path.clone(),
                                        source: e,
                                    }
                                })?;
                            Ok((sample, target))
                        })
                        .collect()
                });
                let decoded = match decoded {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                let kept: Vec<_> = decoded
                    .into_iter()
                    .filter(|(sample, _)| {
                        if cfg.skip_empty_labels && sample.objects.is_empty() {
                            pending_skipped += 1;
                            false
                        } else {
                            true
                        }
                    })
                    .collect();
                // A fully filtered chunk sends nothing; its skip count
                // rides along with the next batch (or the end marker).
                if kept.is_empty() {
                    continue;
                }

                let (width, height) = (kept[0].0.width, kept[0].0.height);
                let len = kept.len();
                let mut images = Vec::with_capacity(len * kept[0].0.image_chw.len());
                let mut targets = Vec::with_capacity(len * producer_spec.len());
                for (sample, target) in kept {
                    images.extend_from_slice(&sample.image_chw);
                    targets.extend_from_slice(&target);
                }

                let skipped_empty = std::mem::take(&mut pending_skipped);
                if tx
                    .send(Ok(ProducerMsg::Batch(HostBatch {
                        images,
                        targets,
                        len,
                        width,
                        height,
                        skipped_empty,
                    })))
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(Ok(ProducerMsg::End {
                skipped_empty: pending_skipped,
            }));
        });

        let now = Instant::now();
        let log_every_samples = match std::env::var("GRID_DATASET_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };

        Self {
            rx,
            spec,
            ended: false,
            processed_samples: 0,
            processed_batches: 0,
            skipped_empty: 0,
            started: now,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples,
        }
    }

    /// Blocking receive of the next batch; `Ok(None)` at end of pass.
    pub fn next_batch<B: burn::tensor::backend::Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<GridBatch<B>>> {
        if self.ended {
            return Ok(None);
        }
        let msg = self.rx.recv().map_err(|_| {
            GridDatasetError::Other("prefetch producer stopped unexpectedly".to_string())
        })?;
        let batch = match msg {
            Ok(ProducerMsg::Batch(batch)) => batch,
            Ok(ProducerMsg::End { skipped_empty }) => {
                self.skipped_empty += skipped_empty;
                self.ended = true;
                return Ok(None);
            }
            Err(e) => {
                self.ended = true;
                return Err(e);
            }
        };

        let image_shape = [
            batch.len,
            3,
            batch.height as usize,
            batch.width as usize,
        ];
        let target_shape = [batch.len, self.spec.s, self.spec.s, self.spec.depth()];
        let images = burn::tensor::Tensor::<B, 1>::from_floats(batch.images.as_slice(), device)
            .reshape(image_shape);
        let targets = burn::tensor::Tensor::<B, 1>::from_floats(batch.targets.as_slice(), device)
            .reshape(target_shape);

        self.processed_samples += batch.len;
        self.processed_batches += 1;
        self.skipped_empty += batch.skipped_empty;
        self.maybe_log_progress();

        Ok(Some(GridBatch {
            images,
            targets,
            len: batch.len,
        }))
    }

    pub fn processed_samples(&self) -> usize {
        self.processed_samples
    }

    /// Samples dropped so far by `skip_empty_labels`, including those
    /// from chunks that produced no batch at all.
    pub fn skipped_empty(&self) -> usize {
        self.skipped_empty
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        let since_last = self.last_log.elapsed();
        if processed_since < threshold && since_last < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let rate = self.processed_samples as f32 / secs;
        eprintln!(
            "[dataset] batches={} samples={} skipped_empty={} elapsed={:.1}s rate={:.1} img/s",
            self.processed_batches, self.processed_samples, self.skipped_empty, secs, rate
        );
        self.last_logged_samples = self.processed_samples;
        self.last_log = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn write_sample(root: &Path, stem: &str, objects: &str) {
        let image_rel = format!("images/{stem}.png");
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([32, 64, 96]));
        img.save(root.join(&image_rel)).unwrap();
        let label = format!(r#"{{"image":"{image_rel}","objects":[{objects}]}}"#);
        fs::write(root.join(format!("labels/{stem}.json")), label).unwrap();
    }

    #[test]
    fn empty_index_yields_no_batches() {
        let spec = GridSpec { s: 7, b: 2, c: 1 };
        let mut iter = BatchIter::spawn(Vec::new(), spec, LoaderConfig::default());
        let device = Default::default();
        let batch = iter
            .next_batch::<burn_ndarray::NdArray<f32>>(&device)
            .unwrap();
        assert!(batch.is_none());
    }

    #[test]
    fn missing_label_surfaces_io_error() {
        let spec = GridSpec { s: 7, b: 2, c: 1 };
        let indices = vec![SampleIndex {
            root: PathBuf::from("/nonexistent"),
            label_path: PathBuf::from("/nonexistent/labels/0.json"),
        }];
        let mut iter = BatchIter::spawn(indices, spec, LoaderConfig::default());
        let device = Default::default();
        let err = iter
            .next_batch::<burn_ndarray::NdArray<f32>>(&device)
            .unwrap_err();
        assert!(matches!(err, GridDatasetError::Io { .. }));
    }

    #[test]
    fn skipped_empty_survives_fully_filtered_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("labels")).unwrap();
        fs::create_dir_all(root.join("images")).unwrap();
        // With batch_size 1 the empty samples form chunks that are
        // filtered away entirely, one before and one after the kept one.
        write_sample(root, "0000", "");
        write_sample(
            root,
            "0001",
            r#"{"class_id":0,"cx":0.5,"cy":0.5,"w":0.5,"h":0.5}"#,
        );
        write_sample(root, "0002", "");

        let spec = GridSpec { s: 7, b: 2, c: 1 };
        let indices = crate::index::index_labels(root).unwrap();
        assert_eq!(indices.len(), 3);
        let cfg = LoaderConfig {
            target_size: (8, 8),
            batch_size: 1,
            shuffle: false,
            skip_empty_labels: true,
            workers: 1,
            prefetch: 1,
            ..LoaderConfig::default()
        };
        let mut iter = BatchIter::spawn(indices, spec, cfg);
        let device = Default::default();

        let mut seen = 0usize;
        while let Some(batch) = iter
            .next_batch::<burn_ndarray::NdArray<f32>>(&device)
            .unwrap()
        {
            seen += batch.len;
        }
        assert_eq!(seen, 1);
        assert_eq!(iter.processed_samples(), 1);
        assert_eq!(iter.skipped_empty(), 2);
    }
}

//! Structured end-of-run training report.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub grid_size: usize,
    pub slots_per_cell: usize,
    pub classes: usize,
    pub image_size: u32,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub lambda_coord: f32,
    pub lambda_noobj: f32,
}

/// Everything a presentation layer needs to report a run, as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub run_name: String,
    pub device: String,
    pub duration_secs: f64,
    pub samples: usize,
    pub train_samples: usize,
    pub val_samples: usize,
    pub classes: Vec<String>,
    pub hyperparameters: Hyperparameters,
    /// One averaged loss per epoch.
    pub train_loss: Vec<f32>,
    /// Empty when no validation split was requested.
    pub val_loss: Vec<f32>,
    pub checkpoint: String,
    pub created_at_ms: u64,
}

impl TrainingSummary {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

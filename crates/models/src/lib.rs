//! Burn model for grid-based object detection.
//!
//! This crate defines the network architecture only: a small
//! convolutional feature extractor with a 1×1 detection head emitting the
//! `[N, S, S, 5B+C]` prediction grid. It is a pure Burn Module with no
//! awareness of dataset or loss types; the `training` crate owns those.
//!
//! Head outputs are raw (no sigmoid): the loss treats unbounded
//! predictions defensively, and keeping the head linear avoids saturated
//! gradients early in training.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct GridDetectorConfig {
    /// Grid size S.
    pub grid_size: usize,
    /// Predictor slots per cell B.
    pub slots_per_cell: usize,
    /// Class count C.
    pub classes: usize,
    /// Channel width of the first conv block; later blocks double it.
    pub base_channels: usize,
}

impl Default for GridDetectorConfig {
    fn default() -> Self {
        Self {
            grid_size: 7,
            slots_per_cell: 2,
            classes: 20,
            base_channels: 16,
        }
    }
}

impl GridDetectorConfig {
    pub fn cell_depth(&self) -> usize {
        5 * self.slots_per_cell + self.classes
    }
}

#[derive(Debug, Module)]
pub struct GridDetector<B: Backend> {
    blocks: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    grid_pool: AdaptiveAvgPool2d,
    head: Conv2d<B>,
    config: Ignored<GridDetectorConfig>,
}

impl<B: Backend> GridDetector<B> {
    pub fn new(config: GridDetectorConfig, device: &B::Device) -> Self {
        let widths = [
            3,
            config.base_channels,
            config.base_channels * 2,
            config.base_channels * 4,
            config.base_channels * 8,
        ];
        let mut blocks = Vec::new();
        for pair in widths.windows(2) {
            blocks.push(
                Conv2dConfig::new([pair[0], pair[1]], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device),
            );
        }
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        let grid_pool =
            AdaptiveAvgPool2dConfig::new([config.grid_size, config.grid_size]).init();
        let head = Conv2dConfig::new([config.base_channels * 8, config.cell_depth()], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);
        Self {
            blocks,
            pool,
            grid_pool,
            head,
            config: Ignored(config),
        }
    }

    pub fn config(&self) -> &GridDetectorConfig {
        &self.config
    }

    /// Forward pass: images `[N, 3, H, W]` -> predictions `[N, S, S, 5B+C]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for block in &self.blocks {
            x = self.pool.forward(relu(block.forward(x)));
        }
        let x = self.grid_pool.forward(x);
        let x = self.head.forward(x);
        // [N, 5B+C, S, S] -> [N, S, S, 5B+C]
        x.permute([0, 2, 3, 1])
    }
}

pub mod prelude {
    pub use super::{GridDetector, GridDetectorConfig};
}

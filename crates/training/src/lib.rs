#![recursion_limit = "256"]

pub mod loss;
pub mod summary;
pub mod util;

pub use loss::{
    iou, responsible_slot, DetectionLoss, LossBreakdown, LossError, LossWeights, SQRT_EPS,
};
pub use summary::{Hyperparameters, TrainingSummary};
pub use util::{run_train, BackendKind, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

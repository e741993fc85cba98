//! Multi-term detection loss over grid predictions.
//!
//! Responsibility matching runs on host data (the argmax over per-slot
//! IoUs is not differentiable anyway); the loss terms themselves are
//! assembled from tensor ops against constant mask tensors so gradients
//! flow to every prediction value that participates.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use grid_dataset::GridSpec;
use thiserror::Error;

/// Floor applied to widths/heights before the square-root transform.
pub const SQRT_EPS: f32 = 1e-6;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("non-finite loss value {value}")]
    NonFinite { value: f32 },
    #[error("prediction shape {preds:?} does not match target shape {targets:?}")]
    ShapeMismatch {
        preds: [usize; 4],
        targets: [usize; 4],
    },
    #[error("tensor host transfer failed during loss computation")]
    HostTransfer,
}

/// Term weights: coordinates amplified, no-object damped.
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub coord: f32,
    pub no_object: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            coord: 5.0,
            no_object: 0.5,
        }
    }
}

/// Scalar view of one loss evaluation, per-sample averaged.
#[derive(Debug, Clone, Copy)]
pub struct LossBreakdown {
    pub total: f32,
    pub coord: f32,
    pub object: f32,
    pub no_object: f32,
    pub class: f32,
}

/// Intersection-over-union of two corner-form boxes.
///
/// Negative extents are clamped to zero so malformed predictions score 0
/// instead of producing negative areas; a zero union also scores 0.
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_x0 = a[0].max(b[0]);
    let inter_y0 = a[1].max(b[1]);
    let inter_x1 = a[2].min(b[2]);
    let inter_y1 = a[3].min(b[3]);

    let inter_w = (inter_x1 - inter_x0).max(0.0);
    let inter_h = (inter_y1 - inter_y0).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter_area;
    if union <= 0.0 {
        0.0
    } else {
        inter_area / union
    }
}

/// Pick the responsible predictor for one occupied cell: argmax IoU
/// against the ground truth, ties resolved to the lowest slot index.
pub fn responsible_slot(gt: [f32; 4], slots: &[[f32; 4]]) -> (usize, f32) {
    let mut best_slot = 0usize;
    let mut best_iou = -1.0f32;
    for (k, pred) in slots.iter().enumerate() {
        let score = iou(*pred, gt);
        if score > best_iou {
            best_iou = score;
            best_slot = k;
        }
    }
    (best_slot, best_iou.max(0.0))
}

/// Convert a cell-relative box (x, y offsets in the cell, w, h relative
/// to the image) into absolute corner form.
fn cell_box(spec: &GridSpec, i: usize, j: usize, x: f32, y: f32, w: f32, h: f32) -> [f32; 4] {
    let s = spec.s as f32;
    let cx = (j as f32 + x) / s;
    let cy = (i as f32 + y) / s;
    let w = w.max(0.0);
    let h = h.max(0.0);
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// The four-term weighted detection objective.
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    spec: GridSpec,
    weights: LossWeights,
}

/// Host-built responsibility masks for one batch.
struct Responsibility {
    /// Per slot: 1.0 where that slot is responsible, [n * cells] each.
    resp: Vec<Vec<f32>>,
    /// Per slot: the matched IoU at responsible positions, 0 elsewhere.
    iou_target: Vec<Vec<f32>>,
    /// 1.0 for every class dim of occupied cells, [n * cells * c].
    class_mask: Vec<f32>,
}

impl DetectionLoss {
    pub fn new(spec: GridSpec, weights: LossWeights) -> Self {
        Self { spec, weights }
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    /// Compute the scalar loss for a batch of predictions against targets,
    /// both `[N, S, S, 5B+C]`. The returned tensor is differentiable with
    /// respect to the predictions; the breakdown carries detached values.
    pub fn forward<B: Backend>(
        &self,
        preds: Tensor<B, 4>,
        targets: Tensor<B, 4>,
    ) -> Result<(Tensor<B, 1>, LossBreakdown), LossError> {
        let dims = preds.dims();
        if dims != targets.dims() {
            return Err(LossError::ShapeMismatch {
                preds: dims,
                targets: targets.dims(),
            });
        }
        let spec = &self.spec;
        let n = dims[0];
        let cells = spec.cells();
        let depth = spec.depth();
        if dims[1] != spec.s || dims[2] != spec.s || dims[3] != depth {
            return Err(LossError::ShapeMismatch {
                preds: dims,
                targets: [n, spec.s, spec.s, depth],
            });
        }

        let preds = preds.reshape([n, cells, depth]);
        let targets = targets.reshape([n, cells, depth]);

        let masks = self.match_responsibility(&preds, &targets)?;
        let device = preds.device();

        let mut coord_sum: Option<Tensor<B, 1>> = None;
        let mut object_sum: Option<Tensor<B, 1>> = None;
        let mut noobj_sum: Option<Tensor<B, 1>> = None;

        for k in 0..spec.b {
            let base = 5 * k;
            let px = preds.clone().slice([0..n, 0..cells, base..base + 1]);
            let py = preds.clone().slice([0..n, 0..cells, base + 1..base + 2]);
            let pw = preds.clone().slice([0..n, 0..cells, base + 2..base + 3]);
            let ph = preds.clone().slice([0..n, 0..cells, base + 3..base + 4]);
            let pc = preds.clone().slice([0..n, 0..cells, base + 4..base + 5]);

            // Ground truth only ever populates slot 0.
            let tx = targets.clone().slice([0..n, 0..cells, 0..1]);
            let ty = targets.clone().slice([0..n, 0..cells, 1..2]);
            let tw = targets.clone().slice([0..n, 0..cells, 2..3]);
            let th = targets.clone().slice([0..n, 0..cells, 3..4]);

            let resp = Tensor::<B, 3>::from_data(
                TensorData::new(masks.resp[k].clone(), [n, cells, 1]),
                &device,
            );
            let iou_target = Tensor::<B, 3>::from_data(
                TensorData::new(masks.iou_target[k].clone(), [n, cells, 1]),
                &device,
            );
            let not_resp = resp.clone().neg().add_scalar(1.0);

            let dx = px - tx;
            let dy = py - ty;
            let dw = pw.clamp_min(SQRT_EPS).sqrt() - tw.clamp_min(SQRT_EPS).sqrt();
            let dh = ph.clamp_min(SQRT_EPS).sqrt() - th.clamp_min(SQRT_EPS).sqrt();
            let coord_k = (dx.clone() * dx + dy.clone() * dy + dw.clone() * dw + dh.clone() * dh)
                * resp.clone();

            let dc = pc.clone() - iou_target;
            let object_k = dc.clone() * dc * resp;
            let noobj_k = pc.clone() * pc * not_resp;

            coord_sum = Some(accumulate(coord_sum, coord_k.sum()));
            object_sum = Some(accumulate(object_sum, object_k.sum()));
            noobj_sum = Some(accumulate(noobj_sum, noobj_k.sum()));
        }

        let class_base = 5 * spec.b;
        let pcls = preds
            .clone()
            .slice([0..n, 0..cells, class_base..class_base + spec.c]);
        let tcls = targets
            .clone()
            .slice([0..n, 0..cells, class_base..class_base + spec.c]);
        let class_mask = Tensor::<B, 3>::from_data(
            TensorData::new(masks.class_mask.clone(), [n, cells, spec.c]),
            &device,
        );
        let dcls = pcls - tcls;
        let class_sum = (dcls.clone() * dcls * class_mask).sum();

        // b >= 1, so the accumulators are always populated.
        let coord_sum = coord_sum.ok_or(LossError::HostTransfer)?;
        let object_sum = object_sum.ok_or(LossError::HostTransfer)?;
        let noobj_sum = noobj_sum.ok_or(LossError::HostTransfer)?;

        let batch = n as f32;
        let coord = coord_sum.div_scalar(batch);
        let object = object_sum.div_scalar(batch);
        let no_object = noobj_sum.div_scalar(batch);
        let class = class_sum.div_scalar(batch);

        let total = coord.clone().mul_scalar(self.weights.coord)
            + object.clone()
            + no_object.clone().mul_scalar(self.weights.no_object)
            + class.clone();

        let breakdown = LossBreakdown {
            total: scalar(&total)?,
            coord: scalar(&coord)?,
            object: scalar(&object)?,
            no_object: scalar(&no_object)?,
            class: scalar(&class)?,
        };
        if !breakdown.total.is_finite() {
            return Err(LossError::NonFinite {
                value: breakdown.total,
            });
        }

        Ok((total, breakdown))
    }

    /// Re-derive the responsibility assignment from the current
    /// predictions. Recomputed on every evaluation: the argmax moves as
    /// the predicted boxes move.
    fn match_responsibility<B: Backend>(
        &self,
        preds: &Tensor<B, 3>,
        targets: &Tensor<B, 3>,
    ) -> Result<Responsibility, LossError> {
        let spec = &self.spec;
        let [n, cells, depth] = preds.dims();

        let p = preds
            .clone()
            .detach()
            .into_data()
            .to_vec::<f32>()
            .map_err(|_| LossError::HostTransfer)?;
        let t = targets
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|_| LossError::HostTransfer)?;

        let mut resp = vec![vec![0.0f32; n * cells]; spec.b];
        let mut iou_target = vec![vec![0.0f32; n * cells]; spec.b];
        let mut class_mask = vec![0.0f32; n * cells * spec.c];

        let mut slots = vec![[0.0f32; 4]; spec.b];
        for sample in 0..n {
            for cell in 0..cells {
                let base = (sample * cells + cell) * depth;
                if t[base + 4] <= 0.5 {
                    continue;
                }
                let i = cell / spec.s;
                let j = cell % spec.s;
                let gt = cell_box(spec, i, j, t[base], t[base + 1], t[base + 2], t[base + 3]);
                for (k, slot) in slots.iter_mut().enumerate() {
                    let sb = base + 5 * k;
                    *slot = cell_box(spec, i, j, p[sb], p[sb + 1], p[sb + 2], p[sb + 3]);
                }
                let (best, score) = responsible_slot(gt, &slots);

                let flat = sample * cells + cell;
                resp[best][flat] = 1.0;
                iou_target[best][flat] = score;
                let class_base = flat * spec.c;
                class_mask[class_base..class_base + spec.c].fill(1.0);
            }
        }

        Ok(Responsibility {
            resp,
            iou_target,
            class_mask,
        })
    }
}

fn accumulate<B: Backend>(acc: Option<Tensor<B, 1>>, term: Tensor<B, 1>) -> Tensor<B, 1> {
    match acc {
        Some(acc) => acc + term,
        None => term,
    }
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> Result<f32, LossError> {
    t.clone()
        .detach()
        .into_data()
        .to_vec::<f32>()
        .map_err(|_| LossError::HostTransfer)?
        .first()
        .copied()
        .ok_or(LossError::HostTransfer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_identity_is_one() {
        let b = [0.1, 0.2, 0.6, 0.9];
        assert!((iou(b, b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = [0.0, 0.0, 0.2, 0.2];
        let b = [0.5, 0.5, 0.9, 0.9];
        assert_eq!(iou(a, b), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = [0.0, 0.0, 0.5, 0.5];
        let b = [0.25, 0.25, 0.75, 0.75];
        assert!((iou(a, b) - iou(b, a)).abs() < 1e-6);
    }

    #[test]
    fn iou_degenerate_union_is_zero() {
        let a = [0.3, 0.3, 0.3, 0.3];
        assert_eq!(iou(a, a), 0.0);
    }

    #[test]
    fn iou_clamps_negative_extents() {
        let inverted = [0.6, 0.6, 0.2, 0.2];
        let b = [0.0, 0.0, 1.0, 1.0];
        assert_eq!(iou(inverted, b), 0.0);
    }

    #[test]
    fn responsibility_tie_breaks_to_lowest_slot() {
        let gt = [0.2, 0.2, 0.4, 0.4];
        let slots = [gt, gt];
        let (best, score) = responsible_slot(gt, &slots);
        assert_eq!(best, 0);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sqrt_transform_compresses_large_box_error() {
        // Same absolute width error (0.1); the large-box pair must cost less.
        let large = (0.5f32.sqrt() - 0.4f32.sqrt()).powi(2);
        let small = (0.2f32.sqrt() - 0.1f32.sqrt()).powi(2);
        assert!(large < small);
    }
}

//! Dense grid-target encoding for single-stage detection.

use data_contracts::Annotation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grid geometry: S×S cells, B predictor slots per cell, C classes.
///
/// Cell (i, j) of a target occupies `depth()` consecutive values at flat
/// cell index `i*s + j`. Slot k holds (x, y, w, h, confidence) at dims
/// `[5k, 5k+5)`; the shared class vector sits at dims `[5b, 5b+c)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub s: usize,
    pub b: usize,
    pub c: usize,
}

impl GridSpec {
    pub fn depth(&self) -> usize {
        5 * self.b + self.c
    }

    pub fn cells(&self) -> usize {
        self.s * self.s
    }

    /// Total values in one target: S×S×(5B+C).
    pub fn len(&self) -> usize {
        self.cells() * self.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell_offset(&self, i: usize, j: usize) -> usize {
        (i * self.s + j) * self.depth()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("class id {class_id} outside [0, {classes})")]
    ClassOutOfRange { class_id: usize, classes: usize },
}

/// Encode one image's annotations into a dense `[S, S, 5B+C]` target.
///
/// Each annotation lands in the cell containing its center: i = ⌊cy·S⌋,
/// j = ⌊cx·S⌋, clamped so centers at exactly 1.0 stay on the grid. Slot 0
/// receives the cell-relative offsets and image-relative extent with
/// confidence 1; the remaining B−1 slots stay zero for the model to fill.
///
/// When two annotations map to the same cell the later one overwrites the
/// earlier, class vector included. This is the lossy limit of a fixed
/// grid: one object per cell is all the encoding can represent.
///
/// Coordinates outside [0, 1] are clamped; an out-of-range `class_id` is
/// the only failure.
pub fn encode_target(spec: &GridSpec, objects: &[Annotation]) -> Result<Vec<f32>, EncodingError> {
    let depth = spec.depth();
    let mut target = vec![0.0f32; spec.len()];

    for object in objects {
        if object.class_id >= spec.c {
            return Err(EncodingError::ClassOutOfRange {
                class_id: object.class_id,
                classes: spec.c,
            });
        }

        let cx = object.cx.clamp(0.0, 1.0);
        let cy = object.cy.clamp(0.0, 1.0);
        let w = object.w.clamp(0.0, 1.0);
        let h = object.h.clamp(0.0, 1.0);

        let s = spec.s as f32;
        let j = ((cx * s).floor() as usize).min(spec.s - 1);
        let i = ((cy * s).floor() as usize).min(spec.s - 1);
        let x = cx * s - j as f32;
        let y = cy * s - i as f32;

        let base = spec.cell_offset(i, j);
        let cell = &mut target[base..base + depth];
        cell.fill(0.0);
        cell[0] = x;
        cell[1] = y;
        cell[2] = w;
        cell[3] = h;
        cell[4] = 1.0;
        cell[5 * spec.b + object.class_id] = 1.0;
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(class_id: usize, cx: f32, cy: f32, w: f32, h: f32) -> Annotation {
        Annotation {
            class_id,
            cx,
            cy,
            w,
            h,
        }
    }

    const SPEC: GridSpec = GridSpec { s: 7, b: 2, c: 3 };

    #[test]
    fn center_lands_in_floor_cell() {
        let target = encode_target(&SPEC, &[ann(0, 0.5, 0.5, 1.0, 1.0)]).unwrap();
        // cx = cy = 0.5 on a 7-grid -> cell (3, 3), offsets 0.5.
        let base = SPEC.cell_offset(3, 3);
        assert!((target[base] - 0.5).abs() < 1e-6);
        assert!((target[base + 1] - 0.5).abs() < 1e-6);
        assert_eq!(target[base + 4], 1.0);
        assert_eq!(target[base + 5 * SPEC.b], 1.0);
    }

    #[test]
    fn boundary_center_clamps_to_last_cell() {
        let target = encode_target(&SPEC, &[ann(1, 1.0, 1.0, 0.2, 0.2)]).unwrap();
        let base = SPEC.cell_offset(6, 6);
        assert_eq!(target[base + 4], 1.0);
        assert_eq!(target[base + 5 * SPEC.b + 1], 1.0);
    }

    #[test]
    fn all_cells_reachable_for_in_range_centers() {
        for step in 0..SPEC.s {
            let center = (step as f32 + 0.5) / SPEC.s as f32;
            let target = encode_target(&SPEC, &[ann(0, center, center, 0.1, 0.1)]).unwrap();
            let base = SPEC.cell_offset(step, step);
            assert_eq!(target[base + 4], 1.0);
        }
    }

    #[test]
    fn later_annotation_wins_the_cell() {
        let target = encode_target(
            &SPEC,
            &[ann(0, 0.52, 0.52, 0.4, 0.4), ann(2, 0.51, 0.51, 0.2, 0.2)],
        )
        .unwrap();
        let base = SPEC.cell_offset(3, 3);
        assert!((target[base + 2] - 0.2).abs() < 1e-6);
        // The earlier class one-hot must be gone, not merged.
        assert_eq!(target[base + 5 * SPEC.b], 0.0);
        assert_eq!(target[base + 5 * SPEC.b + 2], 1.0);
    }

    #[test]
    fn second_slot_stays_empty() {
        let target = encode_target(&SPEC, &[ann(0, 0.5, 0.5, 0.3, 0.3)]).unwrap();
        let base = SPEC.cell_offset(3, 3);
        for k in 5..10 {
            assert_eq!(target[base + k], 0.0);
        }
    }

    #[test]
    fn out_of_range_class_rejected() {
        let err = encode_target(&SPEC, &[ann(3, 0.5, 0.5, 0.3, 0.3)]).unwrap_err();
        assert_eq!(
            err,
            EncodingError::ClassOutOfRange {
                class_id: 3,
                classes: 3
            }
        );
    }
}

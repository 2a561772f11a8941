//! Geometric-tolerance tests for the stacking window.
//!
//! Two small pieces ride on the pixel kernels in [`crate::buffer`]:
//!
//! - [`DifferenceEvaluator`] turns a pair of binarized frames into a
//!   disagreement mask and folds masks into the running union for the
//!   active window.
//! - [`ConvergenceChecker`] erodes the union mask with a bounded number of
//!   3x3 steps; a mask that erodes to nothing within the bound marks the
//!   accumulated difference as geometrically negligible. Surviving more
//!   erosion steps means the differing feature is laterally thicker, so
//!   merging the layers would produce a visible stair-step.

use crate::buffer::Frame;

/// Pixel-wise comparison of binarized layer frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct DifferenceEvaluator;

impl DifferenceEvaluator {
    /// XOR mask: 255 where the frames disagree, 0 where they match.
    pub fn diff(&self, a: &Frame, b: &Frame) -> Frame {
        a.xor_diff(b)
    }

    /// Fold `mask` into `running` as a pixel-wise maximum. A pixel that
    /// ever differed within the window stays marked, even if later frames
    /// agree again.
    pub fn fold(&self, running: &mut Frame, mask: &Frame) {
        running.max_in_place(mask);
    }
}

/// Bounded-erosion convergence test.
#[derive(Clone, Copy, Debug)]
pub struct ConvergenceChecker {
    maximum_erodes: usize,
}

impl ConvergenceChecker {
    /// Create a checker allowing up to `maximum_erodes` erosion steps per
    /// candidate extension.
    pub fn new(maximum_erodes: usize) -> Self {
        Self { maximum_erodes }
    }

    /// Erosion-step bound.
    #[inline]
    pub fn maximum_erodes(&self) -> usize {
        self.maximum_erodes
    }

    /// Whether `mask` erodes to all-zero within the bound. The mask itself
    /// is untouched; erosion runs on a working copy. A blank mask converges
    /// immediately with zero steps.
    pub fn converged(&self, mask: &Frame) -> bool {
        if mask.is_blank() {
            return true;
        }
        let mut working = mask.clone();
        for _ in 0..self.maximum_erodes {
            working = working.erode_once();
            if working.is_blank() {
                return true;
            }
        }
        false
    }
}

//! # Restack
//!
//! A dynamic layer-height optimizer for resin-slicer projects.
//!
//! The optimizer takes a project sliced at a uniform thin layer height and
//! merges runs of consecutive layers whose geometry is near-identical into
//! single thicker layers, trading print time for a bounded loss of shape
//! fidelity:
//! - Binarized layer images are compared pairwise with a XOR difference
//!   accumulated into a per-window union mask
//! - Bounded morphological erosion of the mask decides whether the
//!   accumulated difference is geometrically negligible
//! - Merged layers keep the model's exact total height; any drift is a
//!   fatal integrity error
//! - Exposure times are re-scheduled per resulting layer height
//!
//! ## Example
//!
//! ```rust,ignore
//! use restack::{Project, StackBuilder, StackConfig};
//!
//! let mut store = Project::load("print_project/")?;
//! let config = StackConfig::default().maximum_layer_height(0.10);
//! let report = StackBuilder::new(config).run(&mut store, |_| {})?;
//! println!("{report}");
//! ```

// Core modules
pub mod buffer;
pub mod cache;
pub mod config;
pub mod exposure;
pub mod morphology;
pub mod project;
pub mod report;
pub mod stack;
pub mod store;

// Re-export commonly used types
pub use buffer::Frame;
pub use cache::{CacheSlot, FrameCache};
pub use config::{ExposureSetType, ManualExposure, StackConfig};
pub use exposure::{ExposureItem, ExposureScheduler, ExposureTable};
pub use morphology::{ConvergenceChecker, DifferenceEvaluator};
pub use project::Project;
pub use report::{Report, ReportBuilder};
pub use stack::{CancelToken, StackBuilder};
pub use store::{Layer, LayerStore};

/// Number of decimal places layer heights and Z positions are rounded to.
/// Slicer formats store millimeter heights with micrometer precision, so
/// all height arithmetic in the optimizer is quantized to three decimals;
/// common base heights such as 0.025 mm stay exactly representable.
pub const HEIGHT_DECIMALS: i32 = 3;

/// The largest layer height representable by the target printer formats (mm).
/// A model whose base height is already at or above this bound cannot be
/// merged further.
pub const MAX_REPRESENTABLE_HEIGHT: f64 = 0.20;

/// Round a height or Z position to the representable precision.
#[inline]
pub fn round_height(v: f64) -> f64 {
    let scale = 10f64.powi(HEIGHT_DECIMALS);
    (v * scale).round() / scale
}

/// Compare two heights/positions at the representable precision.
#[inline]
pub fn height_eq(a: f64, b: f64) -> bool {
    round_height(a) == round_height(b)
}

/// Convert a millimeter height to an integer micrometer key.
/// Used wherever heights index a map, to avoid float keys.
#[inline]
pub fn height_um(v: f64) -> u32 {
    (v * 1000.0).round() as u32
}

/// Result type used throughout the optimizer.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for optimizer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported model: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Project error: {0}")]
    Project(String),

    #[error(
        "Layer position integrity violated at layer {index}: \
         expected {expected:.3} mm, got {actual:.3} mm"
    )]
    Integrity {
        index: usize,
        expected: f64,
        actual: f64,
    },

    #[error("Cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_height() {
        assert_eq!(round_height(0.060000000000000005), 0.06);
        assert_eq!(round_height(0.019999999), 0.02);
        assert_eq!(round_height(0.025), 0.025);
        assert!(height_eq(0.02 + 0.02 + 0.02, 0.06));
        assert!(height_eq(0.075 + 0.025, 0.1));
    }

    #[test]
    fn test_height_um_keys() {
        assert_eq!(height_um(0.02), 20);
        assert_eq!(height_um(0.025), 25);
        assert_eq!(height_um(0.1), 100);
        assert_ne!(height_um(0.02), height_um(0.03));
    }
}

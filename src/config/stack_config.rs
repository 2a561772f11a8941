//! Stacking run configuration.
//!
//! [`StackConfig`] carries every run parameter of the optimizer: cache
//! budget, merged-height bounds, anti-aliasing handling, the erosion bound
//! and the exposure re-scheduling strategy. Validation follows the split
//! the run pipeline expects: [`StackConfig::check_preconditions`] yields a
//! single "unsupported model" error, [`StackConfig::validate`] a list of
//! human-readable configuration problems. Both must pass before a run.

use crate::store::LayerStore;
use crate::{height_eq, height_um, round_height, Error, Result, MAX_REPRESENTABLE_HEIGHT};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default frame-cache memory budget (bytes).
pub const DEFAULT_CACHE_RAM_BUDGET: usize = 256 * 1024 * 1024;

/// Exposure re-scheduling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureSetType {
    /// Exposure grows by a fixed step per height level above the base.
    #[default]
    Linear,
    /// Exposure grows proportionally to the base exposure, weighted by the
    /// layer height.
    Multiplier,
    /// Exposures come verbatim from a user-supplied table.
    Manual,
}

impl fmt::Display for ExposureSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureSetType::Linear => write!(f, "linear"),
            ExposureSetType::Multiplier => write!(f, "multiplier"),
            ExposureSetType::Manual => write!(f, "manual"),
        }
    }
}

/// One user-supplied exposure table row (Manual strategy).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualExposure {
    /// Layer height this entry applies to (mm).
    pub layer_height: f64,
    /// Bottom exposure time (s).
    pub bottom_exposure: f64,
    /// Normal exposure time (s).
    pub exposure: f64,
}

/// Run parameters for the dynamic layer-height optimizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Memory budget bounding the frame-cache capacity (bytes).
    pub cache_ram_budget: usize,

    /// Smallest merged layer height to aim for (mm). Must lie strictly
    /// above the base height; single-layer windows may still fall below it.
    pub minimum_layer_height: f64,

    /// Largest merged layer height allowed (mm).
    pub maximum_layer_height: f64,

    /// Binarize buffers before merging and discard the grayscale originals.
    pub strip_antialiasing: bool,

    /// Re-blur merged buffers after stripping, restoring soft edges.
    pub reconstruct_antialiasing: bool,

    /// Upper bound on erosion attempts per candidate window extension.
    pub maximum_erodes: usize,

    /// Exposure re-scheduling strategy.
    pub exposure_set_type: ExposureSetType,

    /// Whether bottom exposure also grows per height level (Linear and
    /// Multiplier strategies).
    pub iterate_bottom_exposure_time: bool,

    /// Bottom exposure increment per height level (s).
    pub bottom_exposure_step: f64,

    /// Normal exposure increment per height level (s).
    pub exposure_step: f64,

    /// Height -> exposure rows, required for the Manual strategy.
    pub manual_exposure_table: Vec<ManualExposure>,

    /// First layer index to optimize (inclusive); default 0.
    pub layer_index_start: Option<usize>,

    /// Last layer index to optimize (inclusive); default last layer.
    /// Layers outside the range pass through unchanged.
    pub layer_index_end: Option<usize>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            cache_ram_budget: DEFAULT_CACHE_RAM_BUDGET,
            minimum_layer_height: 0.03,
            maximum_layer_height: 0.10,
            strip_antialiasing: false,
            reconstruct_antialiasing: false,
            maximum_erodes: 10,
            exposure_set_type: ExposureSetType::Linear,
            iterate_bottom_exposure_time: true,
            bottom_exposure_step: 0.5,
            exposure_step: 0.2,
            manual_exposure_table: Vec::new(),
            layer_index_start: None,
            layer_index_end: None,
        }
    }
}

impl StackConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the cache memory budget (bytes).
    pub fn cache_ram_budget(mut self, bytes: usize) -> Self {
        self.cache_ram_budget = bytes;
        self
    }

    /// Builder: set the minimum merged layer height (mm).
    pub fn minimum_layer_height(mut self, height: f64) -> Self {
        self.minimum_layer_height = height;
        self
    }

    /// Builder: set the maximum merged layer height (mm).
    pub fn maximum_layer_height(mut self, height: f64) -> Self {
        self.maximum_layer_height = height;
        self
    }

    /// Builder: strip anti-aliasing before merging.
    pub fn strip_antialiasing(mut self, strip: bool) -> Self {
        self.strip_antialiasing = strip;
        self
    }

    /// Builder: reconstruct anti-aliasing on merged buffers.
    pub fn reconstruct_antialiasing(mut self, reconstruct: bool) -> Self {
        self.reconstruct_antialiasing = reconstruct;
        self
    }

    /// Builder: set the erosion-attempt bound.
    pub fn maximum_erodes(mut self, erodes: usize) -> Self {
        self.maximum_erodes = erodes;
        self
    }

    /// Builder: set the exposure strategy.
    pub fn exposure_set_type(mut self, set_type: ExposureSetType) -> Self {
        self.exposure_set_type = set_type;
        self
    }

    /// Builder: iterate bottom exposure per height level.
    pub fn iterate_bottom_exposure_time(mut self, iterate: bool) -> Self {
        self.iterate_bottom_exposure_time = iterate;
        self
    }

    /// Builder: set the exposure steps (bottom, normal), in seconds.
    pub fn exposure_steps(mut self, bottom: f64, normal: f64) -> Self {
        self.bottom_exposure_step = bottom;
        self.exposure_step = normal;
        self
    }

    /// Builder: supply the manual exposure table.
    pub fn manual_exposure_table(mut self, table: Vec<ManualExposure>) -> Self {
        self.manual_exposure_table = table;
        self
    }

    /// Builder: restrict the optimized index range (inclusive bounds).
    pub fn layer_range(mut self, start: usize, end: usize) -> Self {
        self.layer_index_start = Some(start);
        self.layer_index_end = Some(end);
        self
    }

    /// Resolve the optimized range against the store: inclusive
    /// (start, end) indices, clamped to the layer count.
    pub fn resolved_range(&self, store: &LayerStore) -> (usize, usize) {
        let last = store.layer_count().saturating_sub(1);
        let start = self.layer_index_start.unwrap_or(0).min(last);
        let end = self.layer_index_end.unwrap_or(last).min(last);
        (start, end)
    }

    /// Number of height levels reachable by the merge algorithm: level 0 is
    /// the base height, the last level is the largest multiple of the base
    /// height not exceeding the maximum.
    pub fn height_levels(&self, base_height: f64) -> usize {
        if base_height <= 0.0 {
            return 0;
        }
        ((self.maximum_layer_height / base_height).floor() as usize).max(1)
    }

    /// Check model preconditions, producing a single "unsupported" error.
    pub fn check_preconditions(&self, store: &LayerStore) -> Result<()> {
        if store.layer_count() == 0 {
            return Err(Error::Unsupported("the model has no layers".into()));
        }
        if !store.supports_per_layer_settings() {
            return Err(Error::Unsupported(
                "the model format does not support per-layer height and exposure".into(),
            ));
        }
        let base = store.layer_height();
        if base >= MAX_REPRESENTABLE_HEIGHT {
            return Err(Error::Unsupported(format!(
                "the model layer height {base:.3} mm is already at the representable \
                 maximum of {MAX_REPRESENTABLE_HEIGHT:.3} mm"
            )));
        }
        // Refuse to run twice: every in-range layer must sit exactly one
        // base height above its predecessor.
        let (start, end) = self.resolved_range(store);
        for index in start..=end {
            let previous_z = if index == 0 {
                0.0
            } else {
                store.layer(index - 1).position_z
            };
            let expected = round_height(previous_z + base);
            if !height_eq(store.layer(index).position_z, expected) {
                return Err(Error::Unsupported(format!(
                    "layer {index} is not offset one base height from its predecessor \
                     ({:.3} mm vs expected {expected:.3} mm); the model appears to be \
                     merged already",
                    store.layer(index).position_z
                )));
            }
        }
        Ok(())
    }

    /// Validate the configuration against the store. Returns a list of
    /// human-readable problems; an empty list means the run may proceed.
    pub fn validate(&self, store: &LayerStore) -> Vec<String> {
        let mut errors = Vec::new();
        let base = store.layer_height();

        if self.minimum_layer_height > self.maximum_layer_height {
            errors.push(format!(
                "minimum layer height ({:.3} mm) exceeds maximum ({:.3} mm)",
                self.minimum_layer_height, self.maximum_layer_height
            ));
        }
        if self.minimum_layer_height <= base {
            errors.push(format!(
                "minimum layer height ({:.3} mm) must be above the base height ({base:.3} mm)",
                self.minimum_layer_height
            ));
        }
        if self.maximum_layer_height <= base {
            errors.push(format!(
                "maximum layer height ({:.3} mm) must be above the base height ({base:.3} mm)",
                self.maximum_layer_height
            ));
        }
        if self.maximum_layer_height > MAX_REPRESENTABLE_HEIGHT {
            errors.push(format!(
                "maximum layer height ({:.3} mm) exceeds the representable \
                 maximum ({MAX_REPRESENTABLE_HEIGHT:.3} mm)",
                self.maximum_layer_height
            ));
        }
        if self.cache_ram_budget == 0 {
            errors.push("cache memory budget must be positive".into());
        }

        match self.exposure_set_type {
            ExposureSetType::Linear | ExposureSetType::Multiplier => {
                if self.exposure_step < 0.0 {
                    errors.push("exposure step must not be negative".into());
                }
                if self.iterate_bottom_exposure_time && self.bottom_exposure_step < 0.0 {
                    errors.push("bottom exposure step must not be negative".into());
                }
                if store.settings().exposure_time <= 0.0 {
                    errors.push("the model's normal exposure time must be positive".into());
                }
                if store.settings().bottom_exposure_time <= 0.0 {
                    errors.push("the model's bottom exposure time must be positive".into());
                }
            }
            ExposureSetType::Manual => {
                for row in &self.manual_exposure_table {
                    if row.layer_height <= 0.0 || row.exposure <= 0.0 || row.bottom_exposure <= 0.0
                    {
                        errors.push(format!(
                            "manual exposure entry for {:.3} mm must have positive values",
                            row.layer_height
                        ));
                    }
                }
                // Every height reachable by the merge algorithm needs a row.
                if base > 0.0 {
                    for level in 0..self.height_levels(base) {
                        let height = round_height(base * (level + 1) as f64);
                        let covered = self
                            .manual_exposure_table
                            .iter()
                            .any(|row| height_um(row.layer_height) == height_um(height));
                        if !covered {
                            errors.push(format!(
                                "manual exposure table has no entry for {height:.3} mm"
                            ));
                        }
                    }
                }
            }
        }

        let (start, end) = self.resolved_range(store);
        if start > end {
            errors.push(format!(
                "layer range start ({start}) is past the range end ({end})"
            ));
        }

        errors
    }

    /// Run both precondition and validation checks, folding validation
    /// messages into a single configuration error.
    pub fn check(&self, store: &LayerStore) -> Result<()> {
        self.check_preconditions(store)?;
        let errors = self.validate(store);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::uniform_store;

    #[test]
    fn test_default_config_is_valid() {
        let store = uniform_store(5, 0.02);
        let config = StackConfig::default();
        assert!(config.check_preconditions(&store).is_ok());
        assert!(config.validate(&store).is_empty());
    }

    #[test]
    fn test_height_bounds_validation() {
        let store = uniform_store(5, 0.02);
        let config = StackConfig::default()
            .minimum_layer_height(0.08)
            .maximum_layer_height(0.04);
        let errors = config.validate(&store);
        assert!(errors.iter().any(|e| e.contains("exceeds maximum")));

        let config = StackConfig::default()
            .minimum_layer_height(0.02)
            .maximum_layer_height(0.10);
        let errors = config.validate(&store);
        assert!(errors.iter().any(|e| e.contains("above the base height")));

        let config = StackConfig::default().maximum_layer_height(0.25);
        let errors = config.validate(&store);
        assert!(errors.iter().any(|e| e.contains("representable")));
    }

    #[test]
    fn test_manual_table_coverage() {
        let store = uniform_store(5, 0.02);
        // maximum 0.10 with base 0.02 reaches heights 0.02..0.10; leave
        // 0.06 uncovered.
        let table = vec![
            ManualExposure { layer_height: 0.02, bottom_exposure: 10.0, exposure: 3.0 },
            ManualExposure { layer_height: 0.04, bottom_exposure: 10.5, exposure: 3.2 },
            ManualExposure { layer_height: 0.08, bottom_exposure: 11.5, exposure: 3.6 },
            ManualExposure { layer_height: 0.10, bottom_exposure: 12.0, exposure: 3.8 },
        ];
        let config = StackConfig::default()
            .exposure_set_type(ExposureSetType::Manual)
            .manual_exposure_table(table);
        let errors = config.validate(&store);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("0.06"));
    }

    #[test]
    fn test_precondition_accepts_quarter_hundredth_heights() {
        // 0.025 mm offsets are exact at the rounding precision and must not
        // be mistaken for an already-merged model.
        let store = uniform_store(5, 0.025);
        let config = StackConfig::default().minimum_layer_height(0.05);
        assert!(config.check_preconditions(&store).is_ok());
    }

    #[test]
    fn test_precondition_rejects_merged_model() {
        let mut store = uniform_store(5, 0.02);
        // Pretend the model was merged before: double the base height so
        // the per-layer offsets no longer match it.
        store.set_layer_height(0.01);
        let config = StackConfig::default();
        let err = config.check_preconditions(&store).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_precondition_rejects_max_height_model() {
        let mut store = uniform_store(5, 0.02);
        store.set_layer_height(MAX_REPRESENTABLE_HEIGHT);
        let config = StackConfig::default();
        assert!(config.check_preconditions(&store).is_err());
    }

    #[test]
    fn test_height_levels() {
        let config = StackConfig::default().maximum_layer_height(0.10);
        assert_eq!(config.height_levels(0.02), 5);
        let config = StackConfig::default().maximum_layer_height(0.05);
        assert_eq!(config.height_levels(0.02), 2);
    }

    #[test]
    fn test_resolved_range_clamps() {
        let store = uniform_store(5, 0.02);
        let config = StackConfig::default().layer_range(1, 99);
        assert_eq!(config.resolved_range(&store), (1, 4));
        let config = StackConfig::default();
        assert_eq!(config.resolved_range(&store), (0, 4));
    }
}

//! Exposure re-scheduling for merged layer sequences.
//!
//! A merged layer is thicker than the base layer, so it needs more light.
//! The scheduler maps every reachable layer height to a (bottom, normal)
//! exposure pair through an [`ExposureTable`], built from one of three
//! strategies:
//!
//! - **Linear**: exposure grows by a fixed step per height level above the
//!   base height.
//! - **Multiplier**: exposure grows proportionally to the base exposure,
//!   weighted by the layer height.
//! - **Manual**: the table comes verbatim from user-supplied rows.
//!
//! Every height the merge algorithm can produce must resolve to a table
//! entry; a miss at apply time means validation was skipped and is
//! reported as a configuration error, never patched over at runtime.

use crate::config::{ExposureSetType, StackConfig};
use crate::store::{Layer, LayerStore};
use crate::{height_um, round_height, Error, Result};
use std::collections::BTreeMap;

/// One height level's exposure pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExposureItem {
    /// Layer height this entry applies to (mm).
    pub layer_height: f64,
    /// Bottom exposure time (s).
    pub bottom_exposure: f64,
    /// Normal exposure time (s).
    pub exposure: f64,
}

/// Height-keyed exposure lookup. Keys are integer micrometers so float
/// heights never index the map directly.
#[derive(Clone, Debug, Default)]
pub struct ExposureTable {
    entries: BTreeMap<u32, ExposureItem>,
}

impl ExposureTable {
    /// Build the active table for a run.
    ///
    /// Linear and Multiplier derive one entry per reachable height level
    /// (level 0 = base height); Manual copies the user rows.
    pub fn build(config: &StackConfig, store: &LayerStore) -> Self {
        let mut entries = BTreeMap::new();
        let base = store.layer_height();
        let base_bottom = store.settings().bottom_exposure_time;
        let base_normal = store.settings().exposure_time;

        match config.exposure_set_type {
            ExposureSetType::Manual => {
                for row in &config.manual_exposure_table {
                    entries.insert(
                        height_um(row.layer_height),
                        ExposureItem {
                            layer_height: round_height(row.layer_height),
                            bottom_exposure: row.bottom_exposure,
                            exposure: row.exposure,
                        },
                    );
                }
            }
            ExposureSetType::Linear => {
                for level in 0..config.height_levels(base) {
                    let n = level as f64;
                    let height = round_height(base * (level + 1) as f64);
                    let bottom = if config.iterate_bottom_exposure_time {
                        base_bottom + n * config.bottom_exposure_step
                    } else {
                        base_bottom
                    };
                    entries.insert(
                        height_um(height),
                        ExposureItem {
                            layer_height: height,
                            bottom_exposure: bottom,
                            exposure: base_normal + n * config.exposure_step,
                        },
                    );
                }
            }
            ExposureSetType::Multiplier => {
                for level in 0..config.height_levels(base) {
                    let n = level as f64;
                    let height = round_height(base * (level + 1) as f64);
                    let bottom = if config.iterate_bottom_exposure_time {
                        base_bottom + base_bottom * n * height * config.bottom_exposure_step
                    } else {
                        base_bottom
                    };
                    entries.insert(
                        height_um(height),
                        ExposureItem {
                            layer_height: height,
                            bottom_exposure: bottom,
                            exposure: base_normal + base_normal * n * height * config.exposure_step,
                        },
                    );
                }
            }
        }

        Self { entries }
    }

    /// Look up the exposure pair for a layer height.
    pub fn get(&self, height: f64) -> Option<&ExposureItem> {
        self.entries.get(&height_um(height))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending height order.
    pub fn iter(&self) -> impl Iterator<Item = &ExposureItem> {
        self.entries.values()
    }
}

/// Applies the active exposure table to an output layer sequence.
#[derive(Clone, Debug)]
pub struct ExposureScheduler {
    table: ExposureTable,
}

impl ExposureScheduler {
    /// Create a scheduler for a run.
    pub fn new(config: &StackConfig, store: &LayerStore) -> Self {
        Self {
            table: ExposureTable::build(config, store),
        }
    }

    /// Rewrite both exposure fields of every layer from the table. Layers
    /// within the store's bottom-layer count are the ones that will print
    /// with the bottom value, but both fields are kept current on every
    /// layer.
    pub fn apply(&self, layers: &mut [Layer]) -> Result<()> {
        for layer in layers.iter_mut() {
            let item = self.table.get(layer.height).ok_or_else(|| {
                Error::Config(format!(
                    "no exposure entry for layer height {:.3} mm (layer {})",
                    layer.height, layer.index
                ))
            })?;
            if layer.exposure_time != item.exposure
                || layer.bottom_exposure_time != item.bottom_exposure
            {
                layer.exposure_time = item.exposure;
                layer.bottom_exposure_time = item.bottom_exposure;
                layer.is_modified = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManualExposure;
    use crate::store::testutil::uniform_store;
    use crate::Frame;

    fn scenario_store() -> LayerStore {
        // Base 0.02 mm, bottom 10.00 s, normal 3.00 s.
        let mut store = uniform_store(5, 0.02);
        store.set_bottom_exposure_time(10.0);
        store.set_exposure_time(3.0);
        store
    }

    #[test]
    fn test_linear_schedule_levels() {
        let store = scenario_store();
        let config = StackConfig::default()
            .maximum_layer_height(0.10)
            .iterate_bottom_exposure_time(true)
            .exposure_steps(0.5, 0.2);
        let table = ExposureTable::build(&config, &store);
        assert_eq!(table.len(), 5);

        let level0 = table.get(0.02).unwrap();
        assert!((level0.bottom_exposure - 10.0).abs() < 1e-9);
        assert!((level0.exposure - 3.0).abs() < 1e-9);

        let level4 = table.get(0.10).unwrap();
        assert!((level4.bottom_exposure - 12.0).abs() < 1e-9);
        assert!((level4.exposure - 3.8).abs() < 1e-9);
    }

    #[test]
    fn test_linear_without_bottom_iteration() {
        let store = scenario_store();
        let config = StackConfig::default()
            .iterate_bottom_exposure_time(false)
            .exposure_steps(0.5, 0.2);
        let table = ExposureTable::build(&config, &store);
        assert!((table.get(0.10).unwrap().bottom_exposure - 10.0).abs() < 1e-9);
        assert!((table.get(0.10).unwrap().exposure - 3.8).abs() < 1e-9);
    }

    #[test]
    fn test_multiplier_schedule_weights_by_height() {
        let store = scenario_store();
        let config = StackConfig::default()
            .exposure_set_type(ExposureSetType::Multiplier)
            .iterate_bottom_exposure_time(true)
            .exposure_steps(0.5, 0.2);
        let table = ExposureTable::build(&config, &store);
        // Level 0 stays at the base values.
        assert!((table.get(0.02).unwrap().exposure - 3.0).abs() < 1e-9);
        // Level 2, height 0.06: 3.0 + 3.0 * 2 * 0.06 * 0.2 = 3.072
        assert!((table.get(0.06).unwrap().exposure - 3.072).abs() < 1e-9);
        // Bottom at level 2: 10.0 + 10.0 * 2 * 0.06 * 0.5 = 10.6
        assert!((table.get(0.06).unwrap().bottom_exposure - 10.6).abs() < 1e-9);
    }

    #[test]
    fn test_manual_table_verbatim() {
        let store = scenario_store();
        let config = StackConfig::default()
            .exposure_set_type(ExposureSetType::Manual)
            .manual_exposure_table(vec![ManualExposure {
                layer_height: 0.04,
                bottom_exposure: 11.0,
                exposure: 4.5,
            }]);
        let table = ExposureTable::build(&config, &store);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(0.04),
            Some(&ExposureItem {
                layer_height: 0.04,
                bottom_exposure: 11.0,
                exposure: 4.5
            })
        );
        assert!(table.get(0.02).is_none());
    }

    #[test]
    fn test_apply_rewrites_and_marks_layers() {
        let store = scenario_store();
        let config = StackConfig::default().exposure_steps(0.5, 0.2);
        let scheduler = ExposureScheduler::new(&config, &store);
        let mut layers = vec![
            Layer::new(0, 0.02, 0.02, Frame::new(4, 4)),
            Layer::new(1, 0.08, 0.06, Frame::new(4, 4)),
        ];
        scheduler.apply(&mut layers).unwrap();
        assert!((layers[0].exposure_time - 3.0).abs() < 1e-9);
        assert!((layers[1].exposure_time - 3.4).abs() < 1e-9);
        assert!((layers[1].bottom_exposure_time - 11.0).abs() < 1e-9);
        assert!(layers[1].is_modified);
    }

    #[test]
    fn test_apply_fails_on_missing_entry() {
        let store = scenario_store();
        let config = StackConfig::default()
            .exposure_set_type(ExposureSetType::Manual)
            .manual_exposure_table(Vec::new());
        let scheduler = ExposureScheduler::new(&config, &store);
        let mut layers = vec![Layer::new(0, 0.02, 0.02, Frame::new(4, 4))];
        assert!(scheduler.apply(&mut layers).is_err());
    }
}

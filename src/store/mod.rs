//! Layer storage - the ordered, mutable layer sequence of a project.
//!
//! [`LayerStore`] owns every [`Layer`] of the model, the uniform base layer
//! height, the bottom/normal exposure defaults and the total print-time
//! accounting. The optimizer borrows buffers from it during the scan and
//! hands a complete replacement sequence back in one atomic
//! [`LayerStore::replace_layers`] call; a cancelled or failed run never
//! touches the stored sequence.
//!
//! Value setters return whether the value actually changed, and derived
//! fields (the print time) are recomputed explicitly by the owner instead
//! of through implicit change notifications.

use crate::buffer::Frame;
use crate::{round_height, Error, Result};
use serde::{Deserialize, Serialize};

/// Seconds of non-exposure overhead (lift, retract, settle) per layer.
pub const DEFAULT_LIFT_OVERHEAD: f64 = 6.0;

/// One raster slice of the model at a given build height.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Ordinal position in the sequence; reassigned on commit.
    pub index: usize,
    /// Cumulative height from the build plate to the top of this layer (mm).
    pub position_z: f64,
    /// Physical thickness of this layer (mm).
    pub height: f64,
    /// Normal exposure time (s).
    pub exposure_time: f64,
    /// Bottom exposure time (s), used while the layer is within the
    /// bottom-layer count.
    pub bottom_exposure_time: f64,
    /// Decoded pixel buffer.
    pub buffer: Frame,
    /// Set when the optimizer produced or altered this layer.
    pub is_modified: bool,
}

impl Layer {
    /// Create a layer with the given geometry and the store's exposure
    /// defaults to be filled in by the scheduler.
    pub fn new(index: usize, position_z: f64, height: f64, buffer: Frame) -> Self {
        Self {
            index,
            position_z: round_height(position_z),
            height: round_height(height),
            exposure_time: 0.0,
            bottom_exposure_time: 0.0,
            buffer,
            is_modified: false,
        }
    }
}

/// Capabilities and defaults of the underlying slicer format, serialized in
/// the project manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Uniform base layer height before merging (mm).
    pub layer_height: f64,
    /// Number of bottom layers (longer exposure for plate adhesion).
    pub bottom_layer_count: usize,
    /// Default bottom exposure time (s).
    pub bottom_exposure_time: f64,
    /// Default normal exposure time (s).
    pub exposure_time: f64,
    /// Whether the format supports per-layer height and exposure values.
    pub per_layer_settings: bool,
    /// Non-exposure overhead per layer (s).
    pub lift_overhead: f64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            layer_height: 0.05,
            bottom_layer_count: 4,
            bottom_exposure_time: 30.0,
            exposure_time: 3.0,
            per_layer_settings: true,
            lift_overhead: DEFAULT_LIFT_OVERHEAD,
        }
    }
}

/// Indexed, mutable sequence of layers with print-time accounting.
#[derive(Clone, Debug)]
pub struct LayerStore {
    layers: Vec<Layer>,
    settings: StoreSettings,
    resolution: (usize, usize),
    print_time: f64,
    suppress_recompute: bool,
}

impl LayerStore {
    /// Create a store from a layer sequence and format settings.
    ///
    /// Layer resolution is taken from the first layer; every layer must
    /// share it.
    pub fn new(layers: Vec<Layer>, settings: StoreSettings) -> Result<Self> {
        let resolution = layers
            .first()
            .map(|l| (l.buffer.width(), l.buffer.height()))
            .unwrap_or((0, 0));
        if let Some(bad) = layers
            .iter()
            .find(|l| (l.buffer.width(), l.buffer.height()) != resolution)
        {
            return Err(Error::Project(format!(
                "layer {} resolution {}x{} differs from {}x{}",
                bad.index,
                bad.buffer.width(),
                bad.buffer.height(),
                resolution.0,
                resolution.1
            )));
        }
        let mut store = Self {
            layers,
            settings,
            resolution,
            print_time: 0.0,
            suppress_recompute: false,
        };
        store.recompute_print_time();
        Ok(store)
    }

    /// Number of layers.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Image resolution shared by every layer (width, height).
    #[inline]
    pub fn resolution(&self) -> (usize, usize) {
        self.resolution
    }

    /// Borrow a layer by index.
    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    /// Borrow a layer mutably by index. Callers altering geometry fields
    /// are responsible for recomputing derived values afterwards.
    pub fn layer_mut(&mut self, index: usize) -> &mut Layer {
        &mut self.layers[index]
    }

    /// Borrow the full layer sequence.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Borrow a layer's pixel buffer by index.
    pub fn buffer(&self, index: usize) -> &Frame {
        &self.layers[index].buffer
    }

    /// Format settings.
    #[inline]
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Uniform base layer height (mm).
    #[inline]
    pub fn layer_height(&self) -> f64 {
        self.settings.layer_height
    }

    /// Number of bottom layers.
    #[inline]
    pub fn bottom_layer_count(&self) -> usize {
        self.settings.bottom_layer_count
    }

    /// Whether the format can carry per-layer heights and exposures.
    #[inline]
    pub fn supports_per_layer_settings(&self) -> bool {
        self.settings.per_layer_settings
    }

    /// Total print time (s), derived from the current sequence.
    #[inline]
    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    /// Set the base layer height. Returns whether the value changed.
    pub fn set_layer_height(&mut self, height: f64) -> bool {
        let rounded = round_height(height);
        if self.settings.layer_height == rounded {
            return false;
        }
        self.settings.layer_height = rounded;
        true
    }

    /// Set the bottom-layer count. Returns whether the value changed.
    pub fn set_bottom_layer_count(&mut self, count: usize) -> bool {
        if self.settings.bottom_layer_count == count {
            return false;
        }
        self.settings.bottom_layer_count = count;
        true
    }

    /// Set the default bottom exposure. Returns whether the value changed.
    pub fn set_bottom_exposure_time(&mut self, seconds: f64) -> bool {
        if self.settings.bottom_exposure_time == seconds {
            return false;
        }
        self.settings.bottom_exposure_time = seconds;
        true
    }

    /// Set the default normal exposure. Returns whether the value changed.
    pub fn set_exposure_time(&mut self, seconds: f64) -> bool {
        if self.settings.exposure_time == seconds {
            return false;
        }
        self.settings.exposure_time = seconds;
        true
    }

    /// Suppress print-time recomputation during a bulk structural change.
    pub fn suspend_recompute(&mut self) {
        self.suppress_recompute = true;
    }

    /// Re-enable and immediately perform print-time recomputation.
    pub fn resume_recompute(&mut self) {
        self.suppress_recompute = false;
        self.recompute_print_time();
    }

    /// Recompute the total print time from the layer sequence: each layer
    /// contributes its effective exposure (bottom exposure while within the
    /// bottom-layer count) plus the per-layer lift overhead.
    pub fn recompute_print_time(&mut self) {
        if self.suppress_recompute {
            return;
        }
        let bottom = self.settings.bottom_layer_count;
        self.print_time = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let exposure = if i < bottom {
                    l.bottom_exposure_time
                } else {
                    l.exposure_time
                };
                exposure + self.settings.lift_overhead
            })
            .sum();
    }

    /// Replace the entire layer sequence in one atomic step: re-index,
    /// then recompute the print time (unless suppressed).
    pub fn replace_layers(&mut self, mut layers: Vec<Layer>) {
        for (i, layer) in layers.iter_mut().enumerate() {
            layer.index = i;
        }
        self.layers = layers;
        self.recompute_print_time();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Store of `count` identical blank layers at a uniform height.
    pub(crate) fn uniform_store(count: usize, height: f64) -> LayerStore {
        let frames: Vec<Frame> = (0..count).map(|_| Frame::new(4, 4)).collect();
        store_from_frames(frames, height)
    }

    /// Store built from explicit per-layer frames at a uniform height.
    pub(crate) fn store_from_frames(frames: Vec<Frame>, height: f64) -> LayerStore {
        let layers: Vec<Layer> = frames
            .into_iter()
            .enumerate()
            .map(|(i, buffer)| {
                let mut layer = Layer::new(i, height * (i + 1) as f64, height, buffer);
                layer.exposure_time = 3.0;
                layer.bottom_exposure_time = 30.0;
                layer
            })
            .collect();
        let settings = StoreSettings {
            layer_height: height,
            bottom_layer_count: 2,
            ..StoreSettings::default()
        };
        LayerStore::new(layers, settings).unwrap()
    }
}

//! Project container I/O.
//!
//! A project is a directory holding a `manifest.json` plus one raw
//! grayscale file per layer (row-major, one byte per pixel, at the
//! manifest resolution). It is the minimal interchange the CLI works on;
//! vendor slicer formats are external to this crate.

use crate::buffer::Frame;
use crate::store::{Layer, LayerStore, StoreSettings};
use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const MANIFEST_NAME: &str = "manifest.json";

/// One layer's manifest record.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayerRecord {
    /// Buffer file name, relative to the project directory.
    file: String,
    /// Cumulative height (mm).
    position_z: f64,
    /// Layer thickness (mm).
    height: f64,
    /// Normal exposure time (s).
    exposure_time: f64,
    /// Bottom exposure time (s).
    bottom_exposure_time: f64,
}

/// The on-disk project manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Manifest {
    /// Buffer resolution (width, height) in pixels.
    resolution: (usize, usize),
    /// Format settings and exposure defaults.
    settings: StoreSettings,
    /// Per-layer records in build order.
    layers: Vec<LayerRecord>,
}

/// Loads and saves project directories.
pub struct Project;

impl Project {
    /// Load a project directory into a [`LayerStore`].
    pub fn load(dir: impl AsRef<Path>) -> Result<LayerStore> {
        let dir = dir.as_ref();
        let manifest_path = dir.join(MANIFEST_NAME);
        let text = fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| {
            Error::Project(format!("{}: {e}", manifest_path.display()))
        })?;
        let (width, height) = manifest.resolution;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (index, record) in manifest.layers.iter().enumerate() {
            let data = fs::read(dir.join(&record.file))?;
            let buffer = Frame::from_data(width, height, data).ok_or_else(|| {
                Error::Project(format!(
                    "layer buffer {} does not match the {width}x{height} resolution",
                    record.file
                ))
            })?;
            let mut layer = Layer::new(index, record.position_z, record.height, buffer);
            layer.exposure_time = record.exposure_time;
            layer.bottom_exposure_time = record.bottom_exposure_time;
            layers.push(layer);
        }
        debug!("loaded {} layers from {}", layers.len(), dir.display());
        LayerStore::new(layers, manifest.settings)
    }

    /// Save a [`LayerStore`] as a project directory, overwriting any
    /// existing manifest and buffer files.
    pub fn save(dir: impl AsRef<Path>, store: &LayerStore) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut records = Vec::with_capacity(store.layer_count());
        for layer in store.layers() {
            let file = format!("layer_{:05}.gray", layer.index);
            fs::write(dir.join(&file), layer.buffer.data())?;
            records.push(LayerRecord {
                file,
                position_z: layer.position_z,
                height: layer.height,
                exposure_time: layer.exposure_time,
                bottom_exposure_time: layer.bottom_exposure_time,
            });
        }

        let manifest = Manifest {
            resolution: store.resolution(),
            settings: store.settings().clone(),
            layers: records,
        };
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::Project(e.to_string()))?;
        fs::write(dir.join(MANIFEST_NAME), text)?;
        debug!("saved {} layers to {}", store.layer_count(), dir.display());
        Ok(())
    }
}

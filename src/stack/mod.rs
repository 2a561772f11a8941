//! The stacking loop - merges runs of thin layers into thicker ones.
//!
//! [`StackBuilder`] drives the whole optimization:
//!
//! 1. Seed a window at the current layer with its raw buffer.
//! 2. Try to extend: diff the next binarized frame against the window
//!    tail, fold the disagreement into the window's union mask, and ask
//!    the convergence checker whether the accumulated difference still
//!    erodes away. Identical frames extend without eroding.
//! 3. On acceptance, max-merge the next raw buffer into the accumulation
//!    and grow the height by one base increment; on rejection, roll the
//!    attempt back and close the window at its previous height.
//! 4. A closed window emits one output layer whose Z position must land
//!    exactly on the original model's position at the window tail;
//!    any drift aborts the run.
//!
//! The scan is strictly sequential (each window's position depends on the
//! previous one). Cancellation is checked once per extension attempt and
//! once per close; a cancelled or failed run leaves the store untouched -
//! the new sequence is committed in a single atomic replacement only after
//! the full range has been scanned and rescheduled.

use crate::buffer::Frame;
use crate::cache::FrameCache;
use crate::config::StackConfig;
use crate::exposure::ExposureScheduler;
use crate::morphology::{ConvergenceChecker, DifferenceEvaluator};
use crate::report::{Report, ReportBuilder};
use crate::store::{Layer, LayerStore};
use crate::{height_eq, height_um, round_height, Error, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the caller and the run.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the run stops at its next checkpoint.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Transient state of the window being grown. Lives for one outer loop
/// iteration and is discarded on closure.
struct StackingWindow {
    /// First input index in the window.
    start: usize,
    /// Last accepted input index.
    tail: usize,
    /// Accumulated merged height (mm).
    height: f64,
    /// Pixel-wise maximum of all accepted raw buffers.
    accumulated: Frame,
    /// Cumulative disagreement across all pairs considered so far.
    union_mask: Frame,
}

impl StackingWindow {
    fn seed(index: usize, base_height: f64, raw: Frame) -> Self {
        let (w, h) = (raw.width(), raw.height());
        Self {
            start: index,
            tail: index,
            height: base_height,
            accumulated: raw,
            union_mask: Frame::new(w, h),
        }
    }

    fn size(&self) -> usize {
        self.tail - self.start + 1
    }
}

/// The dynamic layer-height optimizer.
pub struct StackBuilder {
    config: StackConfig,
    cancel: CancelToken,
}

impl StackBuilder {
    /// Create an optimizer for the given run parameters.
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The run's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The run parameters.
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Run the optimization on `store`, reporting progress in `[0, 1]`.
    ///
    /// On success the store holds the merged, rescheduled sequence and the
    /// returned [`Report`] summarizes the run. On any error - including
    /// cancellation - the store is left exactly as it was.
    pub fn run<F>(&self, store: &mut LayerStore, mut progress: F) -> Result<Report>
    where
        F: FnMut(f64),
    {
        self.config.check(store)?;

        let base = store.layer_height();
        let (start, end) = self.config.resolved_range(store);
        let max_um = height_um(self.config.maximum_layer_height);
        let evaluator = DifferenceEvaluator;
        let checker = ConvergenceChecker::new(self.config.maximum_erodes);
        let mut report = ReportBuilder::new(store.layer_count(), store.print_time());
        let mut output: Vec<Layer> = Vec::with_capacity(store.layer_count());

        info!(
            "stacking layers {start}..={end} of {} (base {base:.2} mm, max {:.2} mm)",
            store.layer_count(),
            self.config.maximum_layer_height
        );

        // Layers below the range pass through unchanged.
        for index in 0..start {
            let layer = store.layer(index).clone();
            report.record_passthrough(layer.height);
            output.push(layer);
        }

        {
            let mut cache = FrameCache::new(
                store,
                self.config.cache_ram_budget,
                self.config.strip_antialiasing,
            );

            let mut previous_z = if start == 0 {
                0.0
            } else {
                store.layer(start - 1).position_z
            };
            let span = (end - start + 1) as f64;
            let mut index = start;

            while index <= end {
                // SeedWindow
                let seed = cache.get(index)?.clone();
                let mut window = StackingWindow::seed(index, base, seed);

                // TryExtend
                loop {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let next = window.tail + 1;
                    if next > end || height_um(window.height + base) > max_um {
                        // No further growth possible; close on the current
                        // accumulation.
                        break;
                    }

                    let accepted = {
                        // Pinning the tail keeps the comparison pair
                        // resident while the successor loads.
                        let (tail_slot, next_slot) = cache.fetch_pair(window.tail, next)?;
                        let diff = evaluator.diff(tail_slot.binarized(), next_slot.binarized());
                        let identical = diff.is_blank();
                        evaluator.fold(&mut window.union_mask, &diff);
                        if identical || checker.converged(&window.union_mask) {
                            // AcceptExtend
                            window.accumulated.max_in_place(next_slot.raw());
                            true
                        } else {
                            false
                        }
                    };

                    if accepted {
                        window.height = round_height(window.height + base);
                        window.tail = next;
                    } else {
                        // RejectExtend: the attempted frame stays out; it
                        // seeds the next window, so keep it resident.
                        cache.pin(next);
                        break;
                    }
                }

                // CloseWindow
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let position = round_height(previous_z + window.height);
                let original = store.layer(window.tail).position_z;
                if !height_eq(position, original) {
                    return Err(Error::Integrity {
                        index: window.tail,
                        expected: original,
                        actual: position,
                    });
                }

                // Taking the accumulation out of the window ends its life;
                // grab the size first.
                let size = window.size();
                let buffer = if self.config.strip_antialiasing
                    && self.config.reconstruct_antialiasing
                {
                    window.accumulated.gaussian_blur_3x3()
                } else {
                    window.accumulated
                };
                let mut layer = Layer::new(output.len(), position, window.height, buffer);
                layer.is_modified = size >= 2 || self.config.strip_antialiasing;
                debug!(
                    "window {}..={} closed: {size} layer(s), {:.3} mm at z {:.3}",
                    window.start, window.tail, window.height, position
                );
                report.record_window(size, window.height);
                output.push(layer);

                previous_z = position;
                index = window.tail + 1;
                progress(((index - start) as f64 / span).min(1.0));
            }
        }

        // Layers above the range pass through unchanged.
        for index in end + 1..store.layer_count() {
            let layer = store.layer(index).clone();
            report.record_passthrough(layer.height);
            output.push(layer);
        }

        // Re-schedule exposures on the layers the scan produced; layers
        // outside the range keep their original values.
        let scheduler = ExposureScheduler::new(&self.config, store);
        let tail_passthrough = store.layer_count() - end - 1;
        let scheduled_end = output.len() - tail_passthrough;
        scheduler.apply(&mut output[start..scheduled_end])?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Atomic commit: the store changes only on full success.
        store.suspend_recompute();
        store.replace_layers(output);
        store.resume_recompute();
        progress(1.0);

        Ok(report.finish(store.print_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::store_from_frames;
    use crate::store::LayerStore;

    const W: usize = 8;

    fn blank() -> Frame {
        Frame::new(W, W)
    }

    fn full() -> Frame {
        Frame::from_data(W, W, vec![255; W * W]).unwrap()
    }

    fn blob() -> Frame {
        let mut f = Frame::new(W, W);
        for y in 2..6 {
            for x in 2..6 {
                f.set(x, y, 255);
            }
        }
        f
    }

    fn config() -> StackConfig {
        StackConfig::default()
            .minimum_layer_height(0.03)
            .maximum_layer_height(0.10)
            .maximum_erodes(10)
    }

    fn assert_monotonic_z(store: &LayerStore) {
        let mut previous = 0.0;
        for layer in store.layers() {
            assert!(
                height_eq(layer.position_z, previous + layer.height),
                "layer {} breaks monotonic z: {} != {} + {}",
                layer.index,
                layer.position_z,
                previous,
                layer.height
            );
            previous = layer.position_z;
        }
    }

    fn total_height(store: &LayerStore) -> f64 {
        round_height(store.layers().iter().map(|l| l.height).sum())
    }

    #[test]
    fn test_scenario_full_merge() {
        // Five identical layers at 0.02 mm merge into one 0.10 mm layer.
        let mut store = store_from_frames(vec![blob(); 5], 0.02);
        let report = StackBuilder::new(config()).run(&mut store, |_| {}).unwrap();

        assert_eq!(store.layer_count(), 1);
        assert!(height_eq(store.layer(0).height, 0.10));
        assert!(height_eq(store.layer(0).position_z, 0.10));
        assert_eq!(report.stacked_layers, 5);
        assert_eq!(report.reused_layers, 0);
        assert!(height_eq(report.maximum_layer_height, 0.10));
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_scenario_no_merge_possible() {
        // Adjacent layers disagree everywhere; the union mask reflects at
        // the borders and never erodes away, so every window closes at
        // size one.
        let frames = vec![blank(), full(), blank(), full(), blank()];
        let mut store = store_from_frames(frames, 0.02);
        let report = StackBuilder::new(config()).run(&mut store, |_| {}).unwrap();

        assert_eq!(store.layer_count(), 5);
        for layer in store.layers() {
            assert!(height_eq(layer.height, 0.02));
        }
        assert_eq!(report.stacked_layers, 0);
        assert_eq!(report.reused_layers, 5);
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_scenario_partial_merge() {
        // Layers 0-1 converge (0.04 mm, above the 0.03 mm minimum). The
        // blob/full disagreement needs two erosion steps, so a bound of
        // one rejects layer 2, which then seeds a window merging 2-4.
        let frames = vec![blob(), blob(), full(), full(), full()];
        let mut store = store_from_frames(frames, 0.02);
        let report = StackBuilder::new(config().maximum_erodes(1))
            .run(&mut store, |_| {})
            .unwrap();

        assert_eq!(store.layer_count(), 2);
        assert!(height_eq(store.layer(0).height, 0.04));
        assert!(height_eq(store.layer(0).position_z, 0.04));
        assert!(height_eq(store.layer(1).height, 0.06));
        assert!(height_eq(store.layer(1).position_z, 0.10));
        assert_eq!(report.stacked_layers, 5);
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_height_conservation() {
        let frames = vec![blob(), blob(), full(), blank(), blank(), blank(), blob()];
        let mut store = store_from_frames(frames, 0.02);
        let before = total_height(&store);
        StackBuilder::new(config()).run(&mut store, |_| {}).unwrap();
        assert!(height_eq(total_height(&store), before));
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_progress_guarantee_on_long_hostile_input() {
        // Alternating frames reject every extension; the scan must still
        // terminate with one output per input.
        let frames: Vec<Frame> = (0..40)
            .map(|i| if i % 2 == 0 { blank() } else { full() })
            .collect();
        let mut store = store_from_frames(frames, 0.02);
        let report = StackBuilder::new(config()).run(&mut store, |_| {}).unwrap();
        assert_eq!(report.new_layer_count, 40);
    }

    #[test]
    fn test_small_cache_budget_matches_large() {
        let frames = vec![blob(), blob(), full(), full(), blob()];
        let mut small = store_from_frames(frames.clone(), 0.02);
        let mut large = store_from_frames(frames, 0.02);
        // Two entries vs effectively unlimited.
        StackBuilder::new(config().cache_ram_budget(1))
            .run(&mut small, |_| {})
            .unwrap();
        StackBuilder::new(config().cache_ram_budget(usize::MAX))
            .run(&mut large, |_| {})
            .unwrap();
        assert_eq!(small.layer_count(), large.layer_count());
        for (a, b) in small.layers().iter().zip(large.layers()) {
            assert!(height_eq(a.height, b.height));
            assert_eq!(a.buffer, b.buffer);
        }
    }

    #[test]
    fn test_range_restriction_passes_outside_layers_through() {
        let frames = vec![blob(); 6];
        let mut store = store_from_frames(frames, 0.02);
        let config = config().layer_range(2, 4);
        let report = StackBuilder::new(config).run(&mut store, |_| {}).unwrap();

        // Layers 0,1 and 5 untouched; 2..=4 merge to one 0.06 mm layer.
        assert_eq!(store.layer_count(), 4);
        assert!(height_eq(store.layer(0).height, 0.02));
        assert!(height_eq(store.layer(1).height, 0.02));
        assert!(height_eq(store.layer(2).height, 0.06));
        assert!(height_eq(store.layer(2).position_z, 0.10));
        assert!(height_eq(store.layer(3).height, 0.02));
        assert!(height_eq(store.layer(3).position_z, 0.12));
        assert_eq!(report.stacked_layers, 3);
        assert_eq!(report.reused_layers, 3);
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_compression_ratio_on_run() {
        let mut store = store_from_frames(vec![blob(); 5], 0.02);
        let report = StackBuilder::new(config()).run(&mut store, |_| {}).unwrap();
        assert_eq!(report.compression_ratio(), 500.0);
        assert!(report.spared_time() > 0.0);
    }

    #[test]
    fn test_corrupted_position_aborts_without_commit() {
        let mut store = store_from_frames(vec![blob(); 5], 0.02);
        store.layer_mut(2).position_z = 0.09;
        let snapshot: Vec<f64> = store.layers().iter().map(|l| l.position_z).collect();

        let err = StackBuilder::new(config()).run(&mut store, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported(_) | Error::Integrity { .. }
        ));
        // Nothing committed.
        assert_eq!(store.layer_count(), 5);
        let after: Vec<f64> = store.layers().iter().map(|l| l.position_z).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn test_cancellation_leaves_store_untouched() {
        let mut store = store_from_frames(vec![blob(); 5], 0.02);
        let builder = StackBuilder::new(config());
        builder.cancel_token().cancel();
        let err = builder.run(&mut store, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.layer_count(), 5);
        for layer in store.layers() {
            assert!(height_eq(layer.height, 0.02));
        }
    }

    #[test]
    fn test_exposures_rescheduled_per_height() {
        let frames = vec![blob(), blob(), full(), full(), full()];
        let mut store = store_from_frames(frames, 0.02);
        store.set_bottom_exposure_time(10.0);
        store.set_exposure_time(3.0);
        let config = config()
            .maximum_erodes(1)
            .iterate_bottom_exposure_time(true)
            .exposure_steps(0.5, 0.2);
        StackBuilder::new(config).run(&mut store, |_| {}).unwrap();

        // 0.04 mm is level 1, 0.06 mm level 2.
        assert!((store.layer(0).exposure_time - 3.2).abs() < 1e-9);
        assert!((store.layer(0).bottom_exposure_time - 10.5).abs() < 1e-9);
        assert!((store.layer(1).exposure_time - 3.4).abs() < 1e-9);
    }

    #[test]
    fn test_strip_and_reconstruct_antialiasing() {
        // Grayscale frames: stripping binarizes, reconstruction re-blurs.
        let mut f = Frame::new(W, W);
        for y in 2..6 {
            for x in 2..6 {
                f.set(x, y, 200);
            }
        }
        let mut store = store_from_frames(vec![f.clone(), f], 0.02);
        let config = config()
            .maximum_layer_height(0.04)
            .strip_antialiasing(true)
            .reconstruct_antialiasing(true);
        StackBuilder::new(config).run(&mut store, |_| {}).unwrap();

        assert_eq!(store.layer_count(), 1);
        let buffer = &store.layer(0).buffer;
        // Interior saturates to 255 after binarization, edges soften.
        assert_eq!(buffer.get(3, 3), 255);
        let edge = buffer.get(2, 2);
        assert!(edge > 0 && edge < 255);
        assert!(store.layer(0).is_modified);
    }

    #[test]
    fn test_closed_windows_carry_modified_flags() {
        // With no erosion allowance only identical frames merge; the merged
        // window's layer is marked modified, size-one windows are not.
        let frames = vec![blob(), blob(), full(), blank()];
        let mut store = store_from_frames(frames, 0.02);
        StackBuilder::new(config().maximum_erodes(0))
            .run(&mut store, |_| {})
            .unwrap();
        assert_eq!(store.layer_count(), 3);
        assert!(store.layer(0).is_modified);
        assert!(!store.layer(1).is_modified);
        assert!(!store.layer(2).is_modified);
    }

    #[test]
    fn test_quarter_hundredth_base_height() {
        // 0.025 mm models put positions on micrometer boundaries; they must
        // pass the offset precondition and merge cleanly.
        let mut store = store_from_frames(vec![blob(); 4], 0.025);
        let config = StackConfig::default()
            .minimum_layer_height(0.05)
            .maximum_layer_height(0.10);
        let report = StackBuilder::new(config).run(&mut store, |_| {}).unwrap();

        assert_eq!(store.layer_count(), 1);
        assert!(height_eq(store.layer(0).height, 0.10));
        assert!(height_eq(store.layer(0).position_z, 0.10));
        assert_eq!(report.stacked_layers, 4);
        assert_monotonic_z(&store);
    }

    #[test]
    fn test_progress_is_monotonic_and_completes() {
        let mut store = store_from_frames(vec![blob(); 6], 0.02);
        let mut seen = Vec::new();
        StackBuilder::new(config())
            .run(&mut store, |p| seen.push(p))
            .unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }
}

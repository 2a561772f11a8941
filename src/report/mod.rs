//! Run summary reporting.
//!
//! [`ReportBuilder`] collects the counters the stacking loop produces and
//! the before/after store statistics, and folds them into an immutable
//! [`Report`] for display. Pure aggregation, no side effects.

use std::fmt;

/// Round to two decimal places, the precision the summary displays.
#[inline]
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Summary of one optimizer run.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    /// Layer count before the run.
    pub old_layer_count: usize,
    /// Layer count after the run.
    pub new_layer_count: usize,
    /// Input layers consumed by windows of two or more.
    pub stacked_layers: usize,
    /// Input layers kept as-is (old - stacked).
    pub reused_layers: usize,
    /// Largest merged layer height produced (mm).
    pub maximum_layer_height: f64,
    /// Total print time before the run (s).
    pub old_print_time: f64,
    /// Total print time after the run (s).
    pub new_print_time: f64,
}

impl Report {
    /// Old-to-new layer count ratio as a percentage, rounded to two
    /// decimals. 100.0 means nothing was merged.
    pub fn compression_ratio(&self) -> f64 {
        if self.new_layer_count == 0 {
            return 0.0;
        }
        round2(self.old_layer_count as f64 / self.new_layer_count as f64 * 100.0)
    }

    /// Print time saved by the run (s), rounded to two decimals.
    pub fn spared_time(&self) -> f64 {
        round2(self.old_print_time - self.new_print_time)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Layer stacking summary")?;
        writeln!(
            f,
            "  Layers:            {} -> {}",
            self.old_layer_count, self.new_layer_count
        )?;
        writeln!(f, "  Stacked layers:    {}", self.stacked_layers)?;
        writeln!(f, "  Reused layers:     {}", self.reused_layers)?;
        writeln!(
            f,
            "  Max layer height:  {:.3} mm",
            self.maximum_layer_height
        )?;
        writeln!(f, "  Compression ratio: {:.2}%", self.compression_ratio())?;
        writeln!(
            f,
            "  Print time:        {:.0} s -> {:.0} s ({:.2} s spared)",
            self.old_print_time,
            self.new_print_time,
            self.spared_time()
        )
    }
}

/// Accumulates counters during a run and finishes into a [`Report`].
#[derive(Clone, Debug, Default)]
pub struct ReportBuilder {
    old_layer_count: usize,
    new_layer_count: usize,
    stacked_layers: usize,
    maximum_layer_height: f64,
    old_print_time: f64,
    new_print_time: f64,
}

impl ReportBuilder {
    /// Start a report, capturing the pre-run store statistics.
    pub fn new(old_layer_count: usize, old_print_time: f64) -> Self {
        Self {
            old_layer_count,
            old_print_time,
            ..Self::default()
        }
    }

    /// Record one closed window of `size` input layers merged to `height`.
    pub fn record_window(&mut self, size: usize, height: f64) {
        self.new_layer_count += 1;
        if size >= 2 {
            self.stacked_layers += size;
        }
        if height > self.maximum_layer_height {
            self.maximum_layer_height = height;
        }
    }

    /// Record one layer passed through unchanged (outside the range).
    pub fn record_passthrough(&mut self, height: f64) {
        self.new_layer_count += 1;
        if height > self.maximum_layer_height {
            self.maximum_layer_height = height;
        }
    }

    /// Capture the post-run print time and produce the report.
    pub fn finish(self, new_print_time: f64) -> Report {
        Report {
            old_layer_count: self.old_layer_count,
            new_layer_count: self.new_layer_count,
            stacked_layers: self.stacked_layers,
            reused_layers: self.old_layer_count - self.stacked_layers,
            maximum_layer_height: self.maximum_layer_height,
            old_print_time: self.old_print_time,
            new_print_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_ratio_formula() {
        let mut builder = ReportBuilder::new(10, 300.0);
        builder.record_window(5, 0.10);
        builder.record_window(5, 0.10);
        builder.record_window(1, 0.02);
        let report = builder.finish(120.0);
        // Formula check: round(old/new * 100, 2).
        assert_eq!(report.compression_ratio(), round2(10.0 / 3.0 * 100.0));
        assert_eq!(report.compression_ratio(), 333.33);
    }

    #[test]
    fn test_reused_is_old_minus_stacked() {
        let mut builder = ReportBuilder::new(7, 100.0);
        builder.record_window(4, 0.08); // stacked
        builder.record_window(1, 0.02); // reused
        builder.record_passthrough(0.02);
        builder.record_passthrough(0.02);
        builder.record_window(1, 0.02);
        let report = builder.finish(80.0);
        assert_eq!(report.stacked_layers, 4);
        assert_eq!(report.reused_layers, 3);
        assert_eq!(report.new_layer_count, 5);
    }

    #[test]
    fn test_spared_time_rounds() {
        let builder = ReportBuilder::new(3, 100.005);
        let report = builder.finish(50.0);
        assert_eq!(report.spared_time(), 50.01);
    }

    #[test]
    fn test_max_height_tracked() {
        let mut builder = ReportBuilder::new(6, 0.0);
        builder.record_window(3, 0.06);
        builder.record_window(2, 0.04);
        builder.record_window(1, 0.02);
        let report = builder.finish(0.0);
        assert!((report.maximum_layer_height - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_display_contains_summary() {
        let report = ReportBuilder::new(4, 60.0).finish(30.0);
        let text = format!("{report}");
        assert!(text.contains("Compression ratio"));
        assert!(text.contains("4 -> 0"));
    }
}

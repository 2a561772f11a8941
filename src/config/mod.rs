//! Run configuration for the optimizer.

mod stack_config;

pub use stack_config::{ExposureSetType, ManualExposure, StackConfig, DEFAULT_CACHE_RAM_BUDGET};

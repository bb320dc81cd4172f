//! Passive resource accounting for the pool and realtime layers

pub mod usage;

pub use usage::{
    LabelStats, MonitorConfig, OptimizationSuggestion, ResourceUsageMonitor, Severity,
    SuggestionCategory, UsageSnapshot,
};

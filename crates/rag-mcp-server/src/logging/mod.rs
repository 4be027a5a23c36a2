//! Usage logging module with async queue mechanism

pub mod usage;

pub use usage::{UsageLogger, UsageSink};

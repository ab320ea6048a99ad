//! Analysis-ready series from canonical quotes
//!
//! Session filtering, resampling, gap fill and indicator columns over one
//! symbol's canonical history, plus summary and missing-data reports.

pub mod calendar;
pub mod gap_fill;
pub mod indicators;
pub mod missing;
pub mod pipeline;
pub mod resample;
pub mod session;
pub mod summary;

pub const SERVICE_VERSION: &str = "0.1.0";

//! Backend statistics
//!
//! - [`engine`]: engine-internal load scraped from each backend
//! - [`request`]: rolling windows of completed requests
//! - [`log`]: periodic summary in the log

pub mod engine;
pub mod log;
pub mod request;

pub use engine::{
    EngineStatSnapshot, EngineStatsScraper, EngineStatsStore, EngineStatus, ScrapeReport,
    ScraperConfig,
};
pub use log::{log_summary, BackendSummary, StatsLogger};
pub use request::{
    RequestStatWindow, RequestStats, RequestStatsConfig, RequestStatsMonitor, StatKey,
};

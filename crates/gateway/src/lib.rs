pub mod columns;
pub mod config;
pub mod http;
pub mod metrics;
pub mod report_source;
pub mod reporting;
pub mod sessions;
pub mod settings;

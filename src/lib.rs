pub mod cache;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod delta;
pub mod fetch;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod timeseries;
pub mod upstream;

pub mod config;
pub mod listener;
pub mod status;
pub mod telemetry;

pub mod agent;
pub mod bootstrap;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod notify;
pub mod provider;
pub mod provision;
pub mod telemetry;

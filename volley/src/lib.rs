//! The `volley` bulk dispatcher
//!
//! Ties the dispatch engine to its configuration file, metrics exporter and
//! process signals. Campaigns come from the simulation section of the config.

pub mod config;
pub mod controller;
pub mod simulation;

pub use config::Volley;

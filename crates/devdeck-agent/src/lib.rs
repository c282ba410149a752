pub mod config;
pub mod correlator;
pub mod error;
pub mod http;
pub mod observer_hub;
pub mod ports;
pub mod process_table;
pub mod reconciler;
pub mod script_runner;
pub mod security;
pub mod signal;
pub mod state;

// Public API - the runner plus the pieces it is built from
pub mod collaborators;
pub mod coordination;
pub mod error;
pub mod runner;
pub mod store;
pub mod telemetry;

// Internal modules
mod config;

#[cfg(test)]
mod integ_tests;

//! # cockpit
//!
//! Runs timed microscope experiments: an experiment strategy builds an
//! action table, executors play it on hardware and the camera images end up
//! in a DV file.
//!
//! This crate wires the workspace together for the command line:
//! - [`config`]: Figment configuration (TOML plus `COCKPIT_` environment)
//! - [`tracing_init`]: subscriber setup
//! - [`rig`]: the simulated rig described by the configuration
//! - [`acquisition`]: experiment requests as given on the command line
//!
//! The engine itself lives in the member crates, re-exported here.

pub mod acquisition;
pub mod config;
pub mod rig;
pub mod tracing_init;

pub use cockpit_core as core;
pub use cockpit_driver_mock as driver_mock;
pub use cockpit_executor as executor;
pub use cockpit_experiment as experiment;
pub use cockpit_storage as storage;

#![warn(missing_docs)]

//! vxfer command-line driver: configuration layering and the two-role runner.

pub mod cli;
pub mod config;
pub mod runner;

pub use config::VxferConfig;
pub use runner::{RepeatedReport, Report};

//! Kubernetes operator wiring the operation cache controllers

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod startup;

pub use config::Cli;

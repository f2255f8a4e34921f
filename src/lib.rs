//! CandyPack - a single-node control plane for websites and background services
//!
//! This library provides:
//! - A crash-safe configuration store split into per-module JSON files, with
//!   atomic writes, corruption recovery and legacy single-file migration
//! - A generic process supervisor for websites and services with restart
//!   backoff, pid identity checks and bounded log capture
//! - Certificate lifecycle management: a self-signed bootstrap certificate and
//!   ACME DNS-01 renewal through a pluggable DNS backend
//! - A watchdog that keeps the control-plane process itself alive

pub mod atomic;
pub mod certs;
pub mod commands;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod logs;
pub mod migration;
pub mod model;
pub mod ports;
pub mod process;
pub mod store;
pub mod supervisor;
pub mod ticker;
pub mod watchdog;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

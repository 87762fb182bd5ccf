//! Gateway CR - change request approval and execution workflow for shared
//! gateway configuration.
//!
//! The library exposes the lifecycle engine, the automation coordinator and
//! an axum router; the `gateway-cr` binary wires them to a SQLite file.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use error::AppError;

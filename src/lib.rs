//! Remedy library crate
//!
//! Exposes the pipeline modules so integration tests and external tooling
//! can drive them without going through daemon startup.

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod evidence;
pub mod manifest;
pub mod model;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod report;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod validate;
pub mod version;
pub mod workflow;

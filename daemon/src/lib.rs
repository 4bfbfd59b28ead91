//! code-sandbox daemon library
//!
//! This crate provides the core functionality for the code-sandbox daemon:
//! - Configuration parsing from JSON and environment overrides
//! - Hardened container runtime abstraction with a Docker implementation
//! - Sandbox runner, bounded job queue and outcome reporting
//! - HTTP gateway exposing `/execute` and `/health`

pub mod backend;
pub mod classify;
pub mod config;
pub mod deadline;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod report;
pub mod runner;

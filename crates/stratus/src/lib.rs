//! Stratus: a self-hosted deployment platform.
//!
//! Repositories are registered through the HTTP API, fetched from source
//! control, and run as managed install→build→start process pipelines behind
//! a reverse proxy, with live log streaming and push-triggered redeploys.

pub mod account;
pub mod api;
pub mod db;
pub mod deploy;
pub mod deployment;
pub mod repository;
pub mod runtime;
pub mod settings;

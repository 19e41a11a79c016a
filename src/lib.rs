//! Offline-first caching for the shelf media tracker.
//!
//! The [`controller`] intercepts requests and serves them from versioned cache
//! partitions when the backend is unreachable; [`filter_state`] remembers the
//! last catalogue view. [`proxy`] hosts both in front of a shelf backend.

pub mod cache;
pub mod config;
pub mod controller;
pub mod filter_state;
pub mod http;
pub mod logging;
pub mod proxy;

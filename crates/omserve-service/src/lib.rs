//! Core of `omserve`: resolves logical array-file keys to local or remote readers.
//!
//! The interesting parts live in [`caching`], which contains the single-flight
//! [`ResolutionCache`](caching::ResolutionCache), its local-only sibling and the
//! background sweepers that keep both of them current.

#[macro_use]
pub mod metrics;

pub mod blocks;
pub mod caching;
pub mod config;
pub mod files;
pub mod http;
pub mod logging;
pub mod service;

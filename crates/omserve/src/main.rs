//! omserve.
//!
//! omserve is a web service that serves byte ranges of array files. Files are read from a local
//! data directory, and fetched block-wise from a remote origin when they are not available
//! locally.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod server;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            omserve_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

//! Shared helpers for tests across the workspace.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Once;

static LOG_SETUP: Once = Once::new();

/// Enable test log output if `RUST_LOG` is set in the environment.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_log::LogTracer::init().ok();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    });
}

/// Assert `haystack` contains `needle`, with a readable failure message.
pub fn assert_contains(haystack: impl AsRef<str>, needle: impl AsRef<str>) {
    let haystack = haystack.as_ref();
    let needle = needle.as_ref();
    assert!(
        haystack.contains(needle),
        "Can not find\n\n{}\n\nin\n\n{}",
        needle,
        haystack
    );
}

//! Logging macros that set target to "meridiandb_connector" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "meridiandb_connector::cache::refresh_ahead"), which produces overly
//! verbose logger names for embedding applications that route Rust targets
//! into their own logging hierarchy. These macros pin every log line from this
//! crate to a single "meridiandb_connector" target.

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "meridiandb_connector", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "meridiandb_connector", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "meridiandb_connector", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "meridiandb_connector", $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "meridiandb_connector", $($arg)*) };
}

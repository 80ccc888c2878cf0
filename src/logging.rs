//! Logging macros that set target to "pggateway" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "pggateway::server::session"), which makes `RUST_LOG` filters and
//! subscriber output noisy. These macros pin every diagnostic from this crate
//! to the single "pggateway" target.
//!
//! Per-session events (the ones operators audit) do not go through these
//! macros; they are routed through the listener's
//! [`PluginRegistry`](crate::plugins::PluginRegistry).

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "pggateway", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "pggateway", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "pggateway", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "pggateway", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "pggateway", $($arg)*) };
}

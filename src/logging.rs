//! Logging init (spec §6 `logLevel`), lifted out of `main.rs` into its own
//! function.

use crate::config::LogLevel;

pub fn init(level: LogLevel) {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| level.as_filter_directive().to_string());
    tracing_subscriber::fmt().with_env_filter(directive).with_target(true).compact().init();
}

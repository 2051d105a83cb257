/// Initialize tracing for the current process.
///
/// Every process in the system (router, broker server, each transport
/// daemon) calls this once at startup. Uses `try_init` so tests and
/// libraries can call it repeatedly without panicking.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(default_level))
        .with_target(false)
        .try_init();
}

/// Map a textual level (as found in settings or in a queued log record) to a
/// tracing level. Unknown names fall back to `INFO`.
pub fn parse_level(name: &str) -> tracing::Level {
    match name.to_lowercase().as_str() {
        "error" | "critical" | "fatal" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

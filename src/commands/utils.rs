/// Initialize logging on stderr, keeping stdout for command output.
///
/// `RUST_LOG` wins; otherwise `debug` with `--verbose`, else `default_level`.
pub fn init_logging(verbose: bool, default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { default_level };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Format a number of seconds for display, e.g. `1h 05m`, `12m 30s`, `45s`
pub fn format_seconds(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let secs = seconds.abs();

    if secs < 60 {
        format!("{}{}s", sign, secs)
    } else if secs < 3600 {
        format!("{}{}m {:02}s", sign, secs / 60, secs % 60)
    } else {
        format!("{}{}h {:02}m", sign, secs / 3600, (secs % 3600) / 60)
    }
}

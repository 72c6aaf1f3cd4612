//! Logging setup shared by every Tutorbook binary and test.

use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber at INFO.
///
/// ```
/// use tutorbook_common::logging;
///
/// logging::init();
/// logging::init_with_level(tracing::Level::DEBUG);
/// ```
pub fn init() {
    init_with_level(Level::INFO);
}

/// Initialize the tracing subscriber with a specific level for the `tutorbook` targets.
///
/// `RUST_LOG` is honoured for everything else. Safe to call more than once; only the first
/// call installs the subscriber.
pub fn init_with_level(level: Level) {
    let mut filter = EnvFilter::from_default_env();
    match format!("tutorbook={}", level).parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(err) => eprintln!("invalid log directive: {}", err),
    }

    let result = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(filter)
        .try_init();

    if result.is_ok() {
        info!("Logging initialized at level: {}", level);
    }
}

/// Log a result and hand it back unchanged.
pub fn log_result<T, E: std::fmt::Display>(
    result: Result<T, E>,
    success_message: &str,
    error_context: &str,
) -> Result<T, E> {
    match &result {
        Ok(_) => info!("{}", success_message),
        Err(e) => error!("{}: {}", error_context, e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init();
        init_with_level(Level::DEBUG);
    }

    #[test]
    fn test_log_result_passes_through() {
        let ok: Result<u8, String> = Ok(3);
        assert_eq!(log_result(ok, "done", "failed"), Ok(3));
        let err: Result<u8, String> = Err("boom".into());
        assert_eq!(log_result(err, "done", "failed"), Err("boom".to_string()));
    }
}

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Derives a child logger from an optional parent. Objects constructed without
/// a parent log into the void.
#[inline]
pub fn root<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}

/// Builds the default terminal logger.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Default logging config must parse");

    config.build_logger().expect("Logger construction failed")
}

//! Tracing subscriber setup

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Install the global subscriber: rolling file output (JSON or text), plus
/// ANSI stdout in text mode. `RUST_LOG` overrides `log_level`.
///
/// Hold the returned guard until exit or buffered lines are dropped.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);

    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    if config.use_json {
        registry.with(file_layer.json().with_target(true)).init();
    } else {
        registry
            .with(file_layer.with_target(false))
            .with(fmt::layer().with_target(false).with_ansi(true))
            .init();
    }

    guard
}

/// Unknown names mean no rotation
fn rotation(name: &str) -> Rotation {
    match name.trim().to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

fn default_directives(level: &str) -> String {
    // statement-level sqlx and connection-level hyper logs drown everything else
    format!("{},sqlx=warn,hyper=warn", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation(" Hourly "), Rotation::HOURLY);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}

//! Process-wide `tracing` setup.
//!
//! Each subsystem logs under its own target, so a single one can be turned up
//! with e.g. `MINGLE_LOG_FILTER=warn,mingle::connection=trace`.

fn env_truthy(var: &str) -> bool {
    std::env::var(var).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::{self, OpenOptions};
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    /// Targets emitted by the client core and the frame bus.
    pub const CLIENT_TARGETS: [&str; 6] = [
        "mingle::auth",
        "mingle::pipeline",
        "mingle::transport",
        "mingle::connection",
        "mingle::presence",
        "frame_bus",
    ];

    /// HTTP and WebSocket libraries, held at `warn` unless `MINGLE_TRACE_DEPS`
    /// is set.
    const TRANSPORT_DEPENDENCIES: [&str; 6] = [
        "hyper",
        "h2",
        "reqwest",
        "rustls",
        "tungstenite",
        "tokio_tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Appends to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        OpenFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid MINGLE_LOG_FILTER: {0}")]
        Filter(String),
        #[error("another global subscriber is already installed")]
        AlreadyInstalled,
    }

    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the subscriber. Once it is in place, later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }

        let filter = match std::env::var("MINGLE_LOG_FILTER") {
            Ok(custom) => {
                EnvFilter::try_new(custom).map_err(|err| InitError::Filter(err.to_string()))?
            }
            Err(_) => EnvFilter::new(directives(
                config.level,
                super::env_truthy("MINGLE_TRACE_DEPS"),
            )),
        };
        let (writer, guard) = open_writer(config)?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|_| InitError::AlreadyInstalled)?;

        let _ = WRITER_GUARD.set(guard);
        Ok(())
    }

    fn open_writer(config: &LogConfig) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = &config.file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let open_error = |source: std::io::Error| InitError::OpenFile {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_error)?;
        Ok(tracing_appender::non_blocking(file))
    }

    /// Client targets follow `level`; everything else stays at `warn` or
    /// quieter.
    pub(crate) fn directives(level: LogLevel, trace_dependencies: bool) -> String {
        let client = LevelFilter::from(level);
        let rest = LevelFilter::from(level.min(LogLevel::Warn));

        let mut directives = vec![rest.to_string()];
        directives.extend(
            CLIENT_TARGETS
                .iter()
                .map(|target| format!("{target}={client}")),
        );
        if trace_dependencies {
            directives.extend(
                TRANSPORT_DEPENDENCIES
                    .iter()
                    .map(|target| format!("{target}={client}")),
            );
        }
        directives.join(",")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn client_targets_follow_the_requested_level() {
            let filter = directives(LogLevel::Debug, false);
            assert!(filter.starts_with("warn,"));
            assert!(filter.contains("mingle::connection=debug"));
            assert!(filter.contains("frame_bus=debug"));
            assert!(!filter.contains("hyper"));
        }

        #[test]
        fn quiet_levels_apply_everywhere() {
            let filter = directives(LogLevel::Error, false);
            assert!(filter.starts_with("error,"));
            assert!(filter.contains("mingle::pipeline=error"));
        }

        #[test]
        fn transport_dependencies_join_on_request() {
            let filter = directives(LogLevel::Trace, true);
            assert!(filter.contains("tokio_tungstenite=trace"));
            assert!(filter.contains("mingle::presence=trace"));
        }

        #[test]
        fn generated_directives_parse() {
            for level in [LogLevel::Error, LogLevel::Info, LogLevel::Trace] {
                assert!(EnvFilter::try_new(directives(level, true)).is_ok());
            }
        }
    }
}

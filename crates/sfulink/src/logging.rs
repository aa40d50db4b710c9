use clap::ValueEnum;
use sfulink_channel::WORKER_LOG_TARGET;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

fn filter(level: LogLevel, worker_level: LogLevel) -> Targets {
    Targets::new()
        .with_target(WORKER_LOG_TARGET, worker_level.as_filter())
        .with_default(level.as_filter())
}

/// Install the stderr subscriber. Worker output is filtered on its own level.
pub fn init_logging(format: LogFormat, level: LogLevel, worker_level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::TRACE)
        .with_ansi(false)
        .with_target(true);

    match format {
        LogFormat::Text => {
            let _ = builder
                .finish()
                .with(filter(level, worker_level))
                .try_init();
        }
        LogFormat::Json => {
            let _ = builder
                .json()
                .finish()
                .with(filter(level, worker_level))
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn worker_target_has_its_own_level() {
        let targets = filter(LogLevel::Warn, LogLevel::Debug);
        assert!(targets.would_enable(WORKER_LOG_TARGET, &Level::DEBUG));
        assert!(!targets.would_enable("sfulink_channel::channel", &Level::DEBUG));
        assert!(targets.would_enable("sfulink_channel::channel", &Level::WARN));
    }

    #[test]
    fn off_silences_worker_lines() {
        let targets = filter(LogLevel::Info, LogLevel::Off);
        assert!(!targets.would_enable(WORKER_LOG_TARGET, &Level::ERROR));
    }
}

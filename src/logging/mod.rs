//! Process-wide `tracing` subscriber: stdout, or a size/age rotated file.

mod cleanup;
mod filename;
mod rolling_file;

use crate::config::{LogLevel, LoggingConfig, LoggingOutput};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;

pub use cleanup::prune_rotated_logs;
pub use filename::{format_rotated_filename, parse_rotated_filename, RotatedLogName};
pub use rolling_file::RollingFileWriter;

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

pub fn init_logging(
    cfg: &LoggingConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(cfg.level))
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_file(cfg.include_source)
        .with_line_number(cfg.include_source);

    match cfg.output {
        LoggingOutput::Stdout => {
            tracing::subscriber::set_global_default(builder.with_ansi(true).finish())?;
            Ok(LoggingGuard { _worker: None })
        }
        LoggingOutput::File => {
            let writer = RollingFileWriter::open(cfg.file.clone())?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let subscriber = builder
                .with_ansi(false)
                .with_writer(non_blocking)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(LoggingGuard {
                _worker: Some(guard),
            })
        }
    }
}

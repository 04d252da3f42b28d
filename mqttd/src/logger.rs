use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::Result;
use slog::{o, Drain};

use crate::settings::log::{Level, Log, To};

pub use slog::Logger;

/// Builds the root logger for `log` and routes the `log` facade into it.
///
/// Fails when a logger is already installed or the log file cannot be opened.
pub fn logger_init(cfg: &Log) -> Result<Logger> {
    let logger = config_logger(cfg.filename(), cfg.to, cfg.level)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow::anyhow!("logger init failed, {:?}", e))?;
    log::set_max_level(slog_level_to_log(cfg.level.inner()).to_level_filter());
    Ok(logger)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_level_to_log(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Plain-text root logger writing `<date> <LEVEL> <msg>` lines
/// asynchronously to the targets selected by `to`.
pub fn config_logger(filename: String, to: To, level: Level) -> Result<Logger> {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(filename, to)?);
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .use_original_order()
        .build()
        .fuse();

    let drain = slog::LevelFilter::new(drain, level.inner()).fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(&filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.off() {
            return Ok(buf.len());
        }
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if let Some(dir) = std::path::Path::new(filename).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow::Error::msg(format!("logger file config error, filename: {}, {:?}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_level_to_log(slog::Level::Critical), log::Level::Error);
        assert_eq!(slog_level_to_log(slog::Level::Debug), log::Level::Debug);
    }

    #[test]
    fn test_file_logger() {
        let dir = std::env::temp_dir().join(format!("mqttd-log-{}", uuid::Uuid::new_v4()));
        let filename = dir.join("test.log").to_string_lossy().to_string();
        let logger = config_logger(filename.clone(), To::File, slog::Level::Info.into()).unwrap();
        slog::info!(logger, "hello {}", "file");
        slog::debug!(logger, "filtered out");
        drop(logger);
        std::thread::sleep(std::time::Duration::from_millis(200));

        let text = std::fs::read_to_string(&filename).unwrap();
        assert!(text.contains("hello file"));
        assert!(!text.contains("filtered out"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_logger_init_once() {
        let cfg = Log { to: To::Off, ..Log::default() };
        let _ = logger_init(&cfg);
        // the facade keeps the first logger
        assert!(logger_init(&cfg).is_err());
        log::info!("routed into slog");
    }

    #[test]
    fn test_off() {
        let logger = config_logger(String::new(), To::Off, slog::Level::Trace.into()).unwrap();
        slog::info!(logger, "nowhere");
    }
}

use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::anyhow;
use slog::{o, Drain};

use mqflow_conf::logging::{Log, To};

use crate::error::Result;

pub use slog::Logger;

/// Builds the root logger from the `log` settings section and routes the `log`
/// facade into it.
pub fn init(cfg: &Log) -> Result<Logger> {
    let logger = config_logger(cfg.filename(), cfg.to, cfg.level.inner());
    logger_init(logger.clone(), cfg.level.inner())?;
    Ok(logger)
}

pub fn logger_init(logger: Logger, level: slog::Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow!("logger init failed, {}", e))?;
    log::set_max_level(slog_to_log_level(level).to_level_filter());
    Ok(())
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> Logger {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();
    let drain = drain.filter_level(level).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let location = &slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let s = slog::RecordStatic { location, level: log_to_slog_level(r.level()), tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

#[inline]
fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

#[inline]
fn slog_to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

/// Console and/or file sink. The file is opened on first write.
struct WriteFilter {
    filename: String,
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.filename).map_err(|e| {
                io::Error::new(e.kind(), format!("log file {} can not be opened, {}", self.filename, e))
            })?;
            self.file = Some(file);
        }
        self.file.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log file missing"))
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.to {
            To::Off => Ok(buf.len()),
            To::Console => self.console.write(buf),
            To::File => self.file()?.write(buf),
            To::Both => {
                self.console.write_all(buf)?;
                self.file()?.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if self.to.file() {
            self.file()?.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_is_symmetric() {
        for l in [log::Level::Trace, log::Level::Debug, log::Level::Info, log::Level::Warn, log::Level::Error] {
            assert_eq!(slog_to_log_level(log_to_slog_level(l)), l);
        }
        assert_eq!(slog_to_log_level(slog::Level::Critical), log::Level::Error);
    }

    #[test]
    fn file_sink_opens_lazily() {
        let path = std::env::temp_dir().join(format!("mqflow-logger-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let filename = path.to_string_lossy().to_string();

        let mut w = WriteFilter::new(filename.clone(), To::Off);
        assert_eq!(w.write(b"dropped").unwrap(), 7);
        assert!(!path.exists());

        let mut w = WriteFilter::new(filename, To::File);
        w.write_all(b"line\n").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bridge_forwards_records() {
        let ex = LoggerEx(config_logger(String::new(), To::Off, slog::Level::Debug));
        log::Log::log(
            &ex,
            &log::Record::builder().args(format_args!("forwarded")).level(log::Level::Info).target("test").build(),
        );
        log::Log::flush(&ex);
    }
}

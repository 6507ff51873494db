use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

struct SimpleLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let text = format!("{} {} - {}", timestamp, record.level(), record.args());
        match &self.file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{text}");
                }
            }
            None => {
                if record.level() <= Level::Warn {
                    eprintln!("{text}");
                } else {
                    println!("{text}");
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Installs the process-wide logger. `RUST_LOG=debug` lowers the threshold.
pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    let level = match std::env::var("RUST_LOG").as_deref() {
        Ok("debug") | Ok("trace") => LevelFilter::Debug,
        _ => LevelFilter::Info,
    };
    let file = match log_file {
        None => None,
        Some(log_file) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| {
                    format!("Failed to open the log file at '{}'", log_file.display())
                })?;
            Some(Mutex::new(file))
        }
    };
    let logger = SimpleLogger { level, file };
    log::set_boxed_logger(Box::new(logger)).map(|_| log::set_max_level(level))?;
    Ok(())
}

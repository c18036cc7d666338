use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("log target {0}: file output requires a path")]
    MissingPath(usize),

    #[error("log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger already installed: {0}")]
    SetLogger(#[from] log::SetLoggerError),
}

struct Sink {
    filter: LevelFilter,
    only: Option<String>,
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl Sink {
    fn accepts(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
            && self
                .only
                .as_deref()
                .is_none_or(|prefix| metadata.target().starts_with(prefix))
    }
}

/// Fan-out logger: every configured target has its own level, optional
/// target prefix and writer, the line format is shared.
pub struct CustomLogger {
    format: LogFormat,
    sinks: Vec<Sink>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, LoggingError> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
                only: None,
            }]
        });

        let mut sinks = Vec::with_capacity(targets.len());
        for (index, target) in targets.into_iter().enumerate() {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::Stderr => Box::new(std::io::stderr()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or(LoggingError::MissingPath(index))?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            sinks.push(Sink {
                filter: target.level.unwrap_or(default_level).to_filter(),
                only: target.only,
                writer: Mutex::new(BufWriter::new(writer)),
            });
        }

        Ok(Self { format, sinks })
    }

    pub fn init(config: LoggingConfig) -> Result<(), LoggingError> {
        let logger = Self::new(config)?;
        let max = logger.max_level();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max);
        Ok(())
    }

    fn max_level(&self) -> LevelFilter {
        self.sinks
            .iter()
            .map(|sink| sink.filter)
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        json!({
            "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "level": record.level().as_str().to_lowercase(),
            "target": record.target(),
            "message": record.args().to_string(),
        })
        .to_string()
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks.iter().any(|sink| sink.accepts(metadata))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for sink in &self.sinks {
            if sink.accepts(record.metadata()) {
                if let Ok(mut writer) = sink.writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

/// Used when the configuration has no `logging` section. `RUST_LOG` still
/// wins over the given default level.
pub fn init_fallback(level: LogLevel) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string()),
    )
    .format_timestamp_millis()
    .try_init();
}

use std::{path::PathBuf, time::SystemTime};

use courier_models::errors::SendableError;
use log::LevelFilter;

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
        }
    }
}

pub fn setup_logger(settings: &LogSettings) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                format_line(SystemTime::now(), record.level(), record.target(), message)
            ))
        })
        .level(settings.level)
        // broker clients are chatty at info
        .level_for("lapin", LevelFilter::Warn)
        .level_for("rdkafka", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = &settings.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn format_line(
    at: SystemTime,
    level: log::Level,
    target: &str,
    message: &std::fmt::Arguments<'_>,
) -> String {
    format!(
        "[{} {} {}] {}",
        humantime::format_rfc3339_seconds(at),
        level,
        target,
        message
    )
}

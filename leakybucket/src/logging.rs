//! Logging initialization.
//!
//! The settings live in an explicit [`LoggingConfig`] that the process builds once and
//! passes to [`init_logging`]. Buckets themselves only emit `tracing` events.

use conf::Conf;
use displaydoc::Display;
use serde::Deserialize;
use std::{
    fs::{File, OpenOptions},
    io::IsTerminal,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};
use tracing_subscriber::EnvFilter;

/// Name of the log file written in file mode.
pub const LOG_FILE_NAME: &str = "leakybucket.log";

/// Where log lines are written.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// `<log_dir>/leakybucket.log`, appended to.
    File,
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            other => Err(format!("log mode '{other}' unknown")),
        }
    }
}

/// Config options for logging.
#[derive(Clone, Conf, Debug)]
#[conf(serde)]
pub struct LoggingConfig {
    /// Where logs go: "stdout", "stderr", or "file"
    #[conf(long, env, default_value = "stderr")]
    pub log_mode: LogMode,
    /// Directory of the log file, required when log_mode is "file"
    #[conf(long, env)]
    pub log_dir: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set, e.g. "info" or "leakybucket=trace"
    #[conf(long, env, default_value = "info")]
    pub log_level: String,
    /// Use ANSI colors even when the output is not a terminal
    #[conf(long, env)]
    pub force_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_mode: LogMode::Stderr,
            log_dir: None,
            log_level: "info".into(),
            force_colors: false,
        }
    }
}

impl LoggingConfig {
    /// Path of the log file, in file mode.
    pub fn log_file_path(&self) -> Result<Option<PathBuf>, LoggingError> {
        match self.log_mode {
            LogMode::File => {
                let dir = self.log_dir.as_ref().ok_or(LoggingError::MissingLogDir)?;
                Ok(Some(dir.join(LOG_FILE_NAME)))
            }
            LogMode::Stdout | LogMode::Stderr => Ok(None),
        }
    }

    /// The filter to install: `RUST_LOG` if set, otherwise `log_level`.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.log_level).map_err(LoggingError::Filter),
        }
    }
}

/// Errors that can occur when setting up logging
#[derive(Debug, Display)]
pub enum LoggingError {
    /// log_dir is required when log_mode is "file"
    MissingLogDir,
    /// Could not open log file {0}: {1}
    OpenFile(String, std::io::Error),
    /// Invalid log filter: {0}
    Filter(tracing_subscriber::filter::ParseError),
    /// Could not install subscriber: {0}
    Init(Box<dyn std::error::Error + Send + Sync>),
}

impl std::error::Error for LoggingError {}

/// Install a global tracing subscriber according to `config`.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter);

    let result = match config.log_mode {
        LogMode::Stdout => builder
            .with_writer(std::io::stdout)
            .with_ansi(config.force_colors || std::io::stdout().is_terminal())
            .try_init(),
        LogMode::Stderr => builder
            .with_writer(std::io::stderr)
            .with_ansi(config.force_colors || std::io::stderr().is_terminal())
            .try_init(),
        LogMode::File => {
            let path = config.log_file_path()?.ok_or(LoggingError::MissingLogDir)?;
            let file = open_log_file(&path)?;
            builder
                .with_writer(Mutex::new(file))
                .with_ansi(config.force_colors)
                .try_init()
        }
    };
    result.map_err(LoggingError::Init)
}

/// Open the log file for appending, creating it owner-readable only if it does not exist.
fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|err| LoggingError::OpenFile(path.display().to_string(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_mode() {
        assert_eq!(LogMode::from_str("file").unwrap(), LogMode::File);
        assert_eq!(LogMode::from_str("stdout").unwrap(), LogMode::Stdout);
        assert_eq!(
            LogMode::from_str("syslog").unwrap_err(),
            "log mode 'syslog' unknown"
        );
    }

    #[test]
    fn test_file_mode_needs_dir() {
        let config = LoggingConfig {
            log_mode: LogMode::File,
            ..Default::default()
        };
        assert!(matches!(
            config.log_file_path(),
            Err(LoggingError::MissingLogDir)
        ));

        let config = LoggingConfig {
            log_mode: LogMode::File,
            log_dir: Some("/var/log/leakybucket".into()),
            ..Default::default()
        };
        assert_eq!(
            config.log_file_path().unwrap(),
            Some(PathBuf::from("/var/log/leakybucket/leakybucket.log"))
        );

        assert_eq!(LoggingConfig::default().log_file_path().unwrap(), None);
    }

    #[test]
    fn test_open_log_file_creates_and_appends() {
        let dir = std::env::temp_dir().join(format!("leakybucket-log-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(LOG_FILE_NAME);
        let _ = std::fs::remove_file(&path);

        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "first").unwrap();
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "second").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

//! Logging setup, and the runtime control behind `LOGCONFIG` and `GETLOG`.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use crate::error::{DepotError, Result};

/// filter used when neither the options nor `RUST_LOG` give one
pub const DEFAULT_FILTER: &str = "info";

/// Where and how much to log.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// append to this file instead of writing to stderr
    pub file: Option<PathBuf>,
    /// `EnvFilter` directives, `RUST_LOG` wins if it is set
    pub filter: Option<String>,
}

type Reloader = Box<dyn Fn(EnvFilter) -> std::result::Result<(), String> + Send + Sync>;

/// Runtime control over the installed subscriber.
pub struct LogControl {
    reload: Option<Reloader>,
    file: Option<PathBuf>,
}

impl LogControl {
    /// A control that validates settings but has no subscriber to change, for servers that
    /// didn't call [`init`].
    pub fn detached() -> Self {
        LogControl {
            reload: None,
            file: None,
        }
    }

    /// like [`detached`](LogControl::detached), but `GETLOG` serves `file`
    pub fn with_file<P: Into<PathBuf>>(file: P) -> Self {
        LogControl {
            reload: None,
            file: Some(file.into()),
        }
    }

    /// the file being logged to, if any
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Applies a `property=value` setting.
    ///
    /// `level=<level>` sets one maximum level for everything, `filter=<directives>` installs
    /// `EnvFilter` directives.
    ///
    /// # Errors
    /// [`DepotError::Protocol`] for a malformed setting, an unknown property or a bad value.
    pub fn configure(&self, setting: &str) -> Result<()> {
        let (property, value) = setting
            .split_once('=')
            .ok_or_else(|| DepotError::protocol(format!("Malformed LOGCONFIG data '{}'", setting)))?;
        let filter = match property.trim() {
            "level" => {
                let level = LevelFilter::from_str(value.trim())
                    .map_err(|_| DepotError::protocol(format!("Unknown log level '{}'", value)))?;
                EnvFilter::default().add_directive(level.into())
            }
            "filter" => EnvFilter::try_new(value.trim())
                .map_err(|e| DepotError::protocol(format!("Bad log filter '{}': {}", value, e)))?,
            other => {
                return Err(DepotError::protocol(format!(
                    "Unknown log property '{}'",
                    other
                )))
            }
        };
        if let Some(reload) = &self.reload {
            reload(filter).map_err(DepotError::protocol)?;
        }
        Ok(())
    }

    /// The text of the log file, empty when logging to stderr.
    pub fn contents(&self) -> Result<String> {
        match &self.file {
            Some(path) => match fs::read(path) {
                Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
                Err(e) => Err(e.into()),
            },
            None => Ok(String::new()),
        }
    }
}

/// Installs the global subscriber: an fmt layer writing to stderr or `options.file`, behind a
/// reloadable `EnvFilter`.
///
/// # Errors
/// [`DepotError::Io`] if the log file can't be opened, [`DepotError::Config`] if the filter is
/// invalid or a global subscriber is already installed.
pub fn init(options: &LogOptions) -> Result<LogControl> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(options.filter.as_deref().unwrap_or(DEFAULT_FILTER))
            .map_err(|e| DepotError::Config(format!("bad log filter: {}", e)))?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let writer = match &options.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(options.file.is_none()))
        .try_init()
        .map_err(|e| DepotError::Config(format!("unable to install logging: {}", e)))?;

    Ok(LogControl {
        reload: Some(Box::new(move |filter| {
            handle.reload(filter).map_err(|e| e.to_string())
        })),
        file: options.file.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_settings() {
        let control = LogControl::detached();
        assert!(control.configure("level=debug").is_ok());
        assert!(control.configure("filter=depot=trace,sled=warn").is_ok());
        assert!(control.configure("level=loud").is_err());
        assert!(control.configure("color=blue").is_err());
        assert!(control.configure("debug").is_err());
    }

    #[test]
    fn serves_log_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.log");
        let control = LogControl::with_file(&path);
        assert_eq!(control.contents().unwrap(), "");
        fs::write(&path, "INFO started\n").unwrap();
        assert_eq!(control.contents().unwrap(), "INFO started\n");
        assert_eq!(LogControl::detached().contents().unwrap(), "");
    }
}

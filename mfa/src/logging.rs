use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::{CfgLog, LogFormat};
use crate::MfaError;

/// Filter layer whose level can be swapped while the process runs.
pub type FilterLayer = reload::Layer<EnvFilter, Registry>;

/// Runtime control over the installed log filter.
#[derive(Debug, Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
}

impl LogHandle {
    /// Builds a reloadable filter for `level`, which is any `EnvFilter`
    /// directive string.
    pub fn new(level: &str) -> Result<(FilterLayer, Self), MfaError> {
        let (layer, handle) = reload::Layer::new(parse_filter(level)?);
        Ok((
            layer,
            LogHandle {
                handle,
                base: level.to_string(),
            },
        ))
    }

    /// Switches between debug output and the configured level.
    pub fn set_verbose(&self, verbose: bool) -> Result<(), MfaError> {
        let level = if verbose { "debug" } else { self.base.as_str() };
        self.handle
            .reload(parse_filter(level)?)
            .map_err(|e| MfaError::Logging(e.to_string()))
    }

    pub fn current(&self) -> Result<String, MfaError> {
        self.handle
            .with_current(|filter| filter.to_string())
            .map_err(|e| MfaError::Logging(e.to_string()))
    }
}

fn parse_filter(level: &str) -> Result<EnvFilter, MfaError> {
    EnvFilter::try_new(level).map_err(|e| MfaError::Logging(format!("{level}: {e}")))
}

/// Installs the global subscriber. Output goes to stderr.
pub fn init(cfg: &CfgLog, level: Option<&str>) -> Result<LogHandle, MfaError> {
    let (filter, handle) = LogHandle::new(level.unwrap_or(&cfg.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match cfg.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| MfaError::Logging(e.to_string()))?;

    Ok(handle)
}

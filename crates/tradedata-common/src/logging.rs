//! Logging bootstrap for TradeData binaries
//!
//! Everything logs through `tracing`; this module only installs the global
//! subscriber. A [`LogConfig`] selects the sink (console, daily-rotated file or
//! both), the line format (text or JSON) and the filter: a base level plus
//! optional per-target directives such as `sqlx=warn,reqwest=info`.
//!
//! Library code never prints. Log with structured fields instead:
//! `info!(release = %id, rows, "Batch committed")`.
//!
//! # Example
//!
//! ```no_run
//! use tradedata_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("Ingestion starting");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log sink selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" | "all" => Ok(Self::Both),
            other => Err(anyhow!("Unknown log output '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("Unknown log format '{}'", other)),
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated files; a file is named `<prefix>.<yyyy-mm-dd>`
    pub log_dir: PathBuf,
    pub log_file_prefix: String,
    /// Comma separated `target=level` directives layered over `level`
    pub filter_directives: Option<String>,
    /// Add source file and line to every event
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::default(),
            format: LogFormat::default(),
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tradedata".to_string(),
            filter_directives: None,
            include_location: false,
        }
    }
}

/// Non-empty value of an environment variable
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults overridden by `LOG_*` variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Override fields from `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and `LOG_INCLUDE_LOCATION`.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_value("LOG_LEVEL") {
            self.level = Level::from_str(level.trim()).map_err(|_| anyhow!("Unknown log level '{}'", level))?;
        }
        if let Some(output) = env_value("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = env_value("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = dir.into();
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(flag) = env_value("LOG_INCLUDE_LOCATION") {
            self.include_location = matches!(flag.trim(), "1" | "true" | "yes");
        }
        Ok(self)
    }

    /// `RUST_LOG`, then the base level, then the configured directives
    fn env_filter(&self) -> Result<EnvFilter> {
        let mut directives = self
            .filter_directives
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty());

        directives.try_fold(
            EnvFilter::from_default_env().add_directive(self.level.into()),
            |filter, directive| {
                let parsed = directive
                    .parse()
                    .with_context(|| format!("Invalid log filter directive '{}'", directive))?;
                Ok(filter.add_directive(parsed))
            },
        )
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(FmtSpan::CLOSE);

        if self.format == LogFormat::Json {
            base.json().boxed()
        } else {
            base.boxed()
        }
    }
}

/// Fluent construction of a [`LogConfig`]
#[derive(Debug, Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Flushes buffered file output when dropped
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.env_filter()?;
    let mut layers = Vec::with_capacity(2);
    let mut guard = None;

    if matches!(config.output, LogOutput::Console | LogOutput::Both) {
        layers.push(config.layer(std::io::stdout, true));
    }

    if matches!(config.output, LogOutput::File | LogOutput::Both) {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Cannot create log directory {}", config.log_dir.display()))?;
        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix));
        layers.push(config.layer(writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _file: guard })
}

//! Log filter selection and the rolling file sink.
//!
//! Console and file get separate `EnvFilter` strings. When nobody picked a
//! filter on the command line, both are prefixed with directives that quiet
//! the per-launch host traces, and the file also keeps cache activity at
//! debug.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "flowsplat_core::host=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "flowsplat";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Recorded at debug in the log file whenever the filter is implicit.
const FILE_DEBUG_TARGETS: [&str; 1] = ["flowsplat_core::kernel_cache"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

/// Where the user-facing part of the filter came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    CliFlag(String),
    Verbosity(u8),
    RustLog(String),
    Default(String),
}

impl FilterSource {
    /// `--log-filter` beats `-v`, which beats `RUST_LOG`.
    pub fn select(options: &LoggingInitOptions) -> Self {
        match (&options.cli_log_filter, options.verbose, &options.rust_log_env) {
            (Some(filter), _, _) => Self::CliFlag(filter.clone()),
            (None, verbose @ 1.., _) => Self::Verbosity(verbose),
            (None, 0, Some(filter)) => Self::RustLog(filter.clone()),
            (None, 0, None) => Self::Default(options.default_log_filter.clone()),
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::CliFlag(_) | Self::Verbosity(_))
    }

    pub fn directives(&self) -> String {
        match self {
            Self::CliFlag(filter) | Self::RustLog(filter) | Self::Default(filter) => filter.clone(),
            Self::Verbosity(1) => "debug".to_string(),
            Self::Verbosity(_) => "trace".to_string(),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let source = FilterSource::select(options);
    let user_filter = source.directives();

    if source.is_explicit() || !options.include_noise_filter_when_implicit {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let file_noise = file_noise_directives(&options.noise_filter);
    LoggingFilterPlan {
        console_filter: join_directives(&[options.noise_filter.as_str(), user_filter.as_str()]),
        file_filter: join_directives(&[file_noise.as_str(), user_filter.as_str()]),
        user_filter,
    }
}

fn join_directives(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn directive_target(directive: &str) -> &str {
    directive
        .split_once('=')
        .map_or(directive, |(target, _)| target)
        .trim()
}

/// Noise directives without the file debug targets, followed by those
/// targets at debug.
fn file_noise_directives(noise_filter: &str) -> String {
    let kept = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive_target(directive);
            !FILE_DEBUG_TARGETS.iter().any(|debug_target| *debug_target == target)
        })
        .map(str::to_string);
    let debug = FILE_DEBUG_TARGETS
        .iter()
        .map(|target| format!("{target}=debug"));
    kept.chain(debug).collect::<Vec<_>>().join(",")
}

/// Daily-rolling appender under `<data_dir>/logs`, or the reason there is
/// none.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        count => count,
    };
    let fallback = |attempted_log_dir: Option<PathBuf>, reason: String| {
        FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir,
            retention_files,
            reason,
        })
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return fallback(None, "file sink disabled: data_dir is not configured".to_string());
    };
    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);

    match open_rolling_appender(&log_dir, retention_files) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => fallback(Some(log_dir), format!("{error:#}")),
    }
}

fn open_rolling_appender(log_dir: &Path, retention_files: usize) -> Result<RollingFileAppender> {
    fs::create_dir_all(log_dir).context("failed to create log directory")?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(log_dir)
        .context("failed to initialize rolling file sink")
}

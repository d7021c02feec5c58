use crate::executor::{ExecutorOptions, LimitScope};
use crate::handler::{ConsoleHandler, FileOutputHandler, Handler};
use crate::input::Input;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while assembling suites and executors. All of them surface
/// at construction time, never from a running executor.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one test suite is required")]
    NoSuites,
    #[error("suite '{suite}' has no deploy operation")]
    MissingDeploy { suite: String },
    #[error("suite '{suite}' has no generators")]
    NoGenerators { suite: String },
    #[error("pool size must be at least 1, got {0}")]
    InvalidPoolSize(usize),
    #[error("limit must be -1 (unbounded) or non-negative, got {0}")]
    InvalidLimit(i64),
    #[error("failed to load config from {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
}

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const UNBOUNDED_LIMIT: i64 = -1;

pub fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

pub fn default_limit() -> i64 {
    UNBOUNDED_LIMIT
}

pub fn default_failure_log() -> PathBuf {
    PathBuf::from(crate::handler::DEFAULT_FAILURE_LOG)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigLimitScope {
    #[default]
    Global,
    PerWorker,
}

impl From<ConfigLimitScope> for LimitScope {
    fn from(scope: ConfigLimitScope) -> Self {
        match scope {
            ConfigLimitScope::Global => LimitScope::Global,
            ConfigLimitScope::PerWorker => LimitScope::PerWorker,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub limit_scope: ConfigLimitScope,
    pub iteration_timeout_ms: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            limit: default_limit(),
            limit_scope: ConfigLimitScope::default(),
            iteration_timeout_ms: None,
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    #[default]
    File,
    Console,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HandlerSettings {
    #[serde(default)]
    pub kind: HandlerKind,
    #[serde(default = "default_failure_log")]
    pub path: PathBuf,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            kind: HandlerKind::default(),
            path: default_failure_log(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub handler: HandlerSettings,
}

impl FuzzerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Load {
            path: PathBuf::new(),
            reason: format!("invalid TOML: {e}"),
        })
    }

    /// Builds the handler named by `[handler]`.
    pub fn build_handler<I: Input>(&self) -> Box<dyn Handler<I>> {
        match self.handler.kind {
            HandlerKind::File => Box::new(FileOutputHandler::new(self.handler.path.clone())),
            HandlerKind::Console => Box::new(ConsoleHandler::new()),
        }
    }

    pub fn into_options<I: Input>(self) -> ExecutorOptions<I> {
        let handler = self.build_handler::<I>();
        let settings = self.executor;
        let mut options = ExecutorOptions::default()
            .pool_size(settings.pool_size)
            .limit(settings.limit)
            .limit_scope(settings.limit_scope.into())
            .boxed_handler(handler);
        if let Some(ms) = settings.iteration_timeout_ms {
            options = options.iteration_timeout(Duration::from_millis(ms));
        }
        if let Some(seed) = settings.seed {
            options = options.seed(seed);
        }
        options
    }
}

//! Layered configuration resolution (component J): merges embedded
//! defaults, an on-disk global config, the process environment, an
//! on-disk project config, and CLI flags into a single effective
//! settings object. Last writer wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::review::ReviewConfig;
use crate::safety::SafetyConfig;

/// One layer of partial, on-disk or CLI-supplied overrides. Every field
/// is optional so a layer can leave a setting untouched; `merge` applies
/// `Some` fields over the accumulator, in resolution order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialConfig {
    pub max_iterations: Option<u32>,
    pub stagnation_limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_review_iterations: Option<u32>,
    pub state_dir: Option<PathBuf>,
    pub tickets_dir: Option<PathBuf>,
    pub agent_cmd: Option<String>,
    pub skip_review: Option<bool>,
    pub review: Option<ReviewConfig>,
    #[serde(default)]
    pub allow: Vec<String>,
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        if other.max_iterations.is_some() {
            self.max_iterations = other.max_iterations;
        }
        if other.stagnation_limit.is_some() {
            self.stagnation_limit = other.stagnation_limit;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.max_review_iterations.is_some() {
            self.max_review_iterations = other.max_review_iterations;
        }
        if other.state_dir.is_some() {
            self.state_dir = other.state_dir;
        }
        if other.tickets_dir.is_some() {
            self.tickets_dir = other.tickets_dir;
        }
        if other.agent_cmd.is_some() {
            self.agent_cmd = other.agent_cmd;
        }
        if other.skip_review.is_some() {
            self.skip_review = other.skip_review;
        }
        if other.review.is_some() {
            self.review = other.review;
        }
        // Repeatable CLI flags (`--allow`) and project allow-lists
        // accumulate rather than replace.
        self.allow.extend(other.allow);
    }
}

/// Overrides sourced from CLI flags; passed in by the `start`/`review`
/// subcommands after `clap` parsing.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_iterations: Option<u32>,
    pub stagnation_limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub skip_review: Option<bool>,
    pub allow: Vec<String>,
}

impl From<CliOverrides> for PartialConfig {
    fn from(cli: CliOverrides) -> Self {
        PartialConfig {
            max_iterations: cli.max_iterations,
            stagnation_limit: cli.stagnation_limit,
            timeout_secs: cli.timeout_secs,
            max_review_iterations: None,
            state_dir: None,
            tickets_dir: None,
            agent_cmd: None,
            skip_review: cli.skip_review,
            review: None,
            allow: cli.allow,
        }
    }
}

/// The single struct produced by merging every layer; every tunable
/// named in the spec's safety table plus filesystem roots and the
/// review/permission sub-configs.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub safety: SafetyConfig,
    pub review: ReviewConfig,
    pub state_dir: PathBuf,
    pub tickets_dir: PathBuf,
    pub agent_cmd: String,
    pub skip_review: bool,
    pub pre_allowed: Vec<String>,
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("PROGRAMMATOR_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| xdg_state_home().join("programmator"))
}

fn xdg_state_home() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".local").join("state"))
}

fn xdg_config_home() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"))
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `${XDG_CONFIG_HOME:-~/.config}/programmator/config.yaml`.
pub fn global_config_path() -> PathBuf {
    xdg_config_home().join("programmator").join("config.yaml")
}

/// `.programmator/config.yaml` under the project directory.
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".programmator").join("config.yaml")
}

fn load_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn load_env() -> PartialConfig {
    PartialConfig {
        max_iterations: env_override("PROGRAMMATOR_MAX_ITERATIONS"),
        stagnation_limit: env_override("PROGRAMMATOR_STAGNATION_LIMIT"),
        timeout_secs: env_override("PROGRAMMATOR_TIMEOUT"),
        max_review_iterations: env_override("PROGRAMMATOR_MAX_REVIEW_ITERATIONS"),
        state_dir: std::env::var_os("PROGRAMMATOR_STATE_DIR").map(PathBuf::from),
        tickets_dir: std::env::var_os("TICKETS_DIR").map(PathBuf::from),
        agent_cmd: None,
        skip_review: None,
        review: None,
        allow: Vec::new(),
    }
}

/// Resolve the effective configuration: embedded defaults, then the
/// global config file, then environment variables, then the project
/// config file, then CLI flags. Later layers win.
pub fn resolve(project_dir: &Path, cli: CliOverrides) -> Result<EffectiveConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    partial.merge(load_file(&global_config_path())?);
    partial.merge(load_env());
    partial.merge(load_file(&project_config_path(project_dir))?);
    partial.merge(PartialConfig::from(cli));

    let defaults = SafetyConfig::default();
    let safety = SafetyConfig {
        max_iterations: partial.max_iterations.unwrap_or(defaults.max_iterations),
        stagnation_limit: partial
            .stagnation_limit
            .unwrap_or(defaults.stagnation_limit),
        timeout: partial
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        max_review_iterations: partial
            .max_review_iterations
            .unwrap_or(defaults.max_review_iterations),
    };

    Ok(EffectiveConfig {
        review: partial.review.unwrap_or_default(),
        state_dir: partial.state_dir.unwrap_or_else(default_state_dir),
        tickets_dir: partial
            .tickets_dir
            .unwrap_or_else(|| project_dir.join("tickets")),
        agent_cmd: partial.agent_cmd.unwrap_or_else(|| "claude".to_string()),
        skip_review: partial.skip_review.unwrap_or(false),
        pre_allowed: partial.allow,
        safety,
    })
}

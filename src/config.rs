//! Run configuration
//!
//! Everything is read from one CONL file (`config/portal.conl` by default).
//! A copy of the shipped file is compiled in and used when that file is
//! missing. The resulting [`Config`] is built once in `main` and passed down
//! by reference.

use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::controls::{default_heuristics, ControlHeuristic};
use crate::normalize::ColumnNames;
use crate::paginate::AdvanceStrategy;
use crate::types::ScrapeTarget;

pub const CONFIG_PATH: &str = "config/portal.conl";

/// The shipped configuration
pub const DEFAULT_CONFIG: &str = include_str!("../config/portal.conl");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("No scrape targets configured")]
    EmptyTargets,
    #[error("Duplicate target key '{0}'")]
    DuplicateKey(String),
    #[error("Unknown target key '{0}'")]
    UnknownTarget(String),
    #[error("batch_size must be at least 1")]
    InvalidBatchSize,
    #[error("Invalid URL for target '{key}': {url}")]
    InvalidUrl { key: String, url: String },
    #[error("Invalid next-page control '{0}'")]
    InvalidHeuristic(String),
    #[error("Invalid strategy '{0}' (expected 'url' or 'click')")]
    InvalidStrategy(String),
}

fn default_output_dir() -> String {
    "data".to_string()
}
fn default_batch_size() -> usize {
    1000
}
fn default_group_size() -> usize {
    5
}
fn default_max_failures() -> u32 {
    3
}
fn default_request_delay() -> u64 {
    1000
}
fn default_target_delay() -> u64 {
    2000
}
fn default_settle_delay() -> u64 {
    1000
}
fn default_page_timeout() -> u64 {
    10
}
fn default_strategy() -> String {
    "url".to_string()
}
fn default_page_param() -> String {
    "page".to_string()
}
fn default_table_selector() -> String {
    "table".to_string()
}
fn default_user_agent() -> String {
    "TenderScrape/0.1 (procurement award listings)".to_string()
}

/// On-disk shape of the config file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_output_dir")]
    output_dir: String,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_group_size")]
    group_size: usize,
    /// 0 means no cap
    #[serde(default)]
    max_pages: u32,
    #[serde(default = "default_max_failures")]
    max_consecutive_failures: u32,
    #[serde(default = "default_request_delay")]
    request_delay_ms: u64,
    #[serde(default = "default_target_delay")]
    target_delay_ms: u64,
    #[serde(default = "default_settle_delay")]
    settle_delay_ms: u64,
    #[serde(default = "default_page_timeout")]
    page_timeout_secs: u64,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default = "default_page_param")]
    page_param: String,
    #[serde(default = "default_table_selector")]
    table_selector: String,
    #[serde(default)]
    source_column: Option<String>,
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default)]
    next_controls: Vec<String>,
    #[serde(default)]
    competitors: Vec<String>,
    #[serde(default)]
    columns: Option<ColumnNames>,
    #[serde(default)]
    targets: Vec<ScrapeTarget>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub batch_size: usize,
    /// Targets per snapshot group
    pub group_size: usize,
    pub max_pages: Option<u32>,
    pub max_consecutive_failures: u32,
    /// Pause between page fetches of one target
    pub request_delay: Duration,
    /// Pause between targets
    pub target_delay: Duration,
    pub settle_delay: Duration,
    pub page_timeout: Duration,
    pub strategy: AdvanceStrategy,
    pub page_param: String,
    pub table_selector: String,
    pub source_column: Option<String>,
    pub user_agent: String,
    pub next_controls: Vec<ControlHeuristic>,
    pub competitors: Vec<String>,
    pub columns: ColumnNames,
    pub targets: Vec<ScrapeTarget>,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub max_pages: Option<u32>,
    pub strategy: Option<AdvanceStrategy>,
    pub group_size: Option<usize>,
    /// Keep only these target keys, in configured order
    pub only: Vec<String>,
}

impl Config {
    /// Load from `path`, falling back to the built-in copy when the default
    /// path does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() && path == Path::new(CONFIG_PATH) {
            warn!(path = %path.display(), "Config file not found, using built-in defaults");
            return Self::parse(DEFAULT_CONFIG);
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_conl::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        let strategy = file
            .strategy
            .parse::<AdvanceStrategy>()
            .map_err(|_| ConfigError::InvalidStrategy(file.strategy.clone()))?;

        let next_controls = if file.next_controls.is_empty() {
            default_heuristics()
        } else {
            file.next_controls
                .iter()
                .map(|s| {
                    s.parse::<ControlHeuristic>()
                        .map_err(|_| ConfigError::InvalidHeuristic(s.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        validate_targets(&file.targets)?;

        Ok(Self {
            output_dir: PathBuf::from(file.output_dir),
            batch_size: file.batch_size,
            group_size: file.group_size.max(1),
            max_pages: (file.max_pages > 0).then_some(file.max_pages),
            max_consecutive_failures: file.max_consecutive_failures.max(1),
            request_delay: Duration::from_millis(file.request_delay_ms),
            target_delay: Duration::from_millis(file.target_delay_ms),
            settle_delay: Duration::from_millis(file.settle_delay_ms),
            page_timeout: Duration::from_secs(file.page_timeout_secs),
            strategy,
            page_param: file.page_param,
            table_selector: file.table_selector,
            source_column: file.source_column.filter(|c| !c.trim().is_empty()),
            user_agent: file.user_agent,
            next_controls,
            competitors: file.competitors,
            columns: file.columns.unwrap_or_default(),
            targets: file.targets,
        })
    }

    pub fn with_overrides(mut self, overrides: &Overrides) -> Result<Self, ConfigError> {
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(max) = overrides.max_pages {
            self.max_pages = (max > 0).then_some(max);
        }
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy;
        }
        if let Some(size) = overrides.group_size {
            self.group_size = size.max(1);
        }
        if !overrides.only.is_empty() {
            for key in &overrides.only {
                if !self.targets.iter().any(|t| &t.key == key) {
                    return Err(ConfigError::UnknownTarget(key.clone()));
                }
            }
            self.targets.retain(|t| overrides.only.contains(&t.key));
        }
        Ok(self)
    }
}

fn validate_targets(targets: &[ScrapeTarget]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::EmptyTargets);
    }
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.key.as_str()) {
            return Err(ConfigError::DuplicateKey(target.key.clone()));
        }
        if Url::parse(&target.source_url).is_err() {
            return Err(ConfigError::InvalidUrl {
                key: target.key.clone(),
                url: target.source_url.clone(),
            });
        }
    }
    Ok(())
}

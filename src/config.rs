//! Configuration stored in ~/.practice-hub/config.json
//!
//! Every field has a serde default, so `{}` is a valid config. Endpoint
//! overrides are merged over the built-in table per domain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::{Domain, UserIdentity};
use crate::util;

/// Env var pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "PRACTICE_HUB_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub attendance_cutover: CutoverConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    /// Identity to resolve at startup (headless runs have no sign-in step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<UserIdentity>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-domain overrides; domains not listed use `default_endpoint`.
    #[serde(default)]
    pub endpoints: HashMap<Domain, EndpointConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            endpoints: HashMap::new(),
        }
    }
}

impl ApiConfig {
    pub fn endpoint(&self, domain: Domain) -> EndpointConfig {
        self.endpoints
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| default_endpoint(domain))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub path: String,
    /// Legacy route tried once when the primary fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<String>,
    /// Server-sent change stream for this domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_path: Option<String>,
}

pub fn default_endpoint(domain: Domain) -> EndpointConfig {
    let (path, fallback_path, stream_path) = match domain {
        Domain::Attendance => ("attendance", None, Some("attendance/stream")),
        Domain::AnnualLeave => ("annual-leave", None, Some("annual-leave/stream")),
        Domain::TimeTotals => ("time-totals", Some("legacy/wip"), None),
        Domain::EnquiryCounts => ("enquiry-counts", Some("legacy/enquiries"), None),
        Domain::Instructions => ("instructions/pending", None, Some("instructions/stream")),
        Domain::DocumentAllocation => (
            "documents/unallocated",
            None,
            Some("documents/stream"),
        ),
        Domain::SnippetEdits => ("snippets/edits", None, Some("snippets/stream")),
    };
    EndpointConfig {
        path: path.to_string(),
        fallback_path: fallback_path.map(str::to_string),
        stream_path: stream_path.map(str::to_string),
    }
}

fn default_base_url() -> String {
    "http://localhost:7071/api/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Bumped on backend schema changes; cached entries under another version are dropped.
    #[serde(default = "default_cache_version")]
    pub cache_version: String,
    /// Upper bound on the UI loading flag.
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay before an empty list is shown as "all caught up".
    #[serde(default = "default_empty_grace_ms")]
    pub empty_grace_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    /// Overrides which domains get a change-stream subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_domains: Option<Vec<Domain>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_version: default_cache_version(),
            hard_timeout_ms: default_hard_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            empty_grace_ms: default_empty_grace_ms(),
            snapshot_path: None,
            push_domains: None,
        }
    }
}

impl SyncSettings {
    pub fn push_domains(&self) -> Vec<Domain> {
        match &self.push_domains {
            Some(domains) => domains.clone(),
            None => Domain::ALL
                .iter()
                .copied()
                .filter(Domain::supports_push)
                .collect(),
        }
    }
}

fn default_cache_version() -> String {
    "1".to_string()
}

fn default_hard_timeout_ms() -> u64 {
    5_000
}

fn default_debounce_ms() -> u64 {
    350
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_empty_grace_ms() -> u64 {
    800
}

/// When next week becomes the week to confirm attendance for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoverConfig {
    #[serde(default = "default_cutover_weekday")]
    pub weekday: String,
    #[serde(default = "default_cutover_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            weekday: default_cutover_weekday(),
            hour: default_cutover_hour(),
            minute: 0,
            timezone: default_timezone(),
        }
    }
}

impl CutoverConfig {
    pub fn weekday(&self) -> Weekday {
        self.weekday.parse().unwrap_or_else(|_| {
            log::warn!(
                "Config: unknown cutover weekday '{}', using Thursday",
                self.weekday
            );
            Weekday::Thu
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            log::warn!(
                "Config: unknown timezone '{}', using Europe/London",
                self.timezone
            );
            chrono_tz::Europe::London
        })
    }
}

fn default_cutover_weekday() -> String {
    "Thursday".to_string()
}

fn default_cutover_hour() -> u32 {
    12
}

fn default_timezone() -> String {
    "Europe/London".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolesConfig {
    /// Initials allowed to see approval actions.
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Reject values the sync core cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        url::Url::parse(&self.api.base_url)
            .map_err(|e| SyncError::Config(format!("Invalid base URL '{}': {}", self.api.base_url, e)))?;
        if self.sync.hard_timeout_ms == 0 {
            return Err(SyncError::Config("hardTimeoutMs must be positive".to_string()));
        }
        if self.sync.debounce_ms == 0 {
            return Err(SyncError::Config("debounceMs must be positive".to_string()));
        }
        if self.sync.cache_version.trim().is_empty() {
            return Err(SyncError::Config("cacheVersion must not be empty".to_string()));
        }
        if self.attendance_cutover.hour > 23 || self.attendance_cutover.minute > 59 {
            return Err(SyncError::Config(format!(
                "Invalid cutover time {:02}:{:02}",
                self.attendance_cutover.hour, self.attendance_cutover.minute
            )));
        }
        Ok(())
    }
}

/// Get the config file path (env override, else ~/.practice-hub/config.json)
pub fn config_path() -> Result<PathBuf, SyncError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(util::state_dir()?.join("config.json"))
}

/// Load and validate a config file. A missing file is an error here.
pub fn load_config_from(path: &Path) -> Result<Config, SyncError> {
    let config: Config =
        util::read_json(path)?.ok_or_else(|| SyncError::ConfigNotFound(path.to_path_buf()))?;
    config.validate()?;
    Ok(config)
}

/// Load the config from the default location, falling back to defaults when absent.
pub fn load_config() -> Result<Config, SyncError> {
    let path = config_path()?;
    match load_config_from(&path) {
        Ok(config) => Ok(config),
        Err(SyncError::ConfigNotFound(_)) => {
            log::info!(
                "Config: no file at {}, using defaults",
                path.display()
            );
            Ok(Config::default())
        }
        Err(e) => Err(e),
    }
}

pub fn save_config(path: &Path, config: &Config) -> Result<(), SyncError> {
    config.validate()?;
    util::write_json_atomic(path, config)
}

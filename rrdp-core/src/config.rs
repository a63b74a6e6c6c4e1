//! Configuration for the synchronization scheduler.
//!
//! Loaded from a TOML file with a `[scheduler]` table and one
//! `[[repository]]` table per publication point, or built in code with the
//! `with_*` methods.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::fetch::HttpFetchConfig;
use crate::state::{RepositoryDescriptor, DEFAULT_FETCH_TIMEOUT};
use crate::store::is_valid_id;
use crate::validate::{AcceptAll, ExtensionFilter, ObjectValidator};

/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduler-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Nominal delay between cycles of one repository.
    pub interval: Duration,
    /// Maximum number of cycles running at once.
    pub max_concurrency: usize,
    /// Deadline for a whole cycle.
    pub cycle_timeout: Duration,
    /// Cap on the failure backoff.
    pub max_backoff: Duration,
    /// Dispatch loop resolution.
    pub tick: Duration,
    /// Where repository state and outcome logs live.
    pub state_dir: PathBuf,
    pub user_agent: String,
    /// Largest document the HTTP client accepts.
    pub max_document_bytes: usize,
    /// Only accept objects with these file extensions; `None` accepts all.
    pub object_extensions: Option<Vec<String>>,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        let http = HttpFetchConfig::default();
        Self {
            interval: Duration::from_secs(600),
            max_concurrency: 8,
            cycle_timeout: Duration::from_secs(300),
            max_backoff: Duration::from_secs(3600),
            tick: Duration::from_secs(1),
            state_dir: PathBuf::from("state"),
            user_agent: http.user_agent,
            max_document_bytes: http.max_body_bytes,
            object_extensions: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_object_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.object_extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    /// Validator applied to every object before a cycle commits.
    pub fn object_validator(&self) -> Arc<dyn ObjectValidator> {
        match &self.object_extensions {
            Some(extensions) => Arc::new(ExtensionFilter::new(extensions.iter().cloned())),
            None => Arc::new(AcceptAll),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.interval, self.max_backoff)
    }

    pub fn http_fetch_config(&self) -> HttpFetchConfig {
        HttpFetchConfig {
            user_agent: self.user_agent.clone(),
            request_timeout: self.cycle_timeout,
            max_body_bytes: self.max_document_bytes,
            ..HttpFetchConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(invalid("scheduler.interval_secs must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("scheduler.max_concurrency must be positive"));
        }
        if self.cycle_timeout.is_zero() {
            return Err(invalid("scheduler.cycle_timeout_secs must be positive"));
        }
        if self.tick.is_zero() {
            return Err(invalid("scheduler.tick_millis must be positive"));
        }
        if self.max_backoff < self.interval {
            return Err(invalid(
                "scheduler.max_backoff_secs must not be below scheduler.interval_secs",
            ));
        }
        if self.max_document_bytes == 0 {
            return Err(invalid("scheduler.max_document_bytes must be positive"));
        }
        for (name, value) in [
            ("scheduler.interval_secs", self.interval),
            ("scheduler.cycle_timeout_secs", self.cycle_timeout),
            ("scheduler.max_backoff_secs", self.max_backoff),
            ("scheduler.tick_millis", self.tick),
        ] {
            check_duration(name, value)?;
        }
        if let Some(extensions) = &self.object_extensions {
            if extensions.is_empty() {
                return Err(invalid("scheduler.object_extensions must not be empty"));
            }
            if let Some(bad) = extensions
                .iter()
                .find(|e| e.trim_start_matches('.').is_empty())
            {
                return Err(invalid(format!(
                    "scheduler.object_extensions contains an empty extension {:?}",
                    bad
                )));
            }
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub repositories: Vec<RepositoryDescriptor>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.repositories.is_empty() {
            return Err(invalid("at least one [[repository]] is required"));
        }

        let mut names = HashSet::new();
        for repo in &self.repositories {
            if !is_valid_id(&repo.id) {
                return Err(invalid(format!(
                    "repository name {:?} must be non-empty and use only [A-Za-z0-9._-]",
                    repo.id
                )));
            }
            if !names.insert(repo.id.as_str()) {
                return Err(invalid(format!("duplicate repository name {:?}", repo.id)));
            }
            check_url(&repo.id, &repo.notification_url)?;
            if repo.fetch_timeout.is_zero() {
                return Err(invalid(format!(
                    "repository {:?}: fetch_timeout_secs must be positive",
                    repo.id
                )));
            }
            check_duration(
                &format!("repository {:?}: fetch_timeout_secs", repo.id),
                repo.fetch_timeout,
            )?;
            if repo.connect_to.keys().any(|host| host.trim().is_empty()) {
                return Err(invalid(format!(
                    "repository {:?}: connect_to host names must not be empty",
                    repo.id
                )));
            }
        }
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryDescriptor> {
        self.repositories.iter().find(|r| r.id == name)
    }
}

fn check_url(name: &str, url: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        Ok(parsed) => Err(invalid(format!(
            "repository {:?}: unsupported notification URL scheme {:?}",
            name,
            parsed.scheme()
        ))),
        Err(e) => Err(invalid(format!(
            "repository {:?}: invalid notification URL {:?}: {}",
            name, url, e
        ))),
    }
}

fn check_duration(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_DURATION {
        return Err(invalid(format!(
            "{} must not exceed {} seconds",
            name,
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    repository: Vec<RepositorySection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerSection {
    interval_secs: Option<u64>,
    max_concurrency: Option<usize>,
    cycle_timeout_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    tick_millis: Option<u64>,
    state_dir: Option<PathBuf>,
    user_agent: Option<String>,
    max_document_bytes: Option<usize>,
    object_extensions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositorySection {
    name: String,
    notification_url: String,
    trust_anchor: Option<String>,
    override_hostname: Option<String>,
    fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    strict_session_id: bool,
    #[serde(default)]
    connect_to: BTreeMap<String, SocketAddr>,
}

impl ConfigFile {
    fn into_config(self) -> Config {
        let s = self.scheduler;
        let mut scheduler = SchedulerConfig::new();
        if let Some(v) = s.interval_secs {
            scheduler.interval = Duration::from_secs(v);
        }
        if let Some(v) = s.max_concurrency {
            scheduler.max_concurrency = v;
        }
        if let Some(v) = s.cycle_timeout_secs {
            scheduler.cycle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = s.max_backoff_secs {
            scheduler.max_backoff = Duration::from_secs(v);
        }
        if let Some(v) = s.tick_millis {
            scheduler.tick = Duration::from_millis(v);
        }
        if let Some(v) = s.state_dir {
            scheduler.state_dir = v;
        }
        if let Some(v) = s.user_agent {
            scheduler.user_agent = v;
        }
        if let Some(v) = s.max_document_bytes {
            scheduler.max_document_bytes = v;
        }
        scheduler.object_extensions = s.object_extensions;

        let repositories = self
            .repository
            .into_iter()
            .map(|r| {
                let mut descriptor = RepositoryDescriptor::new(r.name, r.notification_url)
                    .with_fetch_timeout(
                        r.fetch_timeout_secs
                            .map(Duration::from_secs)
                            .unwrap_or(DEFAULT_FETCH_TIMEOUT),
                    )
                    .with_strict_session_id(r.strict_session_id);
                descriptor.trust_anchor = r.trust_anchor;
                descriptor.override_hostname = r.override_hostname;
                descriptor.connect_to = r.connect_to;
                descriptor
            })
            .collect();

        Config {
            scheduler,
            repositories,
        }
    }
}

//! Agent configuration.
//!
//! The configuration is fixed per deployment: changing `version` is the only
//! way to roll a new cache generation. It is built once (in code or from a
//! JSON file) and shared behind an `Arc`, never mutated afterwards.
//!
//! A config file looks like:
//!
//! ```json
//! {
//!   "version": "1.0.1",
//!   "scope": "https://tools.example.com/",
//!   "core_assets": ["/", "/index.html", "/css/tools.css"],
//!   "optional_assets": ["/img/logo.png"],
//!   "exclusions": [{ "kind": "matches", "value": "\\.map$" }]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Default prefix shared by every cache generation this agent owns
pub const DEFAULT_CACHE_PREFIX: &str = "pagekeeper-";

/// Assets every generation pre-caches unless overridden
const DEFAULT_CORE_ASSETS: &[&str] = &["/", "/index.html"];

/// Documents served to navigations when the network is gone, in order
const DEFAULT_OFFLINE_FALLBACKS: &[&str] = &["/", "/index.html"];

/// Source map URLs, with or without a query string
static SOURCE_MAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.map(\?.*)?$").expect("Invalid SOURCE_MAP_RE regex"));

/// A rule that keeps matching URLs out of the cache entirely.
#[derive(Debug, Clone)]
pub enum ExclusionRule {
    Contains(String),
    Matches(Regex),
}

impl ExclusionRule {
    pub fn contains(needle: impl Into<String>) -> Self {
        ExclusionRule::Contains(needle.into())
    }

    pub fn matches(pattern: &str) -> Result<Self, regex::Error> {
        Ok(ExclusionRule::Matches(Regex::new(pattern)?))
    }

    pub fn is_match(&self, url: &str) -> bool {
        match self {
            ExclusionRule::Contains(needle) => url.contains(needle.as_str()),
            ExclusionRule::Matches(re) => re.is_match(url),
        }
    }

    fn to_spec(&self) -> RuleSpec {
        match self {
            ExclusionRule::Contains(needle) => RuleSpec::Contains(needle.clone()),
            ExclusionRule::Matches(re) => RuleSpec::Matches(re.as_str().to_string()),
        }
    }
}

/// Source maps, browser-extension schemes and the reserved `/__/` segment.
pub fn default_exclusions() -> Vec<ExclusionRule> {
    vec![
        ExclusionRule::Matches(SOURCE_MAP_RE.clone()),
        ExclusionRule::contains("chrome-extension://"),
        ExclusionRule::contains("moz-extension://"),
        ExclusionRule::contains("/__/"),
    ]
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Generation identifier, e.g. a semantic version
    pub version: String,
    pub cache_prefix: String,
    /// Base URL of the app; asset paths resolve against it
    pub scope: Url,
    pub core_assets: Vec<String>,
    /// Pre-cached best-effort; failures never fail install
    pub optional_assets: Vec<String>,
    pub offline_fallbacks: Vec<String>,
    /// External hosts allowed to participate in caching
    pub allowed_hosts: Vec<String>,
    pub exclusions: Vec<ExclusionRule>,
    pub fetch_timeout_secs: Option<u64>,
}

impl AgentConfig {
    pub fn new(version: impl Into<String>, scope: Url) -> Self {
        Self {
            version: version.into(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            scope,
            core_assets: to_strings(DEFAULT_CORE_ASSETS),
            optional_assets: Vec::new(),
            offline_fallbacks: to_strings(DEFAULT_OFFLINE_FALLBACKS),
            allowed_hosts: Vec::new(),
            exclusions: default_exclusions(),
            fetch_timeout_secs: None,
        }
    }

    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    pub fn with_core_assets<S: AsRef<str>>(mut self, assets: &[S]) -> Self {
        self.core_assets = assets.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_optional_assets<S: AsRef<str>>(mut self, assets: &[S]) -> Self {
        self.optional_assets = assets.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_allowed_hosts<S: AsRef<str>>(mut self, hosts: &[S]) -> Self {
        self.allowed_hosts = hosts.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_exclusion(mut self, rule: ExclusionRule) -> Self {
        self.exclusions.push(rule);
        self
    }

    /// Reject settings that would make generation bookkeeping unsafe.
    ///
    /// An empty prefix would make every cache in the storage look like one of
    /// ours, so cleanup would delete stores this agent never created.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.version.trim().is_empty() {
            return Err(AgentError::InvalidConfig("version must not be empty".to_string()));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(AgentError::InvalidConfig("cache_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Per-request network timeout; `None` waits indefinitely
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }

    /// Name of the cache owned by this generation
    pub fn cache_name(&self) -> String {
        format!("{}{}", self.cache_prefix, self.version)
    }

    /// Resolve an asset path against the scope. A leading `/` means the
    /// scope root, so apps hosted under a sub-path keep working.
    pub fn resolve(&self, path: &str) -> Result<Url, AgentError> {
        if path.contains("://") {
            return Url::parse(path).map_err(|e| AgentError::InvalidAssetPath {
                path: path.to_string(),
                reason: e.to_string(),
            });
        }
        self.scope
            .join(path.trim_start_matches('/'))
            .map_err(|e| AgentError::InvalidAssetPath {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(contents).context("Failed to parse config JSON")?;
        file.into_config()
    }

    pub fn to_json(&self) -> Result<String> {
        let file = ConfigFile {
            version: self.version.clone(),
            scope: self.scope.to_string(),
            cache_prefix: Some(self.cache_prefix.clone()),
            core_assets: Some(self.core_assets.clone()),
            optional_assets: self.optional_assets.clone(),
            offline_fallbacks: Some(self.offline_fallbacks.clone()),
            allowed_hosts: self.allowed_hosts.clone(),
            exclusions: Some(self.exclusions.iter().map(ExclusionRule::to_spec).collect()),
            fetch_timeout_secs: self.fetch_timeout_secs,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum RuleSpec {
    Contains(String),
    Matches(String),
}

/// On-disk shape; omitted lists fall back to the built-in defaults.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    version: String,
    scope: String,
    #[serde(default)]
    cache_prefix: Option<String>,
    #[serde(default)]
    core_assets: Option<Vec<String>>,
    #[serde(default)]
    optional_assets: Vec<String>,
    #[serde(default)]
    offline_fallbacks: Option<Vec<String>>,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default)]
    exclusions: Option<Vec<RuleSpec>>,
    #[serde(default)]
    fetch_timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn into_config(self) -> Result<AgentConfig> {
        let scope = Url::parse(&self.scope)
            .with_context(|| format!("Invalid scope URL: {}", self.scope))?;

        let mut config = AgentConfig::new(self.version, scope);
        if let Some(prefix) = self.cache_prefix {
            config.cache_prefix = prefix;
        }
        if let Some(core) = self.core_assets {
            config.core_assets = core;
        }
        if let Some(fallbacks) = self.offline_fallbacks {
            config.offline_fallbacks = fallbacks;
        }
        config.optional_assets = self.optional_assets;
        config.allowed_hosts = self.allowed_hosts;
        config.fetch_timeout_secs = self.fetch_timeout_secs;

        if let Some(rules) = self.exclusions {
            config.exclusions = rules
                .into_iter()
                .map(|rule| match rule {
                    RuleSpec::Contains(needle) => Ok(ExclusionRule::Contains(needle)),
                    RuleSpec::Matches(pattern) => ExclusionRule::matches(&pattern)
                        .with_context(|| format!("Invalid exclusion pattern: {}", pattern)),
                })
                .collect::<Result<_>>()?;
        }

        config.validate()?;

        // Every asset must resolve now rather than at install time
        for path in config
            .core_assets
            .iter()
            .chain(&config.optional_assets)
            .chain(&config.offline_fallbacks)
        {
            config.resolve(path)?;
        }

        Ok(config)
    }
}

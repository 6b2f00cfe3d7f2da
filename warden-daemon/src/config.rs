//! Daemon configuration.
//!
//! Loaded once at startup from a YAML file. Everything except `services`
//! has a default; unknown keys are rejected so typos surface immediately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::{DaemonError, Result};
use crate::roles::Role;

/// Whether this daemon owns sessions or delegates to another daemon that does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Owns users, roles and sessions; validates tokens locally
    #[default]
    Authority,
    /// Delegates token validation to an authority over its socket
    Dependent,
}

/// Which process manager backs log tailing and restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessManagerKind {
    /// `journalctl` / `systemctl`
    #[default]
    Systemd,
    /// Run `log_query_args` and `restart_command` directly as argv
    Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default)]
    pub mode: Mode,
    /// Socket this daemon listens on (default `~/.warden/warden.sock`)
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Required in dependent mode
    #[serde(default)]
    pub authority: Option<AuthorityConfig>,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub process_manager: ProcessManagerKind,
    pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorityConfig {
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl", deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
    #[serde(default = "default_purge_interval", deserialize_with = "deserialize_duration")]
    pub purge_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            purge_interval: default_purge_interval(),
        }
    }
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Per-attempt timeout for a call to the authority
    #[serde(default = "default_validator_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_cache_ttl", deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    /// Extra attempts after the first one fails
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay before the first retry; doubles after each attempt
    #[serde(default = "default_backoff", deserialize_with = "deserialize_duration")]
    pub backoff: Duration,
    /// Delay between attempts to reopen the revocation feed
    #[serde(default = "default_reconnect_delay", deserialize_with = "deserialize_duration")]
    pub reconnect_delay: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: default_validator_timeout(),
            cache_ttl: default_cache_ttl(),
            retries: default_retries(),
            backoff: default_backoff(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

fn default_validator_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    2
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// How long a tailing process outlives its last subscriber
    #[serde(default = "default_grace_period", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,
    /// Lines buffered per subscriber before it is disconnected
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Time between SIGTERM and SIGKILL when stopping a tailing process
    #[serde(default = "default_stop_timeout", deserialize_with = "deserialize_duration")]
    pub stop_timeout: Duration,
    /// Least privileged role allowed to view logs
    #[serde(default = "default_viewer_role")]
    pub viewer_role: Role,
    /// How often an open stream re-checks its session
    #[serde(default = "default_reauth_interval", deserialize_with = "deserialize_duration")]
    pub reauth_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            buffer_capacity: default_buffer_capacity(),
            stop_timeout: default_stop_timeout(),
            viewer_role: default_viewer_role(),
            reauth_interval: default_reauth_interval(),
        }
    }
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_viewer_role() -> Role {
    Role::Moderator
}

fn default_reauth_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_restart_timeout", deserialize_with = "deserialize_duration")]
    pub restart_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            restart_timeout: default_restart_timeout(),
        }
    }
}

fn default_restart_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Append-only JSON-lines file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Also emit entries as tracing events on the `warden::audit` target
    #[serde(default = "default_true")]
    pub tracing: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            tracing: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A managed service as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Arguments handed to the process manager's tail primitive
    pub log_query_args: Vec<String>,
    /// Restart argv for the `command` process manager
    #[serde(default)]
    pub restart_command: Option<Vec<String>>,
}

/// A managed service, resolved from its config entry. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub log_query_args: Vec<String>,
    pub restart_command: Option<Vec<String>>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, log_query_args: Vec<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            log_query_args,
            restart_command: None,
        }
    }

    pub fn with_restart_command(mut self, argv: Vec<String>) -> Self {
        self.restart_command = Some(argv);
        self
    }
}

/// The fixed set of managed services, by name.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: BTreeMap<String, Arc<ServiceDefinition>>,
}

impl ServiceCatalog {
    pub fn new(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        Self {
            services: definitions
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(d)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl WardenConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::ConfigNotFound(path.to_path_buf())
            } else {
                DaemonError::Io(e)
            }
        })?;
        Self::parse(&contents).map_err(|e| match e {
            ParseFailure::Yaml(source) => DaemonError::ConfigParse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(msg) => DaemonError::Config(msg),
        })
    }

    /// Parse and validate config text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Self::parse(contents).map_err(|e| match e {
            ParseFailure::Yaml(source) => DaemonError::ConfigParse {
                path: PathBuf::from("<inline>"),
                source,
            },
            ParseFailure::Invalid(msg) => DaemonError::Config(msg),
        })
    }

    fn parse(contents: &str) -> std::result::Result<Self, ParseFailure> {
        let deserializer = serde_yaml::Deserializer::from_str(contents);
        let config: WardenConfig =
            serde_path_to_error::deserialize(deserializer).map_err(ParseFailure::Yaml)?;
        config.validate().map_err(ParseFailure::Invalid)?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.mode == Mode::Dependent && self.authority.is_none() {
            return Err("dependent mode requires an `authority.socket_path`".into());
        }
        if self.hub.buffer_capacity == 0 {
            return Err("hub.buffer_capacity must be at least 1".into());
        }
        if self.hub.reauth_interval.is_zero() || self.sessions.purge_interval.is_zero() {
            return Err("hub.reauth_interval and sessions.purge_interval must be non-zero".into());
        }
        for (name, entry) in &self.services {
            if name.trim().is_empty() {
                return Err("service names must not be empty".into());
            }
            if entry.log_query_args.is_empty() {
                return Err(format!("services.{}: log_query_args must not be empty", name));
            }
            if self.process_manager == ProcessManagerKind::Command
                && entry.restart_command.as_ref().is_none_or(|argv| argv.is_empty())
            {
                return Err(format!(
                    "services.{}: restart_command is required with the command process manager",
                    name
                ));
            }
        }
        Ok(())
    }

    /// Resolve the configured services into immutable definitions.
    pub fn catalog(&self) -> ServiceCatalog {
        ServiceCatalog::new(self.services.iter().map(|(name, entry)| ServiceDefinition {
            name: name.clone(),
            display_name: entry.display_name.clone().unwrap_or_else(|| name.clone()),
            description: entry.description.clone(),
            log_query_args: entry.log_query_args.clone(),
            restart_command: entry.restart_command.clone(),
        }))
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => crate::default_socket_path(),
        }
    }
}

enum ParseFailure {
    Yaml(serde_path_to_error::Error<serde_yaml::Error>),
    Invalid(String),
}

/// Suffixes accepted on interval settings, in milliseconds.
const DURATION_UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
];

/// Parse an interval such as `250ms`, `30s`, `15m`, `12h` or `7d`. A bare
/// number is seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    if digits.is_empty() {
        return Err(format!("interval {:?} has no number", raw));
    }

    let suffix = suffix.trim().to_ascii_lowercase();
    let scale = match suffix.as_str() {
        "" => 1_000,
        unit => DURATION_UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| format!("interval {:?} has unknown unit {:?}", raw, unit))?,
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map(Duration::from_millis)
        .ok_or_else(|| format!("interval {:?} is out of range", raw))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

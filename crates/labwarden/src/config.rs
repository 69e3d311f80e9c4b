//! Runtime configuration.
//!
//! Every setting can be given as a flag or through the environment variable
//! the legacy deployment used. Raw arguments are checked once by
//! [`ServiceArgs::validate`]; nothing downstream re-reads the environment.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::error::ConfigError;

/// Default Webex API base URL.
pub const DEFAULT_WEBEX_API: &str = notify::channels::webex::DEFAULT_API_BASE;

/// Default record file, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = "labwarden-records.json";

/// Default timeout for every outbound HTTP call.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

const SECS_PER_HOUR: f64 = 3600.0;

/// What happens to a lab whose deletion deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationPolicy {
    /// Stop, wipe and delete the lab on the platform, then forget it.
    #[default]
    Cascade,
    /// Only drop the tracking record; the lab is left on the platform.
    RecordOnly,
}

/// Alert and dead thresholds, in seconds. `dead > alert > 0` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    alert_secs: u64,
    dead_secs: u64,
}

impl Thresholds {
    pub fn new(alert_secs: u64, dead_secs: u64) -> Result<Self, ConfigError> {
        if alert_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "alert threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        if dead_secs <= alert_secs {
            return Err(ConfigError::Thresholds {
                alert_secs,
                dead_secs,
            });
        }
        Ok(Self {
            alert_secs,
            dead_secs,
        })
    }

    /// Build thresholds from fractional hours.
    pub fn from_hours(alert_hours: f64, dead_hours: f64) -> Result<Self, ConfigError> {
        Self::new(
            hours_to_secs("alert-hours", alert_hours)?,
            hours_to_secs("dead-hours", dead_hours)?,
        )
    }

    #[must_use]
    pub const fn alert_secs(&self) -> u64 {
        self.alert_secs
    }

    #[must_use]
    pub const fn dead_secs(&self) -> u64 {
        self.dead_secs
    }
}

/// Knobs for the reconciliation engine.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineOptions {
    pub thresholds: Thresholds,
    pub termination: TerminationPolicy,
    /// Only consider labs with at least one node that is actually running,
    /// and measure their age by the longest node boot time.
    pub require_booted_nodes: bool,
}

/// Where lab records are persisted.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// JSON file holding the lab tracking records
    #[arg(long, env = "LABWARDEN_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,
}

/// Messaging channel settings.
#[derive(Debug, Clone, Args)]
pub struct MessagingArgs {
    /// Webex bot access token
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    pub webex_token: Option<String>,

    /// Webex API base URL
    #[arg(long, env = "WEBEX_API_URL", default_value = DEFAULT_WEBEX_API)]
    pub webex_api: String,

    /// Timeout in seconds applied to every HTTP request
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,
}

/// Validated messaging settings.
#[derive(Debug, Clone)]
pub struct MessagingSettings {
    pub token: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl MessagingArgs {
    pub fn validate(&self) -> Result<MessagingSettings, ConfigError> {
        let token = self
            .webex_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("ACCESS_TOKEN / --webex-token"))?;

        Ok(MessagingSettings {
            token: token.to_string(),
            api_base: self.webex_api.clone(),
            timeout: http_timeout(self.http_timeout_secs)?,
        })
    }
}

/// Everything the polling service needs.
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// Comma separated lab servers (host or host:port)
    #[arg(long = "servers", env = "SERVER_LIST", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Lab platform username
    #[arg(long, env = "VIRL_USERNAME")]
    pub virl_username: Option<String>,

    /// Lab platform password
    #[arg(long, env = "VIRL_PASSWORD", hide_env_values = true)]
    pub virl_password: Option<String>,

    /// Accept self-signed certificates from lab servers
    #[arg(long, env = "VIRL_INSECURE")]
    pub accept_invalid_certs: bool,

    /// Lab age, in hours, after which its owner is warned
    #[arg(long, env = "ALERT_TIMER_HOURS")]
    pub alert_hours: Option<f64>,

    /// Hours after a warning before an unextended lab is reclaimed
    #[arg(long, env = "DEAD_TIMER_HOURS")]
    pub dead_hours: Option<f64>,

    /// Hours to sleep between cycles
    #[arg(long, env = "PROGRAM_LOOP_HOURS")]
    pub loop_hours: Option<f64>,

    /// What to do with a lab past its deletion deadline
    #[arg(
        long,
        env = "TERMINATION_POLICY",
        value_enum,
        default_value_t = TerminationPolicy::Cascade
    )]
    pub termination: TerminationPolicy,

    /// Ignore labs with no running nodes and age labs by node boot time
    #[arg(
        long,
        env = "REQUIRE_BOOTED_NODES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub require_booted_nodes: bool,

    #[command(flatten)]
    pub messaging: MessagingArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Lab platform login.
#[derive(Clone)]
pub struct PlatformCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validated service settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub servers: Vec<String>,
    pub credentials: PlatformCredentials,
    pub accept_invalid_certs: bool,
    pub engine: EngineOptions,
    pub cycle_interval: Duration,
    pub messaging: MessagingSettings,
    pub state_file: PathBuf,
}

impl Settings {
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        self.messaging.timeout
    }
}

impl ServiceArgs {
    /// Check every setting and convert to [`Settings`].
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let mut seen = BTreeSet::new();
        let servers: Vec<String> = self
            .servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::Missing("SERVER_LIST / --servers"));
        }

        let username = required(self.virl_username.as_deref(), "VIRL_USERNAME / --virl-username")?;
        let password = required(self.virl_password.as_deref(), "VIRL_PASSWORD / --virl-password")?;

        let alert_hours = self
            .alert_hours
            .ok_or(ConfigError::Missing("ALERT_TIMER_HOURS / --alert-hours"))?;
        let dead_hours = self
            .dead_hours
            .ok_or(ConfigError::Missing("DEAD_TIMER_HOURS / --dead-hours"))?;
        let loop_hours = self
            .loop_hours
            .ok_or(ConfigError::Missing("PROGRAM_LOOP_HOURS / --loop-hours"))?;

        let thresholds = Thresholds::from_hours(alert_hours, dead_hours)?;
        let cycle_interval = Duration::from_secs(hours_to_secs("loop-hours", loop_hours)?);

        Ok(Settings {
            servers,
            credentials: PlatformCredentials { username, password },
            accept_invalid_certs: self.accept_invalid_certs,
            engine: EngineOptions {
                thresholds,
                termination: self.termination,
                require_booted_nodes: self.require_booted_nodes,
            },
            cycle_interval,
            messaging: self.messaging.validate()?,
            state_file: self.store.state_file.clone(),
        })
    }
}

fn required(value: Option<&str>, name: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
        .ok_or(ConfigError::Missing(name))
}

fn hours_to_secs(name: &'static str, hours: f64) -> Result<u64, ConfigError> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("expected a positive number of hours, got {hours}"),
        });
    }
    let secs = (hours * SECS_PER_HOUR).round();
    if secs < 1.0 {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("{hours} hours is shorter than one second"),
        });
    }
    Ok(secs as u64)
}

fn http_timeout(secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name: "http-timeout-secs",
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

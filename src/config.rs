use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DurableError;
use crate::pool::BackoffPolicy;
use crate::session::SessionIdentity;
use crate::types::{InterestEntry, InterestPattern};

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
fn expand_env_vars(input: &str) -> Result<String, regex::Error> {
  let pattern = Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)")?;
  let expanded = pattern.replace_all(input, |caps: &Captures<'_>| {
    caps
      .get(1)
      .or_else(|| caps.get(2))
      .and_then(|name| std::env::var(name.as_str()).ok())
      .unwrap_or_default()
  });
  Ok(expanded.into_owned())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
  #[serde(default)]
  pub session: SessionSection,
  #[serde(default)]
  pub pool: PoolConfig,
  #[serde(default)]
  pub interests: Vec<InterestSection>,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
  /// Stable id; supplying the same one after a restart resumes the session.
  /// Left unset, the client is non-durable.
  #[serde(default)]
  pub durable_client_id: Option<String>,
  #[serde(default = "default_durable_timeout_secs")]
  pub durable_timeout_secs: u64,
  #[serde(default)]
  pub redundancy_level: u32,
  /// Ask servers to keep the queue when the CLI exits
  #[serde(default = "default_true")]
  pub keep_alive_on_exit: bool,
}

fn default_durable_timeout_secs() -> u64 {
  300
}

fn default_true() -> bool {
  true
}

impl Default for SessionSection {
  fn default() -> Self {
    Self {
      durable_client_id: None,
      durable_timeout_secs: default_durable_timeout_secs(),
      redundancy_level: 0,
      keep_alive_on_exit: true,
    }
  }
}

/// Endpoints and health-check settings for the redundant connection set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
  #[serde(default)]
  pub endpoints: Vec<String>,
  #[serde(default = "default_ping_interval_ms")]
  pub ping_interval_ms: u64,
  #[serde(default = "default_ping_timeout_ms")]
  pub ping_timeout_ms: u64,
  /// Per-request timeout used by network transports
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
  #[serde(default)]
  pub reconnect: BackoffPolicy,
}

fn default_ping_interval_ms() -> u64 {
  10_000
}
fn default_ping_timeout_ms() -> u64 {
  5_000
}
fn default_request_timeout_ms() -> u64 {
  30_000
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      endpoints: Vec::new(),
      ping_interval_ms: default_ping_interval_ms(),
      ping_timeout_ms: default_ping_timeout_ms(),
      request_timeout_ms: default_request_timeout_ms(),
      reconnect: BackoffPolicy::default(),
    }
  }
}

impl PoolConfig {
  pub fn with_endpoints<I, S>(endpoints: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      endpoints: endpoints.into_iter().map(Into::into).collect(),
      ..Default::default()
    }
  }

  pub fn ping_interval(&self) -> Duration {
    Duration::from_millis(self.ping_interval_ms.max(1))
  }

  pub fn ping_timeout(&self) -> Duration {
    Duration::from_millis(self.ping_timeout_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

/// An interest to register at startup. Exactly one of `keys` or `regex`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterestSection {
  pub region: String,
  #[serde(default)]
  pub keys: Vec<String>,
  #[serde(default)]
  pub regex: Option<String>,
  #[serde(default)]
  pub durable: bool,
}

impl InterestSection {
  pub fn to_entry(&self) -> Result<InterestEntry, DurableError> {
    let pattern = match (&self.regex, self.keys.is_empty()) {
      (Some(expr), true) => InterestPattern::regex(expr.clone()),
      (None, false) => InterestPattern::keys(self.keys.iter().cloned()),
      (Some(_), false) => {
        return Err(DurableError::Config(format!(
          "interest on `{}` sets both keys and regex",
          self.region
        )))
      }
      (None, true) => {
        return Err(DurableError::Config(format!(
          "interest on `{}` needs keys or regex",
          self.region
        )))
      }
    };
    Ok(InterestEntry::new(self.region.clone(), pattern, self.durable))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ClientConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content)?;
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["durasub.yaml", "durasub.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Identity to present to servers. Without a configured id the client is
  /// non-durable and gets a generated one.
  pub fn session_identity(&self) -> Result<SessionIdentity, DurableError> {
    match &self.session.durable_client_id {
      Some(id) => SessionIdentity::new(
        id.clone(),
        self.session.durable_timeout_secs,
        self.session.redundancy_level,
      ),
      None => Ok(SessionIdentity::non_durable(self.session.redundancy_level)),
    }
  }

  pub fn interest_entries(&self) -> Result<Vec<InterestEntry>, DurableError> {
    self.interests.iter().map(InterestSection::to_entry).collect()
  }
}

//! Durable session identity.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::DurableError;

/// Longest durable timeout a session may ask for (one year).
pub const MAX_DURABLE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Identity a client presents to every server it connects to.
///
/// Supplying the same identity from a restarted process resumes the durable
/// session the server is still retaining for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
  durable_client_id: String,
  durable_timeout_secs: u64,
  redundancy_level: u32,
}

impl SessionIdentity {
  pub fn new(
    durable_client_id: impl Into<String>,
    durable_timeout_secs: u64,
    redundancy_level: u32,
  ) -> Result<Self, DurableError> {
    let durable_client_id = durable_client_id.into();
    if durable_client_id.trim().is_empty() {
      return Err(DurableError::Config(
        "durable_client_id must not be empty".into(),
      ));
    }
    if durable_timeout_secs > MAX_DURABLE_TIMEOUT_SECS {
      return Err(DurableError::Config(format!(
        "durable_timeout_secs {} exceeds the maximum of {}",
        durable_timeout_secs, MAX_DURABLE_TIMEOUT_SECS
      )));
    }
    Ok(Self {
      durable_client_id,
      durable_timeout_secs,
      redundancy_level,
    })
  }

  /// A client whose server-side state is discarded on any disconnect.
  pub fn non_durable(redundancy_level: u32) -> Self {
    Self {
      durable_client_id: format!("anon-{}", Uuid::new_v4()),
      durable_timeout_secs: 0,
      redundancy_level,
    }
  }

  pub fn durable_client_id(&self) -> &str {
    &self.durable_client_id
  }

  pub fn durable_timeout_secs(&self) -> u64 {
    self.durable_timeout_secs
  }

  pub fn durable_timeout(&self) -> Duration {
    Duration::from_secs(self.durable_timeout_secs)
  }

  pub fn redundancy_level(&self) -> u32 {
    self.redundancy_level
  }

  pub fn is_durable(&self) -> bool {
    self.durable_timeout_secs > 0
  }
}

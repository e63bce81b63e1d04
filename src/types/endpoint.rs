use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Role of a server within the redundant connection set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
  Primary,
  Secondary,
  Unavailable,
}

impl std::fmt::Display for EndpointRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EndpointRole::Primary => write!(f, "primary"),
      EndpointRole::Secondary => write!(f, "secondary"),
      EndpointRole::Unavailable => write!(f, "unavailable"),
    }
  }
}

/// Point-in-time view of one server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
  pub address: String,
  pub role: EndpointRole,
  /// Last successful open or liveness check
  pub last_contact: Option<Instant>,
}

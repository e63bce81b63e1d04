use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which keys of a region an interest covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum InterestPattern {
  /// An explicit list of keys
  Keys(BTreeSet<String>),
  /// A regular expression matched against the whole key
  Regex(String),
}

impl InterestPattern {
  pub fn keys<I, S>(keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self::Keys(keys.into_iter().map(Into::into).collect())
  }

  pub fn key(key: impl Into<String>) -> Self {
    Self::keys([key.into()])
  }

  pub fn regex(expr: impl Into<String>) -> Self {
    Self::Regex(expr.into())
  }

  /// Human-readable form used in logs and error messages
  pub fn describe(&self) -> String {
    match self {
      Self::Keys(keys) => {
        let list: Vec<&str> = keys.iter().map(String::as_str).collect();
        format!("[{}]", list.join(", "))
      }
      Self::Regex(expr) => format!("/{}/", expr),
    }
  }
}

/// A registered interest in part of a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestEntry {
  pub region: String,
  pub pattern: InterestPattern,
  pub durable: bool,
}

impl InterestEntry {
  pub fn new(region: impl Into<String>, pattern: InterestPattern, durable: bool) -> Self {
    Self {
      region: region.into(),
      pattern,
      durable,
    }
  }

  pub fn durable(region: impl Into<String>, pattern: InterestPattern) -> Self {
    Self::new(region, pattern, true)
  }

  pub fn non_durable(region: impl Into<String>, pattern: InterestPattern) -> Self {
    Self::new(region, pattern, false)
  }
}

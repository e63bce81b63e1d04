use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::DurableError;
use crate::types::{InterestEntry, InterestPattern};

/// How a key is covered by the registered interests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInterest {
  Durable,
  NonDurable,
}

impl KeyInterest {
  pub fn is_durable(self) -> bool {
    matches!(self, Self::Durable)
  }
}

#[derive(Debug, Clone)]
struct RegexInterest {
  compiled: Regex,
  durable: bool,
}

#[derive(Debug, Clone, Default)]
struct RegionInterests {
  /// Key -> durable
  keys: BTreeMap<String, bool>,
  /// Source expression -> compiled matcher
  regexes: BTreeMap<String, RegexInterest>,
}

impl RegionInterests {
  fn is_empty(&self) -> bool {
    self.keys.is_empty() && self.regexes.is_empty()
  }

  fn entries(&self, region: &str) -> Vec<InterestEntry> {
    let mut out = Vec::new();
    for durable in [true, false] {
      let keys: BTreeSet<String> = self
        .keys
        .iter()
        .filter(|(_, d)| **d == durable)
        .map(|(k, _)| k.clone())
        .collect();
      if !keys.is_empty() {
        out.push(InterestEntry::new(
          region,
          InterestPattern::Keys(keys),
          durable,
        ));
      }
    }
    for (expr, interest) in &self.regexes {
      out.push(InterestEntry::new(
        region,
        InterestPattern::Regex(expr.clone()),
        interest.durable,
      ));
    }
    out
  }

  /// Whether every key or the regex of `entry` is held with its durability
  fn covers(&self, entry: &InterestEntry) -> bool {
    match &entry.pattern {
      InterestPattern::Keys(keys) => keys
        .iter()
        .all(|k| self.keys.get(k) == Some(&entry.durable)),
      InterestPattern::Regex(expr) => self
        .regexes
        .get(expr)
        .map(|interest| interest.durable == entry.durable)
        .unwrap_or(false),
    }
  }

  /// A durable match anywhere wins over non-durable ones
  fn classify(&self, key: &str) -> Option<KeyInterest> {
    let mut found = None;
    if let Some(durable) = self.keys.get(key) {
      if *durable {
        return Some(KeyInterest::Durable);
      }
      found = Some(KeyInterest::NonDurable);
    }
    for interest in self.regexes.values() {
      if interest.compiled.is_match(key) {
        if interest.durable {
          return Some(KeyInterest::Durable);
        }
        found = Some(KeyInterest::NonDurable);
      }
    }
    found
  }
}

/// Immutable view of the registry at one version.
///
/// Replay and event classification work from a snapshot so that writers never
/// block them and a replay always sends one consistent interest set.
#[derive(Debug, Clone, Default)]
pub struct InterestSnapshot {
  version: u64,
  regions: BTreeMap<String, RegionInterests>,
}

impl InterestSnapshot {
  pub fn version(&self) -> u64 {
    self.version
  }

  pub fn is_empty(&self) -> bool {
    self.regions.is_empty()
  }

  pub fn regions(&self) -> Vec<String> {
    self.regions.keys().cloned().collect()
  }

  /// Every registration, in the order a replay sends them.
  pub fn entries(&self) -> Vec<InterestEntry> {
    self
      .regions
      .iter()
      .flat_map(|(region, interests)| interests.entries(region))
      .collect()
  }

  pub fn entries_for(&self, region: &str) -> Vec<InterestEntry> {
    self
      .regions
      .get(region)
      .map(|interests| interests.entries(region))
      .unwrap_or_default()
  }

  pub fn classify(&self, region: &str, key: &str) -> Option<KeyInterest> {
    self.regions.get(region)?.classify(key)
  }

  fn covers(&self, entry: &InterestEntry) -> bool {
    self
      .regions
      .get(&entry.region)
      .map(|interests| interests.covers(entry))
      .unwrap_or(false)
  }
}

/// Local record of what the client has subscribed to.
///
/// Writes are serialized and publish a new snapshot; reads clone the current
/// snapshot pointer and never wait on a writer.
///
/// Registrations the server has not acknowledged yet stay pending until an
/// Ack or a replay confirms them.
pub struct InterestRegistry {
  current: RwLock<Arc<InterestSnapshot>>,
  writer: Mutex<()>,
  pending: Mutex<Vec<InterestEntry>>,
}

impl InterestRegistry {
  pub fn new() -> Self {
    Self {
      current: RwLock::new(Arc::new(InterestSnapshot::default())),
      writer: Mutex::new(()),
      pending: Mutex::new(Vec::new()),
    }
  }

  pub fn snapshot(&self) -> Arc<InterestSnapshot> {
    self.current.read().clone()
  }

  /// Add or update an interest. Returns false when the registry already held
  /// exactly this registration. A changed entry is pending until confirmed.
  pub fn register(&self, entry: &InterestEntry) -> Result<bool, DurableError> {
    let compiled = validate(entry)?;
    let changed = self.update(|snapshot| {
      let region = snapshot.regions.entry(entry.region.clone()).or_default();
      match (&entry.pattern, compiled) {
        (InterestPattern::Keys(keys), _) => {
          let mut changed = false;
          for key in keys {
            if region.keys.insert(key.clone(), entry.durable) != Some(entry.durable) {
              changed = true;
            }
          }
          changed
        }
        (InterestPattern::Regex(expr), Some(compiled)) => {
          let unchanged = region
            .regexes
            .get(expr)
            .map(|existing| existing.durable == entry.durable)
            .unwrap_or(false);
          if !unchanged {
            region.regexes.insert(
              expr.clone(),
              RegexInterest {
                compiled,
                durable: entry.durable,
              },
            );
          }
          !unchanged
        }
        (InterestPattern::Regex(_), None) => false,
      }
    });
    if changed {
      let mut pending = self.pending.lock();
      if !pending.contains(entry) {
        pending.push(entry.clone());
      }
      tracing::debug!(
        region = %entry.region,
        pattern = %entry.pattern.describe(),
        durable = entry.durable,
        "Interest registered"
      );
    }
    Ok(changed)
  }

  /// Whether `entry` was registered locally but never acknowledged.
  pub fn is_pending(&self, entry: &InterestEntry) -> bool {
    self.pending.lock().contains(entry)
  }

  /// The server acknowledged `entry`.
  pub fn confirm(&self, entry: &InterestEntry) {
    self.pending.lock().retain(|pending| pending != entry);
  }

  /// A replay of `snapshot` finished. Pending entries it carried are
  /// confirmed unless one of the `rejected` registrations overlaps them.
  pub fn confirm_replayed(&self, snapshot: &InterestSnapshot, rejected: &[InterestEntry]) {
    self.pending.lock().retain(|pending| {
      !snapshot.covers(pending) || rejected.iter().any(|r| overlaps(r, pending))
    });
  }

  pub fn pending_count(&self) -> usize {
    self.pending.lock().len()
  }

  /// Remove an interest. Listed keys are removed whatever their durability.
  pub fn unregister(&self, region: &str, pattern: &InterestPattern) -> bool {
    let changed = self.update(|snapshot| {
      let Some(interests) = snapshot.regions.get_mut(region) else {
        return false;
      };
      let changed = match pattern {
        InterestPattern::Keys(keys) => {
          let before = interests.keys.len();
          interests.keys.retain(|k, _| !keys.contains(k));
          interests.keys.len() != before
        }
        InterestPattern::Regex(expr) => interests.regexes.remove(expr).is_some(),
      };
      if interests.is_empty() {
        snapshot.regions.remove(region);
      }
      changed
    });
    self.pending.lock().retain_mut(|entry| {
      if entry.region != region {
        return true;
      }
      match (&mut entry.pattern, pattern) {
        (InterestPattern::Keys(pending), InterestPattern::Keys(removed)) => {
          pending.retain(|k| !removed.contains(k));
          !pending.is_empty()
        }
        (InterestPattern::Regex(pending), InterestPattern::Regex(removed)) => *pending != *removed,
        _ => true,
      }
    });
    if changed {
      tracing::debug!(region = %region, pattern = %pattern.describe(), "Interest unregistered");
    }
    changed
  }

  /// Drop every interest in a destroyed region, returning what was removed.
  pub fn remove_region(&self, region: &str) -> Vec<InterestEntry> {
    let mut removed = Vec::new();
    self.update(|snapshot| match snapshot.regions.remove(region) {
      Some(interests) => {
        removed = interests.entries(region);
        true
      }
      None => false,
    });
    self.pending.lock().retain(|entry| entry.region != region);
    removed
  }

  pub fn list(&self, region: &str) -> Vec<InterestEntry> {
    self.snapshot().entries_for(region)
  }

  fn update<F>(&self, apply: F) -> bool
  where
    F: FnOnce(&mut InterestSnapshot) -> bool,
  {
    let _writer = self.writer.lock();
    let mut next = (**self.current.read()).clone();
    if !apply(&mut next) {
      return false;
    }
    next.version += 1;
    *self.current.write() = Arc::new(next);
    true
  }
}

impl Default for InterestRegistry {
  fn default() -> Self {
    Self::new()
  }
}

fn overlaps(a: &InterestEntry, b: &InterestEntry) -> bool {
  if a.region != b.region {
    return false;
  }
  match (&a.pattern, &b.pattern) {
    (InterestPattern::Keys(a), InterestPattern::Keys(b)) => !a.is_disjoint(b),
    (InterestPattern::Regex(a), InterestPattern::Regex(b)) => a == b,
    _ => false,
  }
}

/// Check an entry and compile its regex. Regexes match whole keys.
fn validate(entry: &InterestEntry) -> Result<Option<Regex>, DurableError> {
  let invalid = |reason: &str| DurableError::InvalidPattern {
    pattern: entry.pattern.describe(),
    reason: reason.to_string(),
  };
  if entry.region.trim().is_empty() {
    return Err(invalid("region name must not be empty"));
  }
  match &entry.pattern {
    InterestPattern::Keys(keys) => {
      if keys.is_empty() {
        return Err(invalid("key list must not be empty"));
      }
      if keys.iter().any(|k| k.is_empty()) {
        return Err(invalid("keys must not be empty strings"));
      }
      Ok(None)
    }
    InterestPattern::Regex(expr) => {
      if expr.is_empty() {
        return Err(invalid("regex must not be empty"));
      }
      Regex::new(&format!("^(?:{})$", expr))
        .map(Some)
        .map_err(|e| invalid(&e.to_string()))
    }
  }
}

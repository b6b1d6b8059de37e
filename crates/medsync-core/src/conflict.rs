//! # Conflict Detection and Merge
//!
//! Pure comparison logic between a queued local write and the remote
//! document it targets. Applying a resolution (remote writes, cache updates)
//! lives in the sync crate; this module only decides.
//!
//! ## Detection Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Conflict Detection                                   │
//! │                                                                         │
//! │  SyncOperation (created_at = T0)        Remote document                 │
//! │  payload { strength: 10 }               { strength: 20, updatedAt: T1 } │
//! │         │                                          │                    │
//! │         └───────────────┬──────────────────────────┘                    │
//! │                         ▼                                               │
//! │  1. mode == disabled or action == delete?  ──► no conflict             │
//! │  2. timestamp_and_fields: T1 > T0 + skew?   ──► else no conflict       │
//! │  3. fields present in BOTH maps that differ (minus ignored fields)     │
//! │         │                                                               │
//! │         ├── none  ──► write proceeds                                   │
//! │         └── {strength} ──► ConflictData                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::types::{FieldMap, SyncAction, SyncOperation};
use crate::{CREATED_AT_FIELD, OFFLINE_TIMESTAMP_FIELD, OFFLINE_VERSION_FIELD, UPDATED_AT_FIELD};

// =============================================================================
// Conflict Records
// =============================================================================

/// Comparison snapshot of a detected conflict.
///
/// `conflicting_fields` is never empty: a comparison with no differing field
/// is not a conflict and produces no `ConflictData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub conflicting_fields: BTreeSet<String>,
    pub local_data: FieldMap,
    pub remote_data: FieldMap,
    pub local_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub remote_timestamp: Option<DateTime<Utc>>,
}

/// A detected conflict awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionItem {
    pub id: String,
    pub operation: SyncOperation,
    pub conflict_data: ConflictData,
    pub detected_at: DateTime<Utc>,
}

impl ConflictResolutionItem {
    pub fn new(operation: SyncOperation, conflict_data: ConflictData, detected_at: DateTime<Utc>) -> Self {
        ConflictResolutionItem {
            id: Uuid::new_v4().to_string(),
            operation,
            conflict_data,
            detected_at,
        }
    }
}

// =============================================================================
// Resolution Strategies
// =============================================================================

/// Which side wins a field during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPreference {
    #[default]
    Local,
    Remote,
}

/// Per-field merge rules. Unlisted fields prefer the local value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRules(BTreeMap<String, FieldPreference>);

impl MergeRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the remote value for `field`.
    pub fn prefer_remote(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldPreference::Remote);
        self
    }

    /// Keeps the local value for `field` (the default).
    pub fn prefer_local(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldPreference::Local);
        self
    }

    pub fn preference(&self, field: &str) -> FieldPreference {
        self.0.get(field).copied().unwrap_or_default()
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "data", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Write the local payload to remote, overwriting the conflicting fields.
    UseLocal,
    /// Drop the local write and adopt the remote document.
    UseRemote,
    /// Field-by-field merge, local wins unless a rule says otherwise.
    Merge(MergeRules),
    /// Caller-supplied replacement payload, applied like `UseLocal`.
    UseCustom(FieldMap),
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::UseLocal => write!(f, "use_local"),
            ResolutionStrategy::UseRemote => write!(f, "use_remote"),
            ResolutionStrategy::Merge(_) => write!(f, "merge"),
            ResolutionStrategy::UseCustom(_) => write!(f, "use_custom"),
        }
    }
}

// =============================================================================
// Detection Policy
// =============================================================================

/// Which evidence raises a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Remote `updatedAt` newer than the operation AND a shared field differs.
    #[default]
    TimestampAndFields,
    /// Any shared field differs, regardless of timestamps.
    FieldsOnly,
    /// Never raise conflicts; last writer wins.
    Disabled,
}

impl std::str::FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timestamp_and_fields" | "timestamp" => Ok(DetectionMode::TimestampAndFields),
            "fields_only" | "fields" => Ok(DetectionMode::FieldsOnly),
            "disabled" | "off" => Ok(DetectionMode::Disabled),
            other => Err(format!(
                "Unknown conflict mode: '{}'. Valid options: timestamp_and_fields, fields_only, disabled",
                other
            )),
        }
    }
}

fn default_ignored_fields() -> Vec<String> {
    vec![
        UPDATED_AT_FIELD.to_string(),
        CREATED_AT_FIELD.to_string(),
        OFFLINE_TIMESTAMP_FIELD.to_string(),
        OFFLINE_VERSION_FIELD.to_string(),
    ]
}

/// Configurable conflict detection.
///
/// ## Tuning
/// - `clock_skew_tolerance_ms`: remote must be newer than the operation by
///   more than this to count (guards against device clock drift).
/// - `numeric_tolerance`: numbers closer than this compare equal (guards
///   against float rounding by the remote store).
/// - `ignored_fields`: bookkeeping fields never compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    #[serde(default)]
    pub mode: DetectionMode,

    #[serde(default)]
    pub clock_skew_tolerance_ms: i64,

    #[serde(default = "default_ignored_fields")]
    pub ignored_fields: Vec<String>,

    #[serde(default)]
    pub numeric_tolerance: f64,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy {
            mode: DetectionMode::default(),
            clock_skew_tolerance_ms: 0,
            ignored_fields: default_ignored_fields(),
            numeric_tolerance: 0.0,
        }
    }
}

impl ConflictPolicy {
    /// Compares an operation against the current remote document.
    ///
    /// Returns `Ok(None)` when the write may proceed.
    pub fn detect(&self, op: &SyncOperation, remote: &FieldMap) -> CoreResult<Option<ConflictData>> {
        if self.mode == DetectionMode::Disabled || op.action == SyncAction::Delete {
            return Ok(None);
        }

        let remote_timestamp = remote_updated_at(remote);

        if self.mode == DetectionMode::TimestampAndFields {
            let threshold = op.created_at + Duration::milliseconds(self.clock_skew_tolerance_ms);
            match remote_timestamp {
                Some(remote_ts) if remote_ts > threshold => {}
                _ => return Ok(None),
            }
        }

        let local = op.payload.to_fields()?;
        let conflicting_fields = self.differing_fields(&local, remote);
        if conflicting_fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(ConflictData {
            conflicting_fields,
            local_data: local,
            remote_data: remote.clone(),
            local_timestamp: op.created_at,
            remote_timestamp,
        }))
    }

    /// Names of fields present in both maps whose values differ.
    pub fn differing_fields(&self, local: &FieldMap, remote: &FieldMap) -> BTreeSet<String> {
        local
            .iter()
            .filter(|(name, _)| !self.ignored_fields.iter().any(|f| f == *name))
            .filter_map(|(name, local_value)| {
                let remote_value = remote.get(name)?;
                if values_equal(local_value, remote_value, self.numeric_tolerance) {
                    None
                } else {
                    Some(name.clone())
                }
            })
            .collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Compares two JSON values, treating numbers numerically.
///
/// `10` and `10.0` are equal; numbers within `tolerance` are equal. Arrays and
/// objects are compared element by element with the same rules.
pub fn values_equal(a: &serde_json::Value, b: &serde_json::Value, tolerance: f64) -> bool {
    use serde_json::Value;

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y, tolerance))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y, tolerance)))
        }
        _ => a == b,
    }
}

/// Reads the remote `updatedAt` stamp.
///
/// Accepts an RFC 3339 string, epoch milliseconds, or a
/// `{ "seconds": .., "nanoseconds": .. }` timestamp object.
pub fn remote_updated_at(fields: &FieldMap) -> Option<DateTime<Utc>> {
    parse_timestamp(fields.get(UPDATED_AT_FIELD)?)
}

pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    use serde_json::Value;

    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos as u32).single()
        }
        _ => None,
    }
}

/// Merges local fields over the remote document.
///
/// Every local field wins unless `rules` prefers the remote value and the
/// remote document has that field. The result's `updatedAt` is stamped with
/// `resolved_at`.
pub fn merge_fields(
    local: &FieldMap,
    remote: &FieldMap,
    rules: &MergeRules,
    resolved_at: DateTime<Utc>,
) -> FieldMap {
    let mut merged = remote.clone();

    for (name, local_value) in local {
        let keep_remote =
            rules.preference(name) == FieldPreference::Remote && remote.contains_key(name);
        if !keep_remote {
            merged.insert(name.clone(), local_value.clone());
        }
    }

    merged.insert(
        UPDATED_AT_FIELD.to_string(),
        serde_json::Value::String(resolved_at.to_rfc3339()),
    );
    merged
}

// =============================================================================
// Unit Tests
// =============================================================================

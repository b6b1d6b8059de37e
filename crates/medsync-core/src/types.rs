//! # Domain Types
//!
//! Core types shared by the queue, the cache and the conflict resolver.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Domain Types                               │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  SyncOperation  │   │  EntityPayload  │   │   EntityKind    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │──►│  Medication     │   │  Medication     │       │
//! │  │  action         │   │  Dose           │   │  Dose           │       │
//! │  │  entity_id      │   │  Schedule       │   │  Schedule       │       │
//! │  │  created_at     │   │  Generic        │   │  Custom(name)   │       │
//! │  │  retry_count    │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Payload Boundary
//! Payloads are typed per entity kind. They flatten into a [`FieldMap`]
//! (`camelCase` keys, absent optionals omitted) when written to the remote
//! store or compared during conflict detection. The `Generic` variant is the
//! fallback for collections this crate has no typed schema for.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Field name → value mapping, the shape of every remote document.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// Identifier of the signed-in user.
pub type UserId = String;

// =============================================================================
// Entity Kind
// =============================================================================

/// Logical collection an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EntityKind {
    Medication,
    Dose,
    Schedule,
    /// Any other collection, stored under its own name.
    Custom(String),
}

impl EntityKind {
    /// Returns the tag used in persisted operations ("medication", "dose", ...).
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Medication => "medication",
            EntityKind::Dose => "dose",
            EntityKind::Schedule => "schedule",
            EntityKind::Custom(name) => name,
        }
    }

    /// Returns the top-level remote collection for this kind.
    ///
    /// ```rust
    /// use medsync_core::EntityKind;
    ///
    /// assert_eq!(EntityKind::Medication.collection(), "medications");
    /// assert_eq!(EntityKind::Custom("refills".into()).collection(), "refills");
    /// ```
    pub fn collection(&self) -> String {
        match self {
            EntityKind::Medication => "medications".to_string(),
            EntityKind::Dose => "doses".to_string(),
            EntityKind::Schedule => "schedules".to_string(),
            EntityKind::Custom(name) => name.clone(),
        }
    }
}

impl From<String> for EntityKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "medication" | "medications" => EntityKind::Medication,
            "dose" | "doses" => EntityKind::Dose,
            "schedule" | "schedules" => EntityKind::Schedule,
            _ => EntityKind::Custom(value),
        }
    }
}

impl From<&str> for EntityKind {
    fn from(value: &str) -> Self {
        EntityKind::from(value.to_string())
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Sync Action
// =============================================================================

/// The mutation a queued operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Create => write!(f, "create"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

// =============================================================================
// Document Path
// =============================================================================

/// Location of a document in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: String,
    pub document_id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        DocumentPath {
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.document_id)
    }
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// Fields of a medication record. Every field is optional so the same type
/// describes both full creates and partial updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescriber: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

/// Outcome recorded for a single dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseStatus {
    #[default]
    Scheduled,
    Taken,
    Skipped,
    Missed,
}

/// Fields of a dose record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medication_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DoseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Fields of a dosing schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medication_id: Option<String>,
    /// Local times of day, "HH:MM".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<Vec<String>>,
    /// ISO weekday numbers (1 = Monday).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Payload of a queued operation, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityPayload {
    Medication(MedicationFields),
    Dose(DoseFields),
    Schedule(ScheduleFields),
    /// Untyped fallback for collections without a schema.
    Generic { collection: String, fields: FieldMap },
}

impl EntityPayload {
    /// Returns an empty payload for the given kind (used by deletes).
    pub fn empty(kind: &EntityKind) -> Self {
        match kind {
            EntityKind::Medication => EntityPayload::Medication(MedicationFields::default()),
            EntityKind::Dose => EntityPayload::Dose(DoseFields::default()),
            EntityKind::Schedule => EntityPayload::Schedule(ScheduleFields::default()),
            EntityKind::Custom(name) => EntityPayload::Generic {
                collection: name.clone(),
                fields: FieldMap::new(),
            },
        }
    }

    /// Returns the entity kind this payload belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Medication(_) => EntityKind::Medication,
            EntityPayload::Dose(_) => EntityKind::Dose,
            EntityPayload::Schedule(_) => EntityKind::Schedule,
            EntityPayload::Generic { collection, .. } => EntityKind::from(collection.clone()),
        }
    }

    /// Flattens the payload into a field map.
    pub fn to_fields(&self) -> CoreResult<FieldMap> {
        let value = match self {
            EntityPayload::Medication(fields) => serde_json::to_value(fields)?,
            EntityPayload::Dose(fields) => serde_json::to_value(fields)?,
            EntityPayload::Schedule(fields) => serde_json::to_value(fields)?,
            EntityPayload::Generic { fields, .. } => return Ok(fields.clone()),
        };

        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(CoreError::Serialization(format!(
                "payload did not flatten to an object: {other}"
            ))),
        }
    }

    /// Builds a typed payload from a field map.
    ///
    /// Unknown fields are dropped for typed kinds; custom kinds keep every
    /// field.
    pub fn from_fields(kind: &EntityKind, fields: FieldMap) -> CoreResult<Self> {
        let value = serde_json::Value::Object(fields);
        let payload = match kind {
            EntityKind::Medication => EntityPayload::Medication(serde_json::from_value(value)?),
            EntityKind::Dose => EntityPayload::Dose(serde_json::from_value(value)?),
            EntityKind::Schedule => EntityPayload::Schedule(serde_json::from_value(value)?),
            EntityKind::Custom(name) => EntityPayload::Generic {
                collection: name.clone(),
                fields: match value {
                    serde_json::Value::Object(map) => map,
                    _ => FieldMap::new(),
                },
            },
        };
        Ok(payload)
    }

    /// Returns true when the payload carries no fields at all.
    pub fn is_empty(&self) -> bool {
        self.to_fields().map(|f| f.is_empty()).unwrap_or(true)
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// One pending local mutation awaiting remote confirmation.
///
/// ## Lifecycle
/// ```text
/// write request ──► Pending ──► InFlight ──┬──► Committed        (removed)
///                      ▲                   ├──► Conflicted       (moved)
///                      │                   ├──► TerminalFailure  (removed)
///                      └── retry_count+1 ◄─┴──► RetryableFailure
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub entity_kind: EntityKind,
    pub action: SyncAction,
    pub entity_id: String,
    pub payload: EntityPayload,
    #[serde(default)]
    pub metadata: FieldMap,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Earliest time the next attempt may run. `None` means due now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Creates a new pending operation.
    pub fn new(
        action: SyncAction,
        entity_id: impl Into<String>,
        payload: EntityPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        SyncOperation {
            id: Uuid::new_v4().to_string(),
            entity_kind: payload.kind(),
            action,
            entity_id: entity_id.into(),
            payload,
            metadata: FieldMap::new(),
            created_at,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn create(entity_id: impl Into<String>, payload: EntityPayload, now: DateTime<Utc>) -> Self {
        Self::new(SyncAction::Create, entity_id, payload, now)
    }

    pub fn update(entity_id: impl Into<String>, payload: EntityPayload, now: DateTime<Utc>) -> Self {
        Self::new(SyncAction::Update, entity_id, payload, now)
    }

    pub fn delete(kind: &EntityKind, entity_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(SyncAction::Delete, entity_id, EntityPayload::empty(kind), now)
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the remote document this operation writes to.
    pub fn document_path(&self) -> DocumentPath {
        DocumentPath::new(self.entity_kind.collection(), self.entity_id.clone())
    }

    /// Returns true if the operation's backoff window has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Records a transient failure and schedules the next attempt.
    pub fn record_failure(&mut self, error: impl Into<String>, next_attempt_at: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
    }

    /// Returns true once the operation may not be retried again.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

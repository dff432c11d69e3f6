use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(EntityId);

impl EntityId {
    /// Fresh client-side id for an optimistic entry.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Per-dispatch key, forwarded to the server as `Idempotency-Key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentId(pub Uuid);

impl IntentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Macro-state of a session.
///
/// Phases move along the graph encoded in [`Phase::can_transition_to`].
/// Apart from a declined proposal, the only way back is a local reset to
/// [`Phase::Created`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Created,
    Active { step: u32 },
    Confirming,
    Committing,
    Completed,
    Failed,
}

impl Phase {
    pub const FIRST_STEP: Phase = Phase::Active { step: 1 };

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Whether a server-driven move from `self` to `next` is legal.
    ///
    /// Reset to `Created` is not covered here; it is a local operation that
    /// bypasses the graph.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (Phase::Created, Phase::Active { .. }) => true,
            (Phase::Active { .. }, Phase::Active { .. }) => true,
            (Phase::Active { .. }, Phase::Confirming) => true,
            // A declined proposal sends the wizard back to gathering info.
            (Phase::Confirming, Phase::Active { .. }) => true,
            (Phase::Confirming, Phase::Committing) => true,
            (Phase::Committing, Phase::Completed) => true,
            (current, Phase::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Created => f.write_str("created"),
            Phase::Active { step } => write!(f, "active (step {step})"),
            Phase::Confirming => f.write_str("confirming"),
            Phase::Committing => f.write_str("committing"),
            Phase::Completed => f.write_str("completed"),
            Phase::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    LocalPending,
    ServerConfirmed,
    /// Client-side notice that never reaches the server.
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Instructor,
    Course,
    Student,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Instructor => "instructor",
            RecordKind::Course => "course",
            RecordKind::Student => "student",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instructor" | "instructors" => Ok(RecordKind::Instructor),
            "course" | "courses" => Ok(RecordKind::Course),
            "student" | "students" => Ok(RecordKind::Student),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    #[serde(alias = "recordCount")]
    pub record_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationProgress {
    pub stage: String,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CreationProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.completed.min(self.total) * 100) / self.total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    /// One conversational round-trip.
    Exchange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<String>,
    },
    FileUpload {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<FileResult>,
    },
    ScheduleProposal {
        proposal: Value,
    },
    Progress {
        progress: CreationProgress,
    },
    Record {
        record: RecordKind,
        fields: Map<String, Value>,
    },
    Notice {
        message: String,
    },
}

impl EntityPayload {
    pub fn prompt(text: impl Into<String>) -> Self {
        EntityPayload::Exchange {
            prompt: Some(text.into()),
            reply: None,
            actions: Vec::new(),
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, EntityPayload::Record { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub payload: EntityPayload,
    pub origin: EntityOrigin,
    /// Last payload the server confirmed, held while a local edit of a
    /// server record is unsaved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<EntityPayload>,
}

impl Entity {
    pub fn pending(payload: EntityPayload) -> Self {
        Self {
            id: EntityId::generate(),
            payload,
            origin: EntityOrigin::LocalPending,
            confirmed: None,
        }
    }

    pub fn confirmed(id: EntityId, payload: EntityPayload) -> Self {
        Self {
            id,
            payload,
            origin: EntityOrigin::ServerConfirmed,
            confirmed: None,
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            id: EntityId::generate(),
            payload: EntityPayload::Notice {
                message: message.into(),
            },
            origin: EntityOrigin::Synthetic,
            confirmed: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == EntityOrigin::LocalPending
    }

    /// Whether the server holds a copy under this entity's id, even if the
    /// local copy has unsaved edits.
    pub fn is_server_known(&self) -> bool {
        self.origin == EntityOrigin::ServerConfirmed || self.confirmed.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Server,
    Timeout,
    /// The backend itself reported the session as failed.
    ServerReported,
    /// The backend answered with something the client cannot apply.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Client-side mirror of a server-tracked multi-step session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Option<SessionId>,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome: Option<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Confirmed records deleted locally and not yet saved.
    #[serde(default)]
    pub removed: Vec<EntityId>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Session {
    pub fn has_unsaved_changes(&self) -> bool {
        !self.removed.is_empty() || self.entities.iter().any(Entity::is_pending)
    }

    pub fn pending_records(&self) -> impl Iterator<Item = &Entity> {
        self.entities
            .iter()
            .filter(|entity| entity.is_pending() && entity.payload.is_record())
    }
}

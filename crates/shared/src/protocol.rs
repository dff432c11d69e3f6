use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{CreationProgress, EntityId, FileResult, Phase, RecordKind, SessionId};

pub const SESSION_ID_HEADER: &str = "X-Session-ID";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// The seven states the builder backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderState {
    Initial,
    GatheringInfo,
    ProcessingFiles,
    Confirming,
    Creating,
    Completed,
    Failed,
}

impl BuilderState {
    pub fn phase(self) -> Phase {
        match self {
            BuilderState::Initial | BuilderState::GatheringInfo => Phase::FIRST_STEP,
            BuilderState::ProcessingFiles => Phase::Active { step: 2 },
            BuilderState::Confirming => Phase::Confirming,
            BuilderState::Creating => Phase::Committing,
            BuilderState::Completed => Phase::Completed,
            BuilderState::Failed => Phase::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub state: BuilderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Message,
    Confirm,
    Decline,
    Save,
    /// Progress poll while the backend is creating the project.
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub client_id: EntityId,
    pub record: RecordKind,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub session_id: SessionId,
    pub message: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordPayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub client_id: EntityId,
    pub id: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub state: BuilderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_proposal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_progress: Option<CreationProgress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub saved_records: Vec<SavedRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_records: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_result: Option<FileResult>,
    pub state: BuilderState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

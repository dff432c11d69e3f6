use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{EntityId, EntityPayload, FileResult, IntentId, Phase, SessionId},
    protocol::{
        ActionKind, MessageRequest, MessageResponse, RecordPayload, SavedRecord, SessionInfo,
        StartRequest, StartResponse, UploadResponse,
    },
};

use crate::error::TransportError;

/// Fixed ids for entities the server keeps replacing rather than appending.
pub const SCHEDULE_PROPOSAL_ENTITY: &str = "schedule-proposal";
pub const CREATION_PROGRESS_ENTITY: &str = "creation-progress";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartConfig {
    Role(String),
    Organization(String),
}

impl StartConfig {
    pub fn request(&self) -> StartRequest {
        match self {
            StartConfig::Role(role) => StartRequest {
                role: Some(role.clone()),
                organization_id: None,
            },
            StartConfig::Organization(id) => StartRequest {
                role: None,
                organization_id: Some(id.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub welcome: Option<String>,
    pub phase: Phase,
}

impl From<StartResponse> for SessionHandle {
    fn from(response: StartResponse) -> Self {
        Self {
            session_id: response.session_id,
            welcome: response.message.filter(|message| !message.is_empty()),
            phase: response.state.phase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Message(String),
    Confirm,
    Decline,
    Save {
        records: Vec<RecordPayload>,
        removed: Vec<EntityId>,
    },
    Refresh,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Message(_) => ActionKind::Message,
            Action::Confirm => ActionKind::Confirm,
            Action::Decline => ActionKind::Decline,
            Action::Save { .. } => ActionKind::Save,
            Action::Refresh => ActionKind::Refresh,
        }
    }

    pub fn to_request(&self, session_id: &SessionId) -> MessageRequest {
        let (message, records, removed) = match self {
            Action::Message(text) => (text.clone(), Vec::new(), Vec::new()),
            Action::Confirm => ("confirm".to_string(), Vec::new(), Vec::new()),
            Action::Decline => ("decline".to_string(), Vec::new(), Vec::new()),
            Action::Save { records, removed } => {
                ("save".to_string(), records.clone(), removed.clone())
            }
            Action::Refresh => ("refresh".to_string(), Vec::new(), Vec::new()),
        };
        MessageRequest {
            session_id: session_id.clone(),
            message,
            action: self.kind(),
            records,
            removed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: String,
    pub content: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("'{}' has no file name", path.display()))?;
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        Ok(Self { filename, content })
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub fn mime_type(&self) -> String {
        mime_guess::from_path(&self.filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpsert {
    pub id: EntityId,
    pub payload: EntityPayload,
}

/// Changes a server response asks the client to apply to its mirror.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerDelta {
    pub phase: Option<Phase>,
    pub reply: Option<String>,
    pub actions: Vec<String>,
    /// Server id for the item the request acknowledged, if it issued one.
    pub ack_id: Option<EntityId>,
    pub file_result: Option<FileResult>,
    pub upserts: Vec<EntityUpsert>,
    pub saved: Vec<SavedRecord>,
    pub rejected: Vec<EntityId>,
}

impl From<MessageResponse> for ServerDelta {
    fn from(response: MessageResponse) -> Self {
        let mut upserts = Vec::new();
        if let Some(proposal) = response.schedule_proposal {
            upserts.push(EntityUpsert {
                id: EntityId::from(SCHEDULE_PROPOSAL_ENTITY),
                payload: EntityPayload::ScheduleProposal { proposal },
            });
        }
        if let Some(progress) = response.creation_progress {
            upserts.push(EntityUpsert {
                id: EntityId::from(CREATION_PROGRESS_ENTITY),
                payload: EntityPayload::Progress { progress },
            });
        }
        Self {
            phase: Some(response.state.phase()),
            reply: response.message,
            actions: response.actions,
            ack_id: response.message_id,
            file_result: None,
            upserts,
            saved: response.saved_records,
            rejected: response.rejected_records,
        }
    }
}

impl From<UploadResponse> for ServerDelta {
    fn from(response: UploadResponse) -> Self {
        Self {
            phase: Some(response.state.phase()),
            reply: response.message,
            ack_id: response.upload_id,
            file_result: response.file_result,
            ..Self::default()
        }
    }
}

/// Outbound calls to the session backend. Every call is attempted exactly
/// once; failures come back as [`TransportError`], never as panics.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn start(
        &self,
        config: &StartConfig,
        intent: IntentId,
    ) -> Result<SessionHandle, TransportError>;

    async fn send_action(
        &self,
        session_id: &SessionId,
        action: &Action,
        intent: IntentId,
    ) -> Result<ServerDelta, TransportError>;

    /// Callers validate the file type first; the gateway does not re-check.
    async fn upload_file(
        &self,
        session_id: &SessionId,
        file: &UploadFile,
        intent: IntentId,
    ) -> Result<ServerDelta, TransportError>;

    async fn end_session(&self, session_id: &SessionId, intent: IntentId)
        -> Result<(), TransportError>;

    async fn session_info(
        &self,
        session_id: &SessionId,
        intent: IntentId,
    ) -> Result<SessionInfo, TransportError>;
}

use shared::domain::{ErrorKind, Phase};
use thiserror::Error;

use crate::controller::IntentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Network,
    Server,
    Timeout,
}

/// Failure of a single gateway call. Never retried by the gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} error: {message}", kind_label(.kind, .status))]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

fn kind_label(kind: &TransportErrorKind, status: &Option<u16>) -> String {
    match (*kind, *status) {
        (TransportErrorKind::Network, _) => "network".to_string(),
        (TransportErrorKind::Timeout, _) => "timeout".to_string(),
        (TransportErrorKind::Server, Some(status)) => format!("server ({status})"),
        (TransportErrorKind::Server, None) => "server".to_string(),
    }
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }

    pub fn server(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Server,
            status,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            status: None,
            message: message.into(),
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            TransportErrorKind::Network => ErrorKind::Network,
            TransportErrorKind::Server => ErrorKind::Server,
            TransportErrorKind::Timeout => ErrorKind::Timeout,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::server(Some(status.as_u16()), err.to_string())
        } else if err.is_decode() {
            Self::server(None, format!("malformed response: {err}"))
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Local precondition failures. These never reach the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("file '{filename}' has an unsupported type (allowed: {allowed})")]
    UnsupportedFileType { filename: String, allowed: String },
    #[error("file '{filename}' is empty")]
    EmptyFile { filename: String },
    #[error("file '{filename}' is {size} bytes, the limit is {limit} bytes")]
    FileTooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },
    #[error("a record needs at least one field")]
    EmptyRecord,
    #[error("there is no record at index {index}")]
    NoRecordAt { index: usize },
    #[error("there are no unsaved changes")]
    NothingToSave,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{intent} is not allowed while the session is {phase}")]
    InvalidForPhase { intent: IntentKind, phase: Phase },
    #[error("no session has been started")]
    NoSession,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("another request is still in flight")]
    Busy,
    #[error("request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("server response rejected: {0}")]
    Protocol(String),
    #[error("session changed while the request was in flight")]
    SessionChanged,
    #[error("controller is detached from its view")]
    Detached,
}

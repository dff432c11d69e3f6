//! The only writer of the session store.
//!
//! Every intent runs the same pipeline: phase guard, local validation, an
//! optional optimistic write, at most one gateway call, then a single
//! publish once the result has been applied. The store lock is never held
//! across a gateway await, so concurrent intents interleave and their
//! responses land in resolution order (last write wins) unless the
//! [`InFlightPolicy::Reject`] policy is configured.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use serde_json::{Map, Value};
use shared::{
    domain::{
        Entity, EntityId, EntityOrigin, EntityPayload, ErrorInfo, ErrorKind, IntentId, Phase,
        RecordKind, Session, SessionId,
    },
    protocol::{RecordPayload, SessionInfo},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{ClientSettings, InFlightPolicy},
    error::{ControllerError, TransportError, ValidationError},
    gateway::{Action, RemoteGateway, ServerDelta, SessionHandle, StartConfig, UploadFile},
    notifier::{Notifier, Subscription},
    store::{EntityPatch, SessionPatch, SessionStore},
    upload::{validate_upload, DEFAULT_MAX_UPLOAD_BYTES},
};

#[derive(Debug, Clone)]
pub enum Intent {
    Start(StartConfig),
    SendMessage(String),
    UploadFile(UploadFile),
    AddRecord {
        record: RecordKind,
        fields: Map<String, Value>,
    },
    /// Merges `fields` into the record; a `null` value deletes the key.
    UpdateRecord {
        index: usize,
        fields: Map<String, Value>,
    },
    RemoveRecord {
        index: usize,
    },
    SaveChanges,
    Confirm,
    Decline,
    /// Polls creation progress while the backend commits the project.
    Refresh,
    EndSession,
    Reset,
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::Start(_) => IntentKind::Start,
            Intent::SendMessage(_) => IntentKind::SendMessage,
            Intent::UploadFile(_) => IntentKind::UploadFile,
            Intent::AddRecord { .. } => IntentKind::AddRecord,
            Intent::UpdateRecord { .. } => IntentKind::UpdateRecord,
            Intent::RemoveRecord { .. } => IntentKind::RemoveRecord,
            Intent::SaveChanges => IntentKind::SaveChanges,
            Intent::Confirm => IntentKind::Confirm,
            Intent::Decline => IntentKind::Decline,
            Intent::Refresh => IntentKind::Refresh,
            Intent::EndSession => IntentKind::EndSession,
            Intent::Reset => IntentKind::Reset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Start,
    SendMessage,
    UploadFile,
    AddRecord,
    UpdateRecord,
    RemoveRecord,
    SaveChanges,
    Confirm,
    Decline,
    Refresh,
    EndSession,
    Reset,
}

impl IntentKind {
    pub const ALL: [IntentKind; 12] = [
        IntentKind::Start,
        IntentKind::SendMessage,
        IntentKind::UploadFile,
        IntentKind::AddRecord,
        IntentKind::UpdateRecord,
        IntentKind::RemoveRecord,
        IntentKind::SaveChanges,
        IntentKind::Confirm,
        IntentKind::Decline,
        IntentKind::Refresh,
        IntentKind::EndSession,
        IntentKind::Reset,
    ];

    pub fn allowed_in(self, phase: Phase) -> bool {
        match self {
            IntentKind::Start => phase == Phase::Created,
            IntentKind::SendMessage => {
                matches!(phase, Phase::Active { .. } | Phase::Confirming)
            }
            IntentKind::UploadFile
            | IntentKind::AddRecord
            | IntentKind::UpdateRecord
            | IntentKind::RemoveRecord
            | IntentKind::SaveChanges => matches!(phase, Phase::Active { .. }),
            IntentKind::Confirm | IntentKind::Decline => phase == Phase::Confirming,
            IntentKind::Refresh => phase == Phase::Committing,
            IntentKind::EndSession => !matches!(phase, Phase::Created | Phase::Committing),
            IntentKind::Reset => true,
        }
    }

    /// Failures of these intents also leave a notice in the transcript.
    fn is_conversational(self) -> bool {
        matches!(
            self,
            IntentKind::Start
                | IntentKind::SendMessage
                | IntentKind::UploadFile
                | IntentKind::SaveChanges
                | IntentKind::Confirm
                | IntentKind::Decline
        )
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentKind::Start => "start",
            IntentKind::SendMessage => "send message",
            IntentKind::UploadFile => "upload file",
            IntentKind::AddRecord => "add record",
            IntentKind::UpdateRecord => "update record",
            IntentKind::RemoveRecord => "remove record",
            IntentKind::SaveChanges => "save changes",
            IntentKind::Confirm => "confirm",
            IntentKind::Decline => "decline",
            IntentKind::Refresh => "refresh",
            IntentKind::EndSession => "end session",
            IntentKind::Reset => "reset",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub in_flight_policy: InFlightPolicy,
    pub max_upload_bytes: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            in_flight_policy: InFlightPolicy::Race,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl From<&ClientSettings> for ControllerOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            in_flight_policy: settings.in_flight_policy,
            max_upload_bytes: settings.max_upload_bytes,
        }
    }
}

struct ControllerState {
    store: SessionStore,
    /// Snapshot most recently handed to listeners as `next`.
    published: Session,
}

/// Context carried from dispatch to settlement of a network intent.
struct Dispatched {
    kind: IntentKind,
    session_id: SessionId,
    pending: Option<EntityId>,
    removed: Vec<EntityId>,
    /// Record payloads as sent by a save, keyed by the id they were sent
    /// under.
    sent: Vec<(EntityId, EntityPayload)>,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Controller {
    gateway: Arc<dyn RemoteGateway>,
    notifier: Notifier,
    options: ControllerOptions,
    state: Mutex<ControllerState>,
    in_flight: AtomicUsize,
    alive: AtomicBool,
}

impl Controller {
    pub fn new(gateway: Arc<dyn RemoteGateway>, notifier: Notifier) -> Arc<Self> {
        Self::with_options(gateway, notifier, ControllerOptions::default())
    }

    pub fn with_options(
        gateway: Arc<dyn RemoteGateway>,
        notifier: Notifier,
        options: ControllerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            notifier,
            options,
            state: Mutex::new(ControllerState {
                store: SessionStore::new(),
                published: Session::default(),
            }),
            in_flight: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        })
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Session, &Session) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.store.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Called when the owning view goes away. Responses that arrive
    /// afterwards are dropped and nothing more is published.
    pub fn detach(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(in_flight = self.in_flight(), "controller: detached");
        }
    }

    /// Replaces the whole session, e.g. with a snapshot loaded at startup.
    ///
    /// Messages and uploads that were still waiting for an answer can never
    /// settle, so they are dropped. Unsaved records are kept.
    pub async fn restore(&self, session: Session) {
        let mut state = self.state.lock().await;
        let mut store = SessionStore::from_session(session);
        let unsent: Vec<EntityId> = store
            .session()
            .entities
            .iter()
            .filter(|entity| entity.is_pending() && !entity.payload.is_record())
            .map(|entity| entity.id.clone())
            .collect();
        for id in &unsent {
            store.rollback(id);
        }
        if !unsent.is_empty() {
            debug!(dropped = unsent.len(), "controller: dropped unanswered entries on restore");
        }
        state.store = store;
        self.publish(&mut state);
    }

    pub async fn dispatch(&self, intent: Intent) -> Result<(), ControllerError> {
        if !self.is_alive() {
            return Err(ControllerError::Detached);
        }
        debug!(intent = %intent.kind(), "controller: dispatch");
        match intent {
            Intent::Start(config) => self.start_session(config).await,
            Intent::SendMessage(text) => self.send_message_impl(text).await,
            Intent::UploadFile(file) => self.upload_file_impl(file).await,
            Intent::AddRecord { record, fields } => self.add_record_impl(record, fields).await,
            Intent::UpdateRecord { index, fields } => {
                self.update_record_impl(index, fields).await
            }
            Intent::RemoveRecord { index } => self.remove_record_impl(index).await,
            Intent::SaveChanges => self.save_changes_impl().await,
            Intent::Confirm => self.respond(IntentKind::Confirm, Action::Confirm).await,
            Intent::Decline => self.respond(IntentKind::Decline, Action::Decline).await,
            Intent::Refresh => self.respond(IntentKind::Refresh, Action::Refresh).await,
            Intent::EndSession => self.end_session_impl().await,
            Intent::Reset => self.reset_impl().await,
        }
    }

    pub async fn start(&self, config: StartConfig) -> Result<(), ControllerError> {
        self.dispatch(Intent::Start(config)).await
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ControllerError> {
        self.dispatch(Intent::SendMessage(text.into())).await
    }

    pub async fn upload_file(&self, file: UploadFile) -> Result<(), ControllerError> {
        self.dispatch(Intent::UploadFile(file)).await
    }

    pub async fn add_record(
        &self,
        record: RecordKind,
        fields: Map<String, Value>,
    ) -> Result<(), ControllerError> {
        self.dispatch(Intent::AddRecord { record, fields }).await
    }

    pub async fn update_record(
        &self,
        index: usize,
        fields: Map<String, Value>,
    ) -> Result<(), ControllerError> {
        self.dispatch(Intent::UpdateRecord { index, fields }).await
    }

    pub async fn remove_record(&self, index: usize) -> Result<(), ControllerError> {
        self.dispatch(Intent::RemoveRecord { index }).await
    }

    pub async fn save_changes(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::SaveChanges).await
    }

    pub async fn confirm(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::Confirm).await
    }

    pub async fn decline(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::Decline).await
    }

    pub async fn refresh(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::Refresh).await
    }

    pub async fn end_session(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::EndSession).await
    }

    pub async fn reset(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::Reset).await
    }

    /// Read-only query; a failure is recorded on the session like any other
    /// gateway failure.
    pub async fn session_info(&self) -> Result<SessionInfo, ControllerError> {
        let session_id = {
            let state = self.state.lock().await;
            require_session_id(state.store.session())?
        };
        let result = self
            .gateway
            .session_info(&session_id, IntentId::generate())
            .await;

        match result {
            Ok(info) => Ok(info),
            Err(err) => {
                let mut state = self.state.lock().await;
                if self.is_alive() && state.store.session().id.as_ref() == Some(&session_id) {
                    state.store.replace(SessionPatch {
                        error: Some(Some(ErrorInfo::new(err.error_kind(), err.to_string()))),
                        ..SessionPatch::default()
                    });
                    self.publish(&mut state);
                }
                Err(err.into())
            }
        }
    }

    fn guard(&self, session: &Session, kind: IntentKind) -> Result<(), ControllerError> {
        if kind.allowed_in(session.phase) {
            return Ok(());
        }
        debug!(
            intent = %kind,
            phase = %session.phase,
            "controller: intent rejected by phase guard"
        );
        Err(ControllerError::InvalidForPhase {
            intent: kind,
            phase: session.phase,
        })
    }

    fn begin_remote(&self) -> Result<InFlight<'_>, ControllerError> {
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            counter: &self.in_flight,
        };
        if previous > 0 && self.options.in_flight_policy == InFlightPolicy::Reject {
            debug!(in_flight = previous, "controller: busy, intent refused");
            return Err(ControllerError::Busy);
        }
        Ok(guard)
    }

    fn publish(&self, state: &mut ControllerState) {
        if !self.is_alive() {
            return;
        }
        let next = state.store.snapshot();
        if next == state.published {
            return;
        }
        let prev = std::mem::replace(&mut state.published, next.clone());
        self.notifier.publish(&next, &prev);
    }

    async fn start_session(&self, config: StartConfig) -> Result<(), ControllerError> {
        let _in_flight = {
            let state = self.state.lock().await;
            self.guard(state.store.session(), IntentKind::Start)?;
            self.begin_remote()?
        };

        let result = self.gateway.start(&config, IntentId::generate()).await;

        let mut state = self.state.lock().await;
        if !self.is_alive() {
            debug!("controller: dropping start result after detach");
            return Err(ControllerError::Detached);
        }
        let outcome = match result {
            Ok(handle) => self.apply_start(&mut state.store, handle),
            Err(err) => {
                if state.store.session().phase != Phase::Created {
                    return Err(ControllerError::SessionChanged);
                }
                record_failure(&mut state.store, IntentKind::Start, None, &err);
                Err(err.into())
            }
        };
        self.publish(&mut state);
        outcome
    }

    fn apply_start(
        &self,
        store: &mut SessionStore,
        handle: SessionHandle,
    ) -> Result<(), ControllerError> {
        let session = store.session();
        if session.id.is_some() || session.phase != Phase::Created {
            warn!(
                session_id = %handle.session_id,
                "controller: start response arrived after another session began; dropped"
            );
            return Err(ControllerError::SessionChanged);
        }
        if !Phase::Created.can_transition_to(handle.phase) {
            let message = format!("server opened the session in phase {}", handle.phase);
            record_protocol_violation(store, IntentKind::Start, None, &message);
            return Err(ControllerError::Protocol(message));
        }

        let error = (handle.phase == Phase::Failed).then(|| {
            ErrorInfo::new(
                ErrorKind::ServerReported,
                "the server could not start the session",
            )
        });
        info!(
            session_id = %handle.session_id,
            phase = %handle.phase,
            "controller: session started"
        );
        store.replace(SessionPatch {
            id: Some(Some(handle.session_id)),
            phase: Some(handle.phase),
            welcome: Some(handle.welcome),
            entities: None,
            error: Some(error),
        });
        Ok(())
    }

    async fn send_message_impl(&self, text: String) -> Result<(), ControllerError> {
        let text = text.trim().to_string();
        let (dispatched, _in_flight) = {
            let mut state = self.state.lock().await;
            let session_id = {
                let session = state.store.session();
                self.guard(session, IntentKind::SendMessage)?;
                require_session_id(session)?
            };
            if text.is_empty() {
                return Err(ValidationError::EmptyMessage.into());
            }
            let in_flight = self.begin_remote()?;
            let entity = Entity::pending(EntityPayload::prompt(text.clone()));
            let pending = entity.id.clone();
            state.store.append_entity(entity);
            (
                Dispatched {
                    kind: IntentKind::SendMessage,
                    session_id,
                    pending: Some(pending),
                    removed: Vec::new(),
                    sent: Vec::new(),
                },
                in_flight,
            )
        };

        let result = self
            .gateway
            .send_action(&dispatched.session_id, &Action::Message(text), IntentId::generate())
            .await;
        self.settle(dispatched, result).await
    }

    async fn upload_file_impl(&self, file: UploadFile) -> Result<(), ControllerError> {
        let (dispatched, _in_flight) = {
            let mut state = self.state.lock().await;
            let session_id = {
                let session = state.store.session();
                self.guard(session, IntentKind::UploadFile)?;
                require_session_id(session)?
            };
            validate_upload(&file, self.options.max_upload_bytes)?;
            let in_flight = self.begin_remote()?;
            let entity = Entity::pending(EntityPayload::FileUpload {
                filename: file.filename.clone(),
                reply: None,
                result: None,
            });
            let pending = entity.id.clone();
            state.store.append_entity(entity);
            (
                Dispatched {
                    kind: IntentKind::UploadFile,
                    session_id,
                    pending: Some(pending),
                    removed: Vec::new(),
                    sent: Vec::new(),
                },
                in_flight,
            )
        };

        let result = self
            .gateway
            .upload_file(&dispatched.session_id, &file, IntentId::generate())
            .await;
        self.settle(dispatched, result).await
    }

    async fn respond(&self, kind: IntentKind, action: Action) -> Result<(), ControllerError> {
        let (dispatched, _in_flight) = {
            let state = self.state.lock().await;
            let session = state.store.session();
            self.guard(session, kind)?;
            let session_id = require_session_id(session)?;
            let in_flight = self.begin_remote()?;
            (
                Dispatched {
                    kind,
                    session_id,
                    pending: None,
                    removed: Vec::new(),
                    sent: Vec::new(),
                },
                in_flight,
            )
        };

        let result = self
            .gateway
            .send_action(&dispatched.session_id, &action, IntentId::generate())
            .await;
        self.settle(dispatched, result).await
    }

    async fn add_record_impl(
        &self,
        record: RecordKind,
        fields: Map<String, Value>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.guard(state.store.session(), IntentKind::AddRecord)?;
        if fields.is_empty() {
            return Err(ValidationError::EmptyRecord.into());
        }
        state
            .store
            .append_entity(Entity::pending(EntityPayload::Record { record, fields }));
        self.publish(&mut state);
        Ok(())
    }

    async fn update_record_impl(
        &self,
        index: usize,
        changes: Map<String, Value>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.guard(state.store.session(), IntentKind::UpdateRecord)?;
        if changes.is_empty() {
            return Err(ValidationError::EmptyRecord.into());
        }
        let Some(entity) = state.store.session().entities.get(index) else {
            warn!(index, "controller: update ignored, no record at index");
            return Err(ValidationError::NoRecordAt { index }.into());
        };
        let EntityPayload::Record { record, fields } = &entity.payload else {
            warn!(index, "controller: update ignored, entry is not a record");
            return Err(ValidationError::NoRecordAt { index }.into());
        };

        // The first edit of a server record keeps the server's copy for rollback.
        let confirmed = (entity.origin == EntityOrigin::ServerConfirmed)
            .then(|| Some(entity.payload.clone()));
        let record = *record;
        let mut fields = fields.clone();
        for (key, value) in changes {
            if value.is_null() {
                fields.remove(&key);
            } else {
                fields.insert(key, value);
            }
        }
        if fields.is_empty() {
            return Err(ValidationError::EmptyRecord.into());
        }

        state.store.update_entity(
            index,
            EntityPatch {
                id: None,
                payload: Some(EntityPayload::Record { record, fields }),
                origin: Some(EntityOrigin::LocalPending),
                confirmed,
            },
        );
        self.publish(&mut state);
        Ok(())
    }

    async fn remove_record_impl(&self, index: usize) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.guard(state.store.session(), IntentKind::RemoveRecord)?;
        let Some(entity) = state
            .store
            .session()
            .entities
            .get(index)
            .filter(|entity| entity.payload.is_record())
        else {
            warn!(index, "controller: remove ignored, no record at index");
            return Err(ValidationError::NoRecordAt { index }.into());
        };

        // Records the server already holds must be deleted on save.
        let server_id = entity.is_server_known().then(|| entity.id.clone());
        state.store.remove_entity(index);
        if let Some(id) = server_id {
            state.store.mark_removed(id);
        }
        self.publish(&mut state);
        Ok(())
    }

    async fn save_changes_impl(&self) -> Result<(), ControllerError> {
        let (dispatched, action, _in_flight) = {
            let state = self.state.lock().await;
            let session = state.store.session();
            self.guard(session, IntentKind::SaveChanges)?;
            let session_id = require_session_id(session)?;

            let records: Vec<RecordPayload> = session
                .pending_records()
                .filter_map(|entity| match &entity.payload {
                    EntityPayload::Record { record, fields } => Some(RecordPayload {
                        client_id: entity.id.clone(),
                        record: *record,
                        fields: fields.clone(),
                    }),
                    _ => None,
                })
                .collect();
            let sent = records
                .iter()
                .map(|r| {
                    let payload = EntityPayload::Record {
                        record: r.record,
                        fields: r.fields.clone(),
                    };
                    (r.client_id.clone(), payload)
                })
                .collect();
            let removed = session.removed.clone();
            if records.is_empty() && removed.is_empty() {
                return Err(ValidationError::NothingToSave.into());
            }

            let in_flight = self.begin_remote()?;
            info!(
                session_id = %session_id,
                records = records.len(),
                removed = removed.len(),
                "controller: saving local changes"
            );
            (
                Dispatched {
                    kind: IntentKind::SaveChanges,
                    session_id,
                    pending: None,
                    removed: removed.clone(),
                    sent,
                },
                Action::Save { records, removed },
                in_flight,
            )
        };

        let result = self
            .gateway
            .send_action(&dispatched.session_id, &action, IntentId::generate())
            .await;
        self.settle(dispatched, result).await
    }

    async fn end_session_impl(&self) -> Result<(), ControllerError> {
        let (session_id, _in_flight) = {
            let state = self.state.lock().await;
            let session = state.store.session();
            self.guard(session, IntentKind::EndSession)?;
            (require_session_id(session)?, self.begin_remote()?)
        };

        let result = self
            .gateway
            .end_session(&session_id, IntentId::generate())
            .await;

        let mut state = self.state.lock().await;
        if !self.is_alive() {
            return Err(ControllerError::Detached);
        }
        if state.store.session().id.as_ref() != Some(&session_id) {
            return Err(ControllerError::SessionChanged);
        }
        let outcome = match result {
            Ok(()) => {
                info!(session_id = %session_id, "controller: session ended");
                state.store.reset();
                Ok(())
            }
            Err(err) => {
                record_failure(&mut state.store, IntentKind::EndSession, None, &err);
                Err(err.into())
            }
        };
        self.publish(&mut state);
        outcome
    }

    async fn reset_impl(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.guard(state.store.session(), IntentKind::Reset)?;
        if let Some(id) = &state.store.session().id {
            info!(session_id = %id, "controller: session reset locally");
        }
        state.store.reset();
        self.publish(&mut state);
        Ok(())
    }

    async fn settle(
        &self,
        dispatched: Dispatched,
        result: Result<ServerDelta, TransportError>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if !self.is_alive() {
            debug!(intent = %dispatched.kind, "controller: dropping result after detach");
            return Err(ControllerError::Detached);
        }
        if state.store.session().id.as_ref() != Some(&dispatched.session_id) {
            debug!(
                intent = %dispatched.kind,
                session_id = %dispatched.session_id,
                "controller: session changed while in flight; result dropped"
            );
            return Err(ControllerError::SessionChanged);
        }

        let outcome = match result {
            Ok(delta) => apply_delta(&mut state.store, &dispatched, delta),
            Err(err) => {
                record_failure(
                    &mut state.store,
                    dispatched.kind,
                    dispatched.pending.as_ref(),
                    &err,
                );
                Err(err.into())
            }
        };
        self.publish(&mut state);
        outcome
    }
}

fn require_session_id(session: &Session) -> Result<SessionId, ControllerError> {
    session.id.clone().ok_or(ControllerError::NoSession)
}

fn sent_payload<'a>(dispatched: &'a Dispatched, id: &EntityId) -> Option<&'a EntityPayload> {
    dispatched
        .sent
        .iter()
        .find(|(sent_id, _)| sent_id == id)
        .map(|(_, payload)| payload)
}

fn apply_delta(
    store: &mut SessionStore,
    dispatched: &Dispatched,
    mut delta: ServerDelta,
) -> Result<(), ControllerError> {
    let current = store.session().phase;
    if let Some(next) = delta.phase {
        if !current.can_transition_to(next) {
            let message = format!("illegal phase transition {current} -> {next}");
            record_protocol_violation(
                store,
                dispatched.kind,
                dispatched.pending.as_ref(),
                &message,
            );
            return Err(ControllerError::Protocol(message));
        }
    }

    let mut reply = delta.reply.take();
    if let Some(local_id) = &dispatched.pending {
        confirm_pending(store, local_id, &mut reply, &delta);
    }
    if let Some(reply) = reply {
        let id = delta.ack_id.clone().unwrap_or_else(EntityId::generate);
        store.append_entity(Entity::confirmed(
            id,
            EntityPayload::Exchange {
                prompt: None,
                reply: Some(reply),
                actions: delta.actions.clone(),
            },
        ));
    }

    for upsert in delta.upserts {
        store.upsert(upsert.id, upsert.payload);
    }
    for saved in delta.saved {
        match sent_payload(dispatched, &saved.client_id) {
            Some(sent) => {
                if !store.acknowledge_save(&saved.client_id, saved.id.clone(), sent) {
                    // Removed locally while the save was in flight.
                    store.mark_removed(saved.id);
                }
            }
            None => {
                store.promote(&saved.client_id, Some(saved.id));
            }
        }
    }
    for rejected in &delta.rejected {
        let sent = sent_payload(dispatched, rejected);
        let edited_since = match (sent, store.position(rejected)) {
            (Some(sent), Some(index)) => &store.session().entities[index].payload != sent,
            _ => false,
        };
        if edited_since {
            debug!(entity_id = %rejected, "controller: rejected record changed since, kept");
            continue;
        }
        warn!(entity_id = %rejected, "controller: server rejected record, rolling back");
        store.rollback(rejected);
    }
    if dispatched.kind == IntentKind::SaveChanges {
        store.clear_removed(&dispatched.removed);
    }

    let phase = delta.phase.unwrap_or(current);
    let error = match (current, phase) {
        (Phase::Failed, Phase::Failed) => store.session().error.clone(),
        (_, Phase::Failed) => Some(ErrorInfo::new(
            ErrorKind::ServerReported,
            "the server reported the session as failed",
        )),
        _ => None,
    };
    if phase != current {
        info!(from = %current, to = %phase, "controller: phase changed");
    }
    store.replace(SessionPatch {
        phase: Some(phase),
        error: Some(error),
        ..SessionPatch::default()
    });
    Ok(())
}

/// Fills the server's answer into the optimistic entry and confirms it.
/// Takes `reply` when the entry can carry it.
fn confirm_pending(
    store: &mut SessionStore,
    local_id: &EntityId,
    reply: &mut Option<String>,
    delta: &ServerDelta,
) {
    let Some(index) = store.position(local_id) else {
        debug!(entity_id = %local_id, "controller: pending entry vanished before confirmation");
        return;
    };
    let payload = match &store.session().entities[index].payload {
        EntityPayload::Exchange { prompt, .. } => EntityPayload::Exchange {
            prompt: prompt.clone(),
            reply: reply.take(),
            actions: delta.actions.clone(),
        },
        EntityPayload::FileUpload { filename, .. } => EntityPayload::FileUpload {
            filename: filename.clone(),
            reply: reply.take(),
            result: delta.file_result.clone(),
        },
        other => other.clone(),
    };
    store.update_entity(
        index,
        EntityPatch {
            id: delta.ack_id.clone(),
            payload: Some(payload),
            origin: Some(EntityOrigin::ServerConfirmed),
            confirmed: Some(None),
        },
    );
}

fn record_failure(
    store: &mut SessionStore,
    kind: IntentKind,
    pending: Option<&EntityId>,
    err: &TransportError,
) {
    warn!(intent = %kind, error = %err, "controller: gateway call failed");
    if let Some(id) = pending {
        store.rollback(id);
    }
    if kind.is_conversational() {
        store.append_entity(Entity::notice(format!(
            "Sorry, that did not go through ({err}). Please try again."
        )));
    }
    store.replace(SessionPatch {
        error: Some(Some(ErrorInfo::new(err.error_kind(), err.to_string()))),
        ..SessionPatch::default()
    });
}

fn record_protocol_violation(
    store: &mut SessionStore,
    kind: IntentKind,
    pending: Option<&EntityId>,
    message: &str,
) {
    warn!(intent = %kind, %message, "controller: server response rejected");
    if let Some(id) = pending {
        store.rollback(id);
    }
    if kind.is_conversational() {
        store.append_entity(Entity::notice(message));
    }
    store.replace(SessionPatch {
        error: Some(Some(ErrorInfo::new(ErrorKind::Protocol, message))),
        ..SessionPatch::default()
    });
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;

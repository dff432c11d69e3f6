//! In-memory session snapshot. Pure data: no I/O, no timers, no async.

use shared::domain::{
    Entity, EntityId, EntityOrigin, EntityPayload, ErrorInfo, Phase, Session, SessionId,
};
use tracing::{debug, warn};

/// Shallow merge applied by [`SessionStore::replace`]. `None` leaves a field
/// untouched; `dirty` is never patched directly.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub id: Option<Option<SessionId>>,
    pub phase: Option<Phase>,
    pub welcome: Option<Option<String>>,
    pub entities: Option<Vec<Entity>>,
    pub error: Option<Option<ErrorInfo>>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub id: Option<EntityId>,
    pub payload: Option<EntityPayload>,
    pub origin: Option<EntityOrigin>,
    pub confirmed: Option<Option<EntityPayload>>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    session: Session,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_session(session: Session) -> Self {
        let mut store = Self { session };
        store.refresh_dirty();
        store
    }

    /// Owned copy of the current state; callers never see internal references.
    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub fn replace(&mut self, patch: SessionPatch) {
        if let Some(id) = patch.id {
            self.session.id = id;
        }
        if let Some(phase) = patch.phase {
            self.session.phase = phase;
        }
        if let Some(welcome) = patch.welcome {
            self.session.welcome = welcome;
        }
        if let Some(entities) = patch.entities {
            self.session.entities = entities;
        }
        if let Some(error) = patch.error {
            self.session.error = error;
        }
        self.refresh_dirty();
    }

    pub fn append_entity(&mut self, entity: Entity) -> usize {
        self.session.entities.push(entity);
        self.refresh_dirty();
        self.session.entities.len() - 1
    }

    pub fn remove_entity(&mut self, index: usize) -> bool {
        if index >= self.session.entities.len() {
            warn!(
                index,
                len = self.session.entities.len(),
                "store: remove ignored, invalid index"
            );
            return false;
        }
        self.session.entities.remove(index);
        self.refresh_dirty();
        true
    }

    pub fn update_entity(&mut self, index: usize, patch: EntityPatch) -> bool {
        let len = self.session.entities.len();
        let Some(entity) = self.session.entities.get_mut(index) else {
            warn!(index, len, "store: update ignored, invalid index");
            return false;
        };
        if let Some(id) = patch.id {
            entity.id = id;
        }
        if let Some(payload) = patch.payload {
            entity.payload = payload;
        }
        if let Some(origin) = patch.origin {
            entity.origin = origin;
        }
        if let Some(confirmed) = patch.confirmed {
            entity.confirmed = confirmed;
        }
        self.refresh_dirty();
        true
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.session.entities.iter().position(|entity| &entity.id == id)
    }

    /// Flips a pending entity to confirmed, swapping in the server id when one
    /// was issued.
    pub fn promote(&mut self, local_id: &EntityId, server_id: Option<EntityId>) -> bool {
        let Some(index) = self.position(local_id) else {
            debug!(entity_id = %local_id, "store: promote skipped, entity gone");
            return false;
        };
        self.update_entity(
            index,
            EntityPatch {
                id: server_id,
                payload: None,
                origin: Some(EntityOrigin::ServerConfirmed),
                confirmed: Some(None),
            },
        )
    }

    /// Records that the server stored `sent` for the entity `local_id`.
    ///
    /// The entity is confirmed only if it still holds `sent`; an edit made
    /// while the save was in flight stays pending on top of the new server
    /// copy. Returns `false` when the entity no longer exists.
    pub fn acknowledge_save(
        &mut self,
        local_id: &EntityId,
        server_id: EntityId,
        sent: &EntityPayload,
    ) -> bool {
        let Some(index) = self.position(local_id) else {
            debug!(entity_id = %local_id, "store: save acknowledged for a missing entity");
            return false;
        };
        if &self.session.entities[index].payload == sent {
            return self.promote(local_id, Some(server_id));
        }
        debug!(entity_id = %local_id, "store: entity changed while saving, kept pending");
        self.update_entity(
            index,
            EntityPatch {
                id: Some(server_id),
                payload: None,
                origin: None,
                confirmed: Some(Some(sent.clone())),
            },
        )
    }

    /// Undoes a local change. A server record goes back to its confirmed
    /// payload; anything the server never saw is removed.
    pub fn rollback(&mut self, id: &EntityId) -> bool {
        let Some(index) = self.position(id) else {
            debug!(entity_id = %id, "store: rollback skipped, entity gone");
            return false;
        };
        match self.session.entities[index].confirmed.clone() {
            Some(payload) => self.update_entity(
                index,
                EntityPatch {
                    id: None,
                    payload: Some(payload),
                    origin: Some(EntityOrigin::ServerConfirmed),
                    confirmed: Some(None),
                },
            ),
            None => self.remove_entity(index),
        }
    }

    /// Replaces the payload of the entity with `id`, or appends a confirmed
    /// entity when none exists.
    pub fn upsert(&mut self, id: EntityId, payload: EntityPayload) {
        match self.position(&id) {
            Some(index) => {
                self.update_entity(
                    index,
                    EntityPatch {
                        id: None,
                        payload: Some(payload),
                        origin: Some(EntityOrigin::ServerConfirmed),
                        confirmed: Some(None),
                    },
                );
            }
            None => {
                self.append_entity(Entity::confirmed(id, payload));
            }
        }
    }

    pub fn mark_removed(&mut self, id: EntityId) {
        if !self.session.removed.contains(&id) {
            self.session.removed.push(id);
        }
        self.refresh_dirty();
    }

    pub fn clear_removed(&mut self, ids: &[EntityId]) {
        self.session.removed.retain(|id| !ids.contains(id));
        self.refresh_dirty();
    }

    pub fn reset(&mut self) {
        self.session = Session::default();
    }

    fn refresh_dirty(&mut self) {
        self.session.dirty = self.session.has_unsaved_changes();
    }
}

//! Single source of truth for who may author an entity.
//!
//! Ownership is never written directly: `claim`, `release` and
//! `transfer_on_disconnect` are the only paths that move it, and every move is
//! journaled so the replication loop can flush it ahead of transform patches.
//! Claims are first-come-first-served in server receipt order; the inbound
//! queue is consumed serially, so two sessions can never race each other.

use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::types::{EntityId, Owner, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerChange {
    pub entity: EntityId,
    pub owner: Owner,
}

#[derive(Debug, Default)]
pub struct AuthorityResolver {
    owners: HashMap<EntityId, Owner>,
    changes: Vec<OwnerChange>,
}

impl AuthorityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly created entity.
    pub(crate) fn register(&mut self, entity: EntityId, owner: Owner) {
        self.owners.insert(entity, owner);
    }

    pub(crate) fn deregister(&mut self, entity: EntityId) -> Option<Owner> {
        self.changes.retain(|c| c.entity != entity);
        self.owners.remove(&entity)
    }

    /// Applies an ownership change decided by the server. Clients mirror
    /// authority through this; it never journals.
    pub(crate) fn assign_replicated(&mut self, entity: EntityId, owner: Owner) {
        if let Some(current) = self.owners.get_mut(&entity) {
            *current = owner;
        }
    }

    pub fn owner(&self, entity: EntityId) -> Option<Owner> {
        self.owners.get(&entity).copied()
    }

    pub fn can_author(&self, entity: EntityId, session: SessionId) -> bool {
        self.owner(entity)
            .is_some_and(|owner| owner.is_session(session))
    }

    /// Succeeds when the entity rests with the server or is already held by
    /// `session`. Never steals from another client.
    pub fn claim(&mut self, entity: EntityId, session: SessionId) -> SyncResult<()> {
        let owner = self
            .owners
            .get_mut(&entity)
            .ok_or(SyncError::NotFound(entity))?;

        match *owner {
            Owner::Client(current) if current == session => Ok(()),
            Owner::Client(_) => Err(SyncError::Authority { entity, session }),
            Owner::Server => {
                let next = Owner::from_session(session);
                if next != Owner::Server {
                    *owner = next;
                    self.changes.push(OwnerChange {
                        entity,
                        owner: next,
                    });
                    log::debug!("{} claimed entity {}", session, entity);
                }
                Ok(())
            }
        }
    }

    /// Hands the entity back to the server. A release from anyone but the
    /// current owner is ignored so a stale release cannot clobber a new claim.
    pub fn release(&mut self, entity: EntityId, session: SessionId) {
        let Some(owner) = self.owners.get_mut(&entity) else {
            return;
        };
        if *owner == Owner::Server || !owner.is_session(session) {
            return;
        }
        *owner = Owner::Server;
        self.changes.push(OwnerChange {
            entity,
            owner: Owner::Server,
        });
        log::debug!("{} released entity {}", session, entity);
    }

    /// Reassigns everything `session` authored to the server and returns the
    /// affected ids, sorted for a stable broadcast order.
    pub fn transfer_on_disconnect(&mut self, session: SessionId) -> Vec<EntityId> {
        if session.is_server() {
            return Vec::new();
        }

        let mut affected: Vec<EntityId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == Owner::Client(session))
            .map(|(&id, _)| id)
            .collect();
        affected.sort();

        for &entity in &affected {
            self.owners.insert(entity, Owner::Server);
            self.changes.push(OwnerChange {
                entity,
                owner: Owner::Server,
            });
        }

        if !affected.is_empty() {
            log::info!(
                "reclaimed {} entities from disconnected {}",
                affected.len(),
                session
            );
        }
        affected
    }

    pub fn owned_by(&self, session: SessionId) -> impl Iterator<Item = EntityId> + '_ {
        self.owners
            .iter()
            .filter(move |(_, owner)| owner.is_session(session))
            .map(|(&id, _)| id)
    }

    pub fn drain_changes(&mut self) -> Vec<OwnerChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    fn resolver_with(entity: EntityId) -> AuthorityResolver {
        let mut resolver = AuthorityResolver::new();
        resolver.register(entity, Owner::Server);
        resolver
    }

    #[test]
    fn first_claim_wins() {
        let x = EntityId::new();
        let mut resolver = resolver_with(x);

        resolver.claim(x, A).unwrap();
        let err = resolver.claim(x, B).unwrap_err();

        assert_eq!(err, SyncError::Authority { entity: x, session: B });
        assert_eq!(resolver.owner(x), Some(Owner::Client(A)));
        assert!(resolver.can_author(x, A));
        assert!(!resolver.can_author(x, B));
    }

    #[test]
    fn reclaim_by_owner_is_noop() {
        let x = EntityId::new();
        let mut resolver = resolver_with(x);

        resolver.claim(x, A).unwrap();
        resolver.claim(x, A).unwrap();
        assert_eq!(resolver.drain_changes().len(), 1);
    }

    #[test]
    fn stale_release_ignored() {
        let x = EntityId::new();
        let mut resolver = resolver_with(x);

        resolver.claim(x, A).unwrap();
        resolver.release(x, A);
        resolver.claim(x, B).unwrap();
        resolver.release(x, A);

        assert_eq!(resolver.owner(x), Some(Owner::Client(B)));
    }

    #[test]
    fn disconnect_reclaims_everything() {
        let (x, y, z) = (EntityId::new(), EntityId::new(), EntityId::new());
        let mut resolver = AuthorityResolver::new();
        for id in [x, y, z] {
            resolver.register(id, Owner::Server);
        }
        resolver.claim(x, A).unwrap();
        resolver.claim(y, A).unwrap();
        resolver.claim(z, B).unwrap();
        resolver.drain_changes();

        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(resolver.transfer_on_disconnect(A), expected);

        assert_eq!(resolver.owner(x), Some(Owner::Server));
        assert_eq!(resolver.owner(y), Some(Owner::Server));
        assert_eq!(resolver.owner(z), Some(Owner::Client(B)));
        assert_eq!(resolver.owned_by(A).count(), 0);
        assert_eq!(resolver.drain_changes().len(), 2);
    }

    #[test]
    fn claim_unknown_entity() {
        let mut resolver = AuthorityResolver::new();
        let x = EntityId::new();
        assert_eq!(resolver.claim(x, A), Err(SyncError::NotFound(x)));
    }

    #[test]
    fn at_most_one_author() {
        let x = EntityId::new();
        let mut resolver = resolver_with(x);
        let sessions = [A, B, SessionId(3)];

        for round in 0..12 {
            let session = sessions[round % sessions.len()];
            if round % 4 == 3 {
                resolver.release(x, session);
            } else {
                let _ = resolver.claim(x, session);
            }
            let authors = sessions
                .iter()
                .chain(std::iter::once(&SessionId::SERVER))
                .filter(|s| resolver.can_author(x, **s))
                .count();
            assert_eq!(authors, 1);
        }
    }
}

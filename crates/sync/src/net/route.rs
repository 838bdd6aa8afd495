use crate::types::{Owner, Role, SessionId};

/// Where an intent on an owned entity has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Server holds the truth for this entity: apply and replicate.
    ApplyAndBroadcast,
    /// A client authors the entity; the server must ask it.
    ForwardToOwner(SessionId),
    /// Client owns the entity: predict locally and tell the server.
    ApplyLocallyAndSend,
    /// Client does not own the entity: only the server can route it.
    SendToServer,
}

/// Ownership routing table.
///
/// `local` is the session this process runs as (the server sentinel on the
/// server), `origin` is who issued the intent, `owner` is the entity's
/// current author.
pub fn route(role: Role, local: SessionId, origin: SessionId, owner: Owner) -> Route {
    match role {
        Role::Server => match owner {
            Owner::Server => Route::ApplyAndBroadcast,
            Owner::Client(author) if author == origin => Route::ApplyAndBroadcast,
            Owner::Client(author) => Route::ForwardToOwner(author),
        },
        Role::Client => {
            if owner == Owner::Client(local) {
                Route::ApplyLocallyAndSend
            } else {
                Route::SendToServer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: SessionId = SessionId::SERVER;
    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn server_applies_server_owned() {
        assert_eq!(
            route(Role::Server, SERVER, SERVER, Owner::Server),
            Route::ApplyAndBroadcast
        );
    }

    #[test]
    fn server_forwards_client_owned() {
        assert_eq!(
            route(Role::Server, SERVER, SERVER, Owner::Client(A)),
            Route::ForwardToOwner(A)
        );
    }

    #[test]
    fn client_predicts_owned() {
        assert_eq!(
            route(Role::Client, A, A, Owner::Client(A)),
            Route::ApplyLocallyAndSend
        );
    }

    #[test]
    fn client_sends_foreign_to_server() {
        assert_eq!(route(Role::Client, A, A, Owner::Client(B)), Route::SendToServer);
        assert_eq!(route(Role::Client, A, A, Owner::Server), Route::SendToServer);
    }

    #[test]
    fn server_relays_remote_intents() {
        assert_eq!(
            route(Role::Server, SERVER, A, Owner::Client(A)),
            Route::ApplyAndBroadcast
        );
        assert_eq!(
            route(Role::Server, SERVER, A, Owner::Server),
            Route::ApplyAndBroadcast
        );
        assert_eq!(
            route(Role::Server, SERVER, A, Owner::Client(B)),
            Route::ForwardToOwner(B)
        );
    }
}

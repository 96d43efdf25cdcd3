//! Maps inbound control actions to session operations.
//!
//! The router is the authorization boundary: listener-level actions are open
//! to any member of the space, destructive ones require a manager. An
//! `Enqueue` is the only action allowed to create a session; everything else
//! requires one to exist already.

use crate::error::EngineError;
use crate::registry::Registry;
use jockey_proto::protocol::{ActionKind, ControlAction};
use jockey_proto::track::Notice;
use std::sync::Arc;

pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch(&self, action: ControlAction) -> Result<Notice, EngineError> {
        if action.actor.role < action.kind.required_role() {
            return Err(EngineError::Unauthorized {
                actor: action.actor.id,
                action: action.kind.name(),
            });
        }

        let handle = match action.kind {
            ActionKind::Enqueue { .. } => {
                self.registry
                    .get_or_create(action.space, action.display_channel)
                    .await
            }
            _ => self
                .registry
                .get(action.space)
                .await
                .ok_or(EngineError::SessionNotFound(action.space))?,
        };
        handle.dispatch(action.kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeHandle;
    use crate::prefs::NullPrefStore;
    use crate::presence::LogSurface;
    use crate::scrobble::NullScrobbleSink;
    use jockey_proto::config::{PresenceConfig, SessionConfig};
    use jockey_proto::track::{Actor, ActorId, Role, SpaceId, Track};
    use tokio::sync::broadcast;

    fn router() -> Router {
        let (node, _node_rx) = NodeHandle::channel(32);
        let (events, _) = broadcast::channel(64);
        let registry = Registry::new(
            SessionConfig::default(),
            PresenceConfig::default(),
            node,
            Arc::new(NullPrefStore),
            Arc::new(NullScrobbleSink),
            Arc::new(LogSurface::default()),
            events,
        );
        Router::new(registry)
    }

    fn action(kind: ActionKind, role: Role) -> ControlAction {
        ControlAction {
            space: SpaceId(1),
            actor: Actor {
                id: ActorId(7),
                role,
            },
            display_channel: None,
            kind,
        }
    }

    fn sample_track() -> Track {
        Track {
            id: "a".into(),
            title: "A".into(),
            uri: "https://example.com/a".into(),
            duration_ms: None,
            requester: ActorId(7),
            artwork: None,
        }
    }

    #[tokio::test]
    async fn test_listener_cannot_stop() {
        let router = router();
        let err = router
            .dispatch(action(ActionKind::Stop, Role::Listener))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Unauthorized {
                actor: ActorId(7),
                action: "stop",
            }
        );
    }

    #[tokio::test]
    async fn test_action_without_session_rejected() {
        let router = router();
        let err = router
            .dispatch(action(ActionKind::Pause, Role::Listener))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SessionNotFound(SpaceId(1)));
    }

    #[tokio::test]
    async fn test_enqueue_creates_session_then_manager_stops() {
        let router = router();
        let notice = router
            .dispatch(action(
                ActionKind::Enqueue {
                    track: sample_track(),
                },
                Role::Listener,
            ))
            .await
            .unwrap();
        assert_eq!(notice.key, "queue.added");

        let notice = router
            .dispatch(action(ActionKind::Stop, Role::Manager))
            .await
            .unwrap();
        assert_eq!(notice.key, "player.stopped");
    }
}

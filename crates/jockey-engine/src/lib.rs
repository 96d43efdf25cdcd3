pub mod error;
pub mod node;
pub mod prefs;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scrobble;
pub mod session;
pub mod socket;

use jockey_proto::protocol::SessionSnapshot;
use jockey_proto::track::{Notice, SpaceId};

/// Engine-wide notifications fanned out to connected bot processes.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Snapshot(SessionSnapshot),
    Notice { space: SpaceId, notice: Notice },
}

use crate::track::{Actor, ChannelId, LoopMode, Notice, Role, SpaceId, Track};
use serde::{Deserialize, Serialize};

/// Current protocol version. Bump this when the wire format changes in a
/// breaking way. Clients check it on connect and can refuse to talk to an
/// incompatible engine.
pub const PROTOCOL_VERSION: u32 = 1;

// ── control actions ───────────────────────────────────────────────────────────

/// What a member asked the engine to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Enqueue { track: Track },
    Pause,
    Resume,
    Skip { count: usize },
    Previous,
    Stop,
    SetVolume { volume: u16 },
    SetLoop { mode: LoopMode },
    ToggleShuffle,
    Remove { index: usize },
    Move { from: usize, to: usize },
}

impl ActionKind {
    /// Minimum role allowed to issue this action. Destructive edits are
    /// restricted; everything else is open to any member of the space.
    pub fn required_role(&self) -> Role {
        match self {
            ActionKind::Stop | ActionKind::Remove { .. } | ActionKind::Move { .. } => Role::Manager,
            _ => Role::Listener,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Enqueue { .. } => "enqueue",
            ActionKind::Pause => "pause",
            ActionKind::Resume => "resume",
            ActionKind::Skip { .. } => "skip",
            ActionKind::Previous => "previous",
            ActionKind::Stop => "stop",
            ActionKind::SetVolume { .. } => "set_volume",
            ActionKind::SetLoop { .. } => "set_loop",
            ActionKind::ToggleShuffle => "toggle_shuffle",
            ActionKind::Remove { .. } => "remove",
            ActionKind::Move { .. } => "move",
        }
    }
}

/// A normalized member request. Exists only in transit; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAction {
    pub space: SpaceId,
    pub actor: Actor,
    /// Channel configured for the persistent status display, if any.
    /// Only consulted when the action creates the session.
    #[serde(default)]
    pub display_channel: Option<ChannelId>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

// ── audio node protocol ───────────────────────────────────────────────────────

/// Commands sent to the audio node, keyed by space. The node performs all
/// decoding and transport; the engine only steers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum NodeCommand {
    Play {
        uri: String,
        position_ms: u64,
        volume: u16,
        paused: bool,
    },
    Pause,
    Resume,
    Seek { position_ms: u64 },
    SetVolume { volume: u16 },
    Stop,
}

/// One request frame on the node channel. `generation` is echoed back in
/// every event the command produces, so superseded commands can be told
/// apart from current ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub space: SpaceId,
    pub generation: u64,
    #[serde(flatten)]
    pub command: NodeCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEndReason {
    Finished,
    Error,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEventKind {
    TrackStarted,
    TrackEnded { reason: TrackEndReason },
    PositionUpdate { position_ms: u64 },
}

/// Asynchronous event pushed by the audio node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub space: SpaceId,
    pub generation: u64,
    #[serde(flatten)]
    pub kind: NodeEventKind,
}

// ── session snapshots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    #[default]
    Idle, // no queue content, nothing requested
    Loading, // track dispatched, awaiting node readiness
    Playing,
    Paused,
    Ended,   // queue exhausted with loop off
    Stopped, // terminal
}

/// Observable state of one session. `rev` is a monotonically increasing
/// counter bumped on every change; consumers use it to detect missed
/// updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub space: SpaceId,
    pub state: PlayState,
    pub current: Option<Track>,
    pub position_ms: u64,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub queue_len: usize,
    #[serde(default)]
    pub display_channel: Option<ChannelId>,
    /// Unix milliseconds of the last member-visible activity; drives idle
    /// eviction.
    #[serde(default)]
    pub last_activity_ms: i64,
}

// ── control socket framing ────────────────────────────────────────────────────

/// Messages sent from the bot process to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ClientMessage {
    Action { action: ControlAction },
}

/// Messages pushed from the engine to connected bot processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent immediately on connect.
    Hello { protocol_version: u32 },
    /// Direct reply to an `Action` request.
    Ack { ok: bool, notice: Notice },
    Snapshot { data: SessionSnapshot },
    Notice { space: SpaceId, notice: Notice },
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Client(ClientMessage),
    Server(ServerMessage),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

//! Per-space playback session.
//!
//! One task owns each session; member actions and node events are delivered
//! through a single mpsc inbox, so the state machine only ever observes one
//! transition at a time. Commands to the audio node are fire-and-forget:
//! the session optimistically enters `Loading` and corrects itself when the
//! node reports back.

use crate::error::EngineError;
use crate::node::NodeHandle;
use crate::prefs::{PrefStore, SpacePrefs};
use crate::queue::Queue;
use crate::scrobble::ScrobbleSink;
use crate::EngineEvent;
use jockey_proto::config::SessionConfig;
use jockey_proto::protocol::{
    ActionKind, NodeCommand, NodeEvent, NodeEventKind, PlayState, SessionSnapshot, TrackEndReason,
};
use jockey_proto::track::{ChannelId, LoopMode, Notice, SpaceId, Track};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inputs delivered to a session task. Everything that can mutate a session
/// flows through this one channel.
#[derive(Debug)]
pub enum SessionMsg {
    Action {
        kind: ActionKind,
        reply: oneshot::Sender<Result<Notice, EngineError>>,
    },
    Node(NodeEvent),
    Link(LinkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Cheaply cloneable handle to a session task. Holds the space key and
/// channels only — never the session itself.
#[derive(Clone)]
pub struct SessionHandle {
    pub space: SpaceId,
    tx: mpsc::Sender<SessionMsg>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Sends an action and waits for the session's verdict.
    pub async fn dispatch(&self, kind: ActionKind) -> Result<Notice, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionMsg::Action {
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::SessionNotFound(self.space))?;
        reply_rx
            .await
            .map_err(|_| EngineError::SessionNotFound(self.space))?
    }

    /// Delivers a node event or link transition. Returns false when the
    /// session is gone.
    pub async fn deliver(&self, msg: SessionMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Cancelled atomically with the transition to `Stopped`; the presence
    /// lane hangs teardown off this token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Elapsed-position estimate: a base offset plus an optional running anchor.
#[derive(Debug, Default)]
struct PositionClock {
    base_ms: u64,
    anchor: Option<Instant>,
}

impl PositionClock {
    fn current(&self) -> u64 {
        let running = self
            .anchor
            .map(|a| a.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.base_ms + running
    }

    fn set(&mut self, ms: u64, running: bool) {
        self.base_ms = ms;
        self.anchor = running.then(Instant::now);
    }

    fn freeze(&mut self) {
        self.base_ms = self.current();
        self.anchor = None;
    }
}

pub struct Session {
    space: SpaceId,
    display_channel: Option<ChannelId>,
    cfg: SessionConfig,
    node: NodeHandle,
    prefs: Arc<dyn PrefStore>,
    scrobble: Arc<dyn ScrobbleSink>,
    events: broadcast::Sender<EngineEvent>,

    queue: Queue,
    state: PlayState,
    volume: u16,
    position: PositionClock,
    /// Bumped on every dispatch to the node and on explicit stop; node
    /// events carrying an older value are discarded.
    generation: u64,
    link_up: bool,
    /// Explicit member pause, as opposed to the frozen state a link loss
    /// imposes. A reconnect must not un-pause behind the member's back.
    user_paused: bool,
    resume_attempts: u32,
    history: Vec<Track>,
    track_started_at: i64,
    last_activity_ms: i64,
    rev: u64,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates the session task and returns its handle. The stored volume
    /// preference, if any, overrides the configured default.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        space: SpaceId,
        display_channel: Option<ChannelId>,
        cfg: SessionConfig,
        node: NodeHandle,
        prefs: Arc<dyn PrefStore>,
        scrobble: Arc<dyn ScrobbleSink>,
        events: broadcast::Sender<EngineEvent>,
        link_up: bool,
    ) -> SessionHandle {
        let volume = prefs
            .load(space)
            .await
            .ok()
            .flatten()
            .and_then(|p| p.volume)
            .unwrap_or(cfg.default_volume);

        let (tx, rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let cancel = CancellationToken::new();

        let mut session = Session {
            space,
            display_channel,
            cfg,
            node,
            prefs,
            scrobble,
            events,
            queue: Queue::new(),
            state: PlayState::Idle,
            volume,
            position: PositionClock::default(),
            generation: 0,
            link_up,
            user_paused: false,
            resume_attempts: 0,
            history: Vec::new(),
            track_started_at: 0,
            last_activity_ms: chrono::Utc::now().timestamp_millis(),
            rev: 0,
            snapshot_tx,
            cancel: cancel.clone(),
        };
        session.publish();

        tokio::spawn(session.run(rx));

        SessionHandle {
            space,
            tx,
            snapshot_rx,
            cancel,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionMsg>) {
        debug!("space {}: session task started", self.space);
        while let Some(msg) = rx.recv().await {
            match msg {
                SessionMsg::Action { kind, reply } => {
                    let result = self.handle_action(kind).await;
                    let _ = reply.send(result);
                }
                SessionMsg::Node(event) => self.handle_node(event).await,
                SessionMsg::Link(link) => self.handle_link(link).await,
            }
            if self.state == PlayState::Stopped {
                break;
            }
        }
        // Covers abandonment without an explicit stop as well.
        self.cancel.cancel();
        debug!("space {}: session task exiting", self.space);
    }

    // ── member actions ────────────────────────────────────────────────────────

    async fn handle_action(&mut self, kind: ActionKind) -> Result<Notice, EngineError> {
        debug!("space {}: action {}", self.space, kind.name());
        match kind {
            ActionKind::Enqueue { track } => {
                let title = track.title.clone();
                let index = self.queue.append(track);
                self.touch();
                if matches!(self.state, PlayState::Idle | PlayState::Ended) {
                    self.queue.jump_to(index);
                    self.user_paused = false;
                    self.start_current(0).await;
                }
                self.publish();
                Ok(Notice::new("queue.added")
                    .with("title", title)
                    .with("position", index + 1))
            }

            ActionKind::Pause => match self.state {
                PlayState::Playing => {
                    self.user_paused = true;
                    self.position.freeze();
                    self.state = PlayState::Paused;
                    if self.link_up {
                        self.node
                            .submit(self.space, self.generation, NodeCommand::Pause)
                            .await;
                    }
                    self.touch();
                    self.publish();
                    Ok(Notice::new("player.paused"))
                }
                PlayState::Loading => {
                    self.user_paused = true;
                    if self.link_up {
                        self.node
                            .submit(self.space, self.generation, NodeCommand::Pause)
                            .await;
                    }
                    self.touch();
                    Ok(Notice::new("player.paused"))
                }
                // Idempotent for retried button presses.
                PlayState::Paused => Ok(Notice::new("player.paused")),
                _ => Err(EngineError::InvalidTarget),
            },

            ActionKind::Resume => match self.state {
                PlayState::Paused => {
                    self.user_paused = false;
                    self.touch();
                    if self.link_up {
                        self.node
                            .submit(self.space, self.generation, NodeCommand::Resume)
                            .await;
                        self.position.set(self.position.current(), true);
                        self.state = PlayState::Playing;
                    }
                    // Link down: stay paused, the reconnect path re-issues
                    // the track unpaused.
                    self.publish();
                    Ok(Notice::new("player.resumed"))
                }
                PlayState::Loading => {
                    self.user_paused = false;
                    if self.link_up {
                        self.node
                            .submit(self.space, self.generation, NodeCommand::Resume)
                            .await;
                    }
                    self.touch();
                    Ok(Notice::new("player.resumed"))
                }
                PlayState::Playing => Ok(Notice::new("player.resumed")),
                _ => Err(EngineError::InvalidTarget),
            },

            ActionKind::Skip { count } => {
                if !matches!(
                    self.state,
                    PlayState::Playing | PlayState::Paused | PlayState::Loading
                ) {
                    return Err(EngineError::InvalidTarget);
                }
                let outgoing_cursor = self.queue.cursor();
                let outgoing = self.queue.current().cloned();
                let target = self.queue.skip_target(count.max(1))?;
                if let Some(track) = outgoing {
                    if outgoing_cursor != Some(target) {
                        self.history.push(track);
                    }
                }
                self.user_paused = false;
                self.touch();
                self.start_current(0).await;
                self.publish();
                let title = self
                    .queue
                    .current()
                    .map(|t| t.title.clone())
                    .unwrap_or_default();
                Ok(Notice::new("player.skipped").with("title", title))
            }

            ActionKind::Previous => {
                let previous = self.history.pop().ok_or(EngineError::InvalidTarget)?;
                let title = previous.title.clone();
                self.queue.insert_at_cursor(previous);
                self.user_paused = false;
                self.touch();
                self.start_current(0).await;
                self.publish();
                Ok(Notice::new("player.previous").with("title", title))
            }

            ActionKind::Stop => {
                self.generation += 1;
                self.queue.clear();
                self.history.clear();
                self.position.set(0, false);
                self.user_paused = false;
                if self.link_up {
                    self.node
                        .submit(self.space, self.generation, NodeCommand::Stop)
                        .await;
                }
                self.state = PlayState::Stopped;
                self.touch();
                // Pending deferred renders die with the same transition.
                self.cancel.cancel();
                self.publish();
                info!("space {}: session stopped", self.space);
                Ok(Notice::new("player.stopped"))
            }

            ActionKind::SetVolume { volume } => {
                if volume > 150 {
                    return Err(EngineError::OutOfRange(volume));
                }
                self.volume = volume;
                if self.link_up {
                    self.node
                        .submit(self.space, self.generation, NodeCommand::SetVolume { volume })
                        .await;
                }
                self.touch();
                self.publish();
                let prefs = self.prefs.clone();
                let space = self.space;
                tokio::spawn(async move {
                    if let Err(e) = prefs
                        .store(
                            space,
                            SpacePrefs {
                                volume: Some(volume),
                            },
                        )
                        .await
                    {
                        debug!("space {}: preference write failed: {}", space, e);
                    }
                });
                Ok(Notice::new("player.volume_set").with("volume", volume))
            }

            ActionKind::SetLoop { mode } => {
                self.queue.set_loop_mode(mode);
                self.touch();
                self.publish();
                Ok(Notice::new("player.loop_set").with("mode", loop_mode_name(mode)))
            }

            ActionKind::ToggleShuffle => {
                let on = self.queue.toggle_shuffle();
                self.touch();
                self.publish();
                Ok(Notice::new(if on {
                    "player.shuffle_on"
                } else {
                    "player.shuffle_off"
                }))
            }

            ActionKind::Remove { index } => {
                let removed = self.queue.remove_at(index)?;
                self.touch();
                self.publish();
                Ok(Notice::new("queue.removed").with("title", removed.title))
            }

            ActionKind::Move { from, to } => {
                self.queue.move_track(from, to)?;
                self.touch();
                self.publish();
                Ok(Notice::new("queue.moved").with("from", from + 1).with("to", to + 1))
            }
        }
    }

    // ── node events ───────────────────────────────────────────────────────────

    async fn handle_node(&mut self, event: NodeEvent) {
        if event.generation < self.generation {
            debug!(
                "space {}: discarding stale node event (gen {} < {})",
                self.space, event.generation, self.generation
            );
            return;
        }
        match event.kind {
            NodeEventKind::TrackStarted => {
                if self.queue.current().is_none()
                    || !matches!(
                        self.state,
                        PlayState::Loading | PlayState::Playing | PlayState::Paused
                    )
                {
                    return;
                }
                self.resume_attempts = 0;
                self.track_started_at = chrono::Utc::now().timestamp();
                if self.user_paused {
                    self.state = PlayState::Paused;
                } else {
                    self.state = PlayState::Playing;
                    self.position.set(self.position.base_ms, true);
                }
                self.touch();
                self.publish();
                if let Some(track) = self.queue.current().cloned() {
                    let sink = self.scrobble.clone();
                    let space = self.space;
                    tokio::spawn(async move { sink.now_playing(space, &track).await });
                }
            }

            NodeEventKind::TrackEnded { reason } => {
                if !matches!(
                    self.state,
                    PlayState::Loading | PlayState::Playing | PlayState::Paused
                ) {
                    return;
                }
                let ended = self.queue.current().cloned();
                if reason == TrackEndReason::Finished {
                    if let Some(track) = ended {
                        self.history.push(track.clone());
                        let sink = self.scrobble.clone();
                        let space = self.space;
                        let started_at = self.track_started_at;
                        tokio::spawn(async move { sink.scrobble(space, &track, started_at).await });
                    }
                }

                let next = if reason == TrackEndReason::Error
                    && self.queue.loop_mode() == LoopMode::Track
                {
                    // Replaying a broken track would loop the failure.
                    self.queue.set_loop_mode(LoopMode::Off);
                    let next = self.queue.advance_after_end();
                    self.queue.set_loop_mode(LoopMode::Track);
                    next
                } else {
                    self.queue.advance_after_end()
                };

                match next {
                    Some(_) => self.start_current(0).await,
                    None => {
                        self.state = PlayState::Ended;
                        self.position.set(0, false);
                        self.touch();
                    }
                }
                self.publish();
            }

            NodeEventKind::PositionUpdate { position_ms } => {
                if self.state == PlayState::Playing {
                    self.position.set(position_ms, true);
                    self.publish();
                }
            }
        }
    }

    // ── link transitions ──────────────────────────────────────────────────────

    async fn handle_link(&mut self, link: LinkState) {
        match link {
            LinkState::Down => {
                self.link_up = false;
                if self.state == PlayState::Stopped {
                    return;
                }
                // Trackless states have nothing to freeze.
                if self.queue.current().is_some()
                    && matches!(
                        self.state,
                        PlayState::Loading | PlayState::Playing | PlayState::Paused
                    )
                {
                    self.position.freeze();
                    self.state = PlayState::Paused;
                    self.publish();
                    info!(
                        "space {}: node link lost, frozen at {}ms",
                        self.space,
                        self.position.current()
                    );
                }
            }
            LinkState::Up => {
                self.link_up = true;
                if self.state == PlayState::Stopped {
                    return;
                }
                if self.queue.current().is_some()
                    && matches!(self.state, PlayState::Loading | PlayState::Paused)
                {
                    self.resume_attempts += 1;
                    if self.resume_attempts > self.cfg.resume_attempts {
                        warn!(
                            "space {}: resume budget exhausted after {} attempts",
                            self.space, self.resume_attempts
                        );
                        self.generation += 1;
                        self.queue.clear();
                        self.state = PlayState::Ended;
                        self.position.set(0, false);
                        self.publish();
                        self.notify(Notice::new("errors.playback_lost"));
                        return;
                    }
                    let frozen = self.position.current();
                    self.start_current(frozen).await;
                    self.publish();
                }
            }
        }
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Dispatches the cursor track to the node (when the link is up) and
    /// enters `Loading`. Each dispatch gets a fresh generation so events
    /// from superseded commands can be told apart.
    async fn start_current(&mut self, position_ms: u64) {
        self.generation += 1;
        self.state = PlayState::Loading;
        self.position.set(position_ms, false);
        if let Some(track) = self.queue.current() {
            if self.link_up {
                let command = NodeCommand::Play {
                    uri: track.uri.clone(),
                    position_ms,
                    volume: self.volume,
                    paused: self.user_paused,
                };
                self.node.submit(self.space, self.generation, command).await;
            } else {
                debug!("space {}: node link down, deferring dispatch", self.space);
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity_ms = chrono::Utc::now().timestamp_millis();
    }

    fn publish(&mut self) {
        self.rev += 1;
        let snapshot = self.make_snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        let _ = self.events.send(EngineEvent::Snapshot(snapshot));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.events.send(EngineEvent::Notice {
            space: self.space,
            notice,
        });
    }

    fn make_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            rev: self.rev,
            space: self.space,
            state: self.state,
            current: self.queue.current().cloned(),
            position_ms: self.position.current(),
            volume: self.volume,
            loop_mode: self.queue.loop_mode(),
            shuffle: self.queue.is_shuffled(),
            queue_len: self.queue.len(),
            display_channel: self.display_channel,
            last_activity_ms: self.last_activity_ms,
        }
    }
}

fn loop_mode_name(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "off",
        LoopMode::Track => "track",
        LoopMode::Queue => "queue",
    }
}

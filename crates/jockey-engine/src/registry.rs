//! Process-wide map from community space to its playback session.
//!
//! Creation is exclusive: a second concurrent creator for the same key
//! observes the first creator's instance, never a duplicate. A recurring
//! sweep stops and removes sessions that have been idle past the configured
//! threshold; stopping first lets the audio node release its resources and
//! the presence lane delete the status display.

use crate::node::{NodeHandle, NodeSignal};
use crate::prefs::PrefStore;
use crate::presence::{self, PresenceSurface};
use crate::scrobble::ScrobbleSink;
use crate::session::{LinkState, Session, SessionHandle, SessionMsg};
use crate::EngineEvent;
use jockey_proto::config::{PresenceConfig, SessionConfig};
use jockey_proto::protocol::{ActionKind, PlayState};
use jockey_proto::track::{ChannelId, SpaceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info};

pub struct Registry {
    sessions: Mutex<HashMap<SpaceId, SessionHandle>>,
    session_cfg: SessionConfig,
    presence_cfg: PresenceConfig,
    node: NodeHandle,
    prefs: Arc<dyn PrefStore>,
    scrobble: Arc<dyn ScrobbleSink>,
    surface: Arc<dyn PresenceSurface>,
    events: broadcast::Sender<EngineEvent>,
    link_up: AtomicBool,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_cfg: SessionConfig,
        presence_cfg: PresenceConfig,
        node: NodeHandle,
        prefs: Arc<dyn PrefStore>,
        scrobble: Arc<dyn ScrobbleSink>,
        surface: Arc<dyn PresenceSurface>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            session_cfg,
            presence_cfg,
            node,
            prefs,
            scrobble,
            surface,
            events,
            link_up: AtomicBool::new(false),
        })
    }

    /// Returns the session for `space`, creating it on first use.
    pub async fn get_or_create(
        &self,
        space: SpaceId,
        display_channel: Option<ChannelId>,
    ) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&space) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let handle = Session::spawn(
            space,
            display_channel,
            self.session_cfg.clone(),
            self.node.clone(),
            self.prefs.clone(),
            self.scrobble.clone(),
            self.events.clone(),
            self.link_up.load(Ordering::Relaxed),
        )
        .await;

        if let Some(channel) = display_channel {
            presence::spawn_lane(
                space,
                channel,
                self.surface.clone(),
                Duration::from_millis(self.presence_cfg.min_render_interval_ms),
                handle.watch(),
                handle.cancel_token(),
                self.events.clone(),
            );
        }

        sessions.insert(space, handle.clone());
        info!("space {}: session created", space);
        handle
    }

    pub async fn get(&self, space: SpaceId) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(&space).filter(|h| !h.is_closed()).cloned()
    }

    pub async fn remove(&self, space: SpaceId) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(&space).is_some() {
            info!("space {}: session removed", space);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Routes node signals into session inboxes. Events are demultiplexed
    /// by space here; generation filtering happens inside the session.
    pub async fn route_node_signals(self: Arc<Self>, mut rx: mpsc::Receiver<NodeSignal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                NodeSignal::Event(event) => {
                    if let Some(handle) = self.get(event.space).await {
                        handle.deliver(SessionMsg::Node(event)).await;
                    } else {
                        debug!("node event for unknown space {}", event.space);
                    }
                }
                NodeSignal::LinkUp => {
                    self.link_up.store(true, Ordering::Relaxed);
                    self.fan_out_link(LinkState::Up).await;
                }
                NodeSignal::LinkDown => {
                    self.link_up.store(false, Ordering::Relaxed);
                    self.fan_out_link(LinkState::Down).await;
                }
            }
        }
    }

    async fn fan_out_link(&self, link: LinkState) {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.lock().await;
            sessions.values().cloned().collect()
        };
        for handle in handles {
            handle.deliver(SessionMsg::Link(link)).await;
        }
    }

    /// Recurring idle sweep; never preempts an in-progress operation since
    /// eviction goes through the session's own inbox.
    pub async fn run_sweep(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.session_cfg.sweep_interval_secs));
        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    pub async fn sweep_once(&self) {
        let idle_cutoff = chrono::Utc::now().timestamp_millis()
            - (self.session_cfg.idle_timeout_secs * 1000) as i64;
        let entries: Vec<(SpaceId, SessionHandle)> = {
            let sessions = self.sessions.lock().await;
            sessions.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        for (space, handle) in entries {
            if handle.is_closed() {
                self.remove(space).await;
                continue;
            }
            let snapshot = handle.snapshot();
            match snapshot.state {
                PlayState::Stopped => self.remove(space).await,
                PlayState::Idle | PlayState::Ended if snapshot.last_activity_ms < idle_cutoff => {
                    info!("space {}: idle past threshold, stopping session", space);
                    let _ = handle.dispatch(ActionKind::Stop).await;
                    self.remove(space).await;
                }
                _ => {}
            }
        }
    }
}

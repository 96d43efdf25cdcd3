//! Presence publisher: keeps the single status display per space in step
//! with session state.
//!
//! Rendering is debounced with a trailing update. A burst of snapshot
//! changes produces at most one render per configured interval, and the
//! last render within a burst always reflects the state after the burst
//! settles. Each space gets its own lane task, so a slow surface write
//! never delays session processing, and no two writes to the same display
//! are ever in flight together. Tearing the session down deletes the
//! display exactly once.

use crate::error::EngineError;
use crate::EngineEvent;
use async_trait::async_trait;
use jockey_proto::protocol::{PlayState, SessionSnapshot};
use jockey_proto::track::{ChannelId, LoopMode, SpaceId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier of the mutable status message, assigned by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceId(pub u64);

/// Everything the status display shows. The engine hands this to the
/// surface as keys and raw values; final text is formatted bot-side.
#[derive(Debug, Clone, PartialEq, Hash)]
pub struct PresenceContent {
    pub state_key: &'static str,
    pub title: Option<String>,
    pub uri: Option<String>,
    pub artwork: Option<String>,
    pub requester: Option<u64>,
    pub position_secs: u64,
    pub duration_secs: Option<u64>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub queue_len: usize,
}

/// The single mutable message per space. Implemented by the bot process;
/// edits must be idempotent under retry.
#[async_trait]
pub trait PresenceSurface: Send + Sync {
    async fn create(
        &self,
        space: SpaceId,
        channel: ChannelId,
        content: &PresenceContent,
    ) -> anyhow::Result<SurfaceId>;

    async fn edit(
        &self,
        space: SpaceId,
        channel: ChannelId,
        id: SurfaceId,
        content: &PresenceContent,
    ) -> anyhow::Result<()>;

    async fn delete(&self, space: SpaceId, channel: ChannelId, id: SurfaceId)
        -> anyhow::Result<()>;
}

pub fn content_for(snapshot: &SessionSnapshot) -> PresenceContent {
    let state_key = match snapshot.state {
        PlayState::Idle | PlayState::Ended | PlayState::Stopped => "player.idle",
        PlayState::Loading => "player.loading",
        PlayState::Playing => "player.now_playing",
        PlayState::Paused => "player.paused",
    };
    PresenceContent {
        state_key,
        title: snapshot.current.as_ref().map(|t| t.title.clone()),
        uri: snapshot.current.as_ref().map(|t| t.uri.clone()),
        artwork: snapshot.current.as_ref().and_then(|t| t.artwork.clone()),
        requester: snapshot.current.as_ref().map(|t| t.requester.0),
        position_secs: snapshot.position_ms / 1000,
        duration_secs: snapshot
            .current
            .as_ref()
            .and_then(|t| t.duration_ms.map(|d| d / 1000)),
        volume: snapshot.volume,
        loop_mode: snapshot.loop_mode,
        shuffle: snapshot.shuffle,
        queue_len: snapshot.queue_len,
    }
}

fn content_hash(content: &PresenceContent) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Spawns the render lane for one space. The lane lives until the session's
/// cancel token fires or its snapshot channel closes.
pub fn spawn_lane(
    space: SpaceId,
    channel: ChannelId,
    surface: Arc<dyn PresenceSurface>,
    min_interval: Duration,
    rx: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    events: broadcast::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    let lane = Lane {
        space,
        channel,
        surface,
        min_interval,
        events,
        surface_id: None,
        last_hash: None,
        last_render: None,
    };
    tokio::spawn(lane.run(rx, cancel))
}

struct Lane {
    space: SpaceId,
    channel: ChannelId,
    surface: Arc<dyn PresenceSurface>,
    min_interval: Duration,
    events: broadcast::Sender<EngineEvent>,
    surface_id: Option<SurfaceId>,
    last_hash: Option<u64>,
    last_render: Option<Instant>,
}

impl Lane {
    async fn run(mut self, mut rx: watch::Receiver<SessionSnapshot>, cancel: CancellationToken) {
        // The session may have published before the lane started.
        let initial = rx.borrow_and_update().clone();
        self.render(&initial).await;

        'outer: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'outer,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break 'outer;
                    }
                }
            }
            let mut latest = rx.borrow_and_update().clone();

            match self.due_in() {
                None => self.render(&latest).await,
                Some(delay) => {
                    // Pending-render-scheduled: absorb further changes until
                    // the interval elapses, then render whatever is latest.
                    let deadline = Instant::now() + delay;
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'outer,
                            _ = tokio::time::sleep_until(deadline) => break,
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                latest = rx.borrow_and_update().clone();
                            }
                        }
                    }
                    self.render(&latest).await;
                }
            }
        }

        self.teardown().await;
    }

    /// None when a render is allowed right now; otherwise the time left
    /// until the minimum interval has passed.
    fn due_in(&self) -> Option<Duration> {
        let last = self.last_render?;
        let elapsed = last.elapsed();
        if elapsed >= self.min_interval {
            None
        } else {
            Some(self.min_interval - elapsed)
        }
    }

    async fn render(&mut self, snapshot: &SessionSnapshot) {
        if snapshot.state == PlayState::Stopped {
            return;
        }
        let content = content_for(snapshot);
        let hash = content_hash(&content);
        if self.last_hash == Some(hash) {
            return;
        }
        // The display appears the first time playback starts.
        let active = matches!(
            snapshot.state,
            PlayState::Loading | PlayState::Playing | PlayState::Paused
        );
        if self.surface_id.is_none() && !active {
            return;
        }

        let result = match self.surface_id {
            Some(id) => self.surface.edit(self.space, self.channel, id, &content).await,
            None => match self.surface.create(self.space, self.channel, &content).await {
                Ok(id) => {
                    self.surface_id = Some(id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                self.last_hash = Some(hash);
                self.last_render = Some(Instant::now());
            }
            Err(e) => {
                warn!("space {}: display render failed: {}", self.space, e);
                let _ = self.events.send(EngineEvent::Notice {
                    space: self.space,
                    notice: EngineError::Render(e.to_string()).notice(),
                });
                // Still throttled; the next change retries.
                self.last_render = Some(Instant::now());
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(id) = self.surface_id.take() {
            if let Err(e) = self.surface.delete(self.space, self.channel, id).await {
                debug!("space {}: display delete failed: {}", self.space, e);
            }
        }
    }
}

/// Logs renders instead of editing a real chat message. Stands in when the
/// bot process owns the actual display.
#[derive(Default)]
pub struct LogSurface {
    next_id: AtomicU64,
}

#[async_trait]
impl PresenceSurface for LogSurface {
    async fn create(
        &self,
        space: SpaceId,
        channel: ChannelId,
        content: &PresenceContent,
    ) -> anyhow::Result<SurfaceId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "space {}: display created in channel {} ({})",
            space, channel, content.state_key
        );
        Ok(SurfaceId(id))
    }

    async fn edit(
        &self,
        space: SpaceId,
        _channel: ChannelId,
        _id: SurfaceId,
        content: &PresenceContent,
    ) -> anyhow::Result<()> {
        info!(
            "space {}: display updated ({} {:?} at {}s)",
            space, content.state_key, content.title, content.position_secs
        );
        Ok(())
    }

    async fn delete(
        &self,
        space: SpaceId,
        _channel: ChannelId,
        _id: SurfaceId,
    ) -> anyhow::Result<()> {
        info!("space {}: display removed", space);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jockey_proto::track::{ActorId, Track};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSurface {
        renders: Mutex<Vec<(Instant, PresenceContent)>>,
        deletes: AtomicU64,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PresenceSurface for FakeSurface {
        async fn create(
            &self,
            _space: SpaceId,
            _channel: ChannelId,
            content: &PresenceContent,
        ) -> anyhow::Result<SurfaceId> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("surface gone");
            }
            self.renders
                .lock()
                .unwrap()
                .push((Instant::now(), content.clone()));
            Ok(SurfaceId(1))
        }

        async fn edit(
            &self,
            _space: SpaceId,
            _channel: ChannelId,
            _id: SurfaceId,
            content: &PresenceContent,
        ) -> anyhow::Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("surface gone");
            }
            self.renders
                .lock()
                .unwrap()
                .push((Instant::now(), content.clone()));
            Ok(())
        }

        async fn delete(
            &self,
            _space: SpaceId,
            _channel: ChannelId,
            _id: SurfaceId,
        ) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn playing_snapshot(rev: u64, position_ms: u64) -> SessionSnapshot {
        SessionSnapshot {
            rev,
            space: SpaceId(1),
            state: PlayState::Playing,
            current: Some(Track {
                id: "a".into(),
                title: "A".into(),
                uri: "https://example.com/a".into(),
                duration_ms: Some(300_000),
                requester: ActorId(1),
                artwork: None,
            }),
            position_ms,
            volume: 100,
            loop_mode: LoopMode::Off,
            shuffle: false,
            queue_len: 1,
            display_channel: Some(ChannelId(9)),
            last_activity_ms: 0,
        }
    }

    fn idle_snapshot(rev: u64) -> SessionSnapshot {
        SessionSnapshot {
            rev,
            space: SpaceId(1),
            state: PlayState::Idle,
            volume: 100,
            ..SessionSnapshot::default()
        }
    }

    struct Fixture {
        surface: Arc<FakeSurface>,
        tx: watch::Sender<SessionSnapshot>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start_lane(initial: SessionSnapshot, interval_ms: u64) -> Fixture {
        let surface = Arc::new(FakeSurface::default());
        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(16);
        let handle = spawn_lane(
            SpaceId(1),
            ChannelId(9),
            surface.clone(),
            Duration::from_millis(interval_ms),
            rx,
            cancel.clone(),
            events,
        );
        Fixture {
            surface,
            tx,
            cancel,
            handle,
        }
    }

    async fn wait_renders(surface: &FakeSurface, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if surface.renders.lock().unwrap().len() >= at_least {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("renders did not arrive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_trailing_render() {
        let f = start_lane(playing_snapshot(1, 0), 1000);
        wait_renders(&f.surface, 1).await;

        // A burst of rapid position changes within one interval.
        for (rev, pos) in [(2, 1000u64), (3, 2000), (4, 3000)] {
            f.tx.send(playing_snapshot(rev, pos)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        wait_renders(&f.surface, 2).await;
        let renders = f.surface.renders.lock().unwrap();
        assert_eq!(renders.len(), 2);
        // The trailing render reflects the final state of the burst.
        assert_eq!(renders[1].1.position_secs, 3);
        // And at least the minimum interval separates the two.
        let gap = renders[1].0.duration_since(renders[0].0);
        assert!(gap >= Duration::from_millis(1000), "gap was {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_not_rerendered() {
        let f = start_lane(playing_snapshot(1, 0), 50);
        wait_renders(&f.surface, 1).await;

        // rev changes, content does not.
        f.tx.send(playing_snapshot(2, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.surface.renders.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_display_until_playback() {
        let f = start_lane(idle_snapshot(1), 50);
        f.tx.send(idle_snapshot(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.surface.renders.lock().unwrap().is_empty());

        f.tx.send(playing_snapshot(3, 0)).unwrap();
        wait_renders(&f.surface, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deletes_display_exactly_once() {
        let f = start_lane(playing_snapshot(1, 0), 50);
        wait_renders(&f.surface, 1).await;

        f.cancel.cancel();
        f.handle.await.unwrap();
        assert_eq!(f.surface.deletes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_display_deletes_nothing() {
        let f = start_lane(idle_snapshot(1), 50);
        f.cancel.cancel();
        f.handle.await.unwrap();
        assert_eq!(f.surface.deletes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_reported_not_fatal() {
        let f = start_lane(playing_snapshot(1, 0), 50);
        wait_renders(&f.surface, 1).await;

        f.surface.fail.store(true, Ordering::Relaxed);
        f.tx.send(playing_snapshot(2, 60_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Lane survives and renders again once the surface recovers.
        f.surface.fail.store(false, Ordering::Relaxed);
        f.tx.send(playing_snapshot(3, 120_000)).unwrap();
        wait_renders(&f.surface, 2).await;
        let renders = f.surface.renders.lock().unwrap();
        assert_eq!(renders.last().unwrap().1.position_secs, 120);
    }
}

use async_trait::async_trait;
use jockey_proto::track::{SpaceId, Track};
use tracing::debug;

/// Listen-reporting side channel. Both calls are fire-and-forget: the
/// session spawns them and failures are logged, never surfaced into
/// playback.
#[async_trait]
pub trait ScrobbleSink: Send + Sync {
    async fn now_playing(&self, space: SpaceId, track: &Track);
    async fn scrobble(&self, space: SpaceId, track: &Track, started_at: i64);
}

pub struct NullScrobbleSink;

#[async_trait]
impl ScrobbleSink for NullScrobbleSink {
    async fn now_playing(&self, _space: SpaceId, _track: &Track) {}
    async fn scrobble(&self, _space: SpaceId, _track: &Track, _started_at: i64) {}
}

/// POSTs listen notifications as JSON to a configured webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn post(&self, payload: serde_json::Value) {
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            debug!("scrobble webhook failed: {}", e);
        }
    }
}

#[async_trait]
impl ScrobbleSink for WebhookSink {
    async fn now_playing(&self, space: SpaceId, track: &Track) {
        self.post(serde_json::json!({
            "kind": "now_playing",
            "space": space.0,
            "track": track,
        }))
        .await;
    }

    async fn scrobble(&self, space: SpaceId, track: &Track, started_at: i64) {
        self.post(serde_json::json!({
            "kind": "scrobble",
            "space": space.0,
            "track": track,
            "started_at": started_at,
        }))
        .await;
    }
}

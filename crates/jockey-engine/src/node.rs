//! Audio node channel.
//!
//! Architecture:
//!
//! ```text
//!   NodeClient::connect()
//!         │
//!         └── supervisor task  ← (re)dials the node endpoint with backoff
//!               ├── writes NodeRequest frames (JSON lines) to the socket
//!               └── reader_task ← reads JSON lines, emits NodeSignal::Event
//! ```
//!
//! Commands are fire-and-forget: success or failure surfaces later as an
//! event. While the link is down, submitted commands are dropped — no
//! command history is kept; each session re-issues its current track after
//! reconnect. The supervisor redials with capped exponential backoff and
//! brackets every connection with `LinkUp`/`LinkDown` signals.

use jockey_proto::config::NodeConfig;
use jockey_proto::protocol::{NodeCommand, NodeEvent, NodeRequest};
use jockey_proto::track::SpaceId;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Connection-level signals and demultiplexable node events, in arrival
/// order. Consumed by the registry, which routes events to session inboxes.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSignal {
    Event(NodeEvent),
    LinkUp,
    LinkDown,
}

/// Cheaply cloneable handle to the node channel.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeRequest>,
}

impl NodeHandle {
    /// Handle plus its receiving end. The supervisor consumes the receiver;
    /// tests consume it directly to observe submitted commands.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NodeRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fire-and-forget submission. Dropped silently when the client is gone;
    /// recovery is the session's responsibility.
    pub async fn submit(&self, space: SpaceId, generation: u64, command: NodeCommand) {
        let req = NodeRequest {
            space,
            generation,
            command,
        };
        if self.tx.send(req).await.is_err() {
            debug!("node client gone; dropping command");
        }
    }
}

pub struct NodeClient;

impl NodeClient {
    /// Spawns the connection supervisor. Signals (events, link up/down)
    /// arrive on `signal_tx`; the returned handle submits commands.
    pub fn connect(cfg: NodeConfig, signal_tx: mpsc::Sender<NodeSignal>) -> NodeHandle {
        let (handle, cmd_rx) = NodeHandle::channel(64);
        tokio::spawn(supervisor(cfg, cmd_rx, signal_tx));
        handle
    }
}

async fn supervisor(
    cfg: NodeConfig,
    mut cmd_rx: mpsc::Receiver<NodeRequest>,
    signal_tx: mpsc::Sender<NodeSignal>,
) {
    let mut backoff_ms = cfg.reconnect_initial_ms;
    loop {
        match TcpStream::connect(&cfg.endpoint).await {
            Ok(stream) => {
                info!("node: connected to {}", cfg.endpoint);
                backoff_ms = cfg.reconnect_initial_ms;
                if signal_tx.send(NodeSignal::LinkUp).await.is_err() {
                    return;
                }
                if let Err(e) = run_link(stream, &mut cmd_rx, &signal_tx).await {
                    warn!("node: link lost: {}", e);
                }
                if signal_tx.send(NodeSignal::LinkDown).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("node: connect to {} failed: {}", cfg.endpoint, e);
            }
        }

        // Commands submitted while down are dropped, not buffered.
        while cmd_rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(cfg.reconnect_max_ms);
    }
}

/// Drives one connection until either side fails.
async fn run_link(
    stream: TcpStream,
    cmd_rx: &mut mpsc::Receiver<NodeRequest>,
    signal_tx: &mpsc::Sender<NodeSignal>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    let (done_tx, mut done_rx) = oneshot::channel();
    let reader = tokio::spawn(reader_task(read_half, signal_tx.clone(), done_tx));

    let result = loop {
        tokio::select! {
            req = cmd_rx.recv() => {
                let Some(req) = req else {
                    break Err(anyhow::anyhow!("command channel closed"));
                };
                let mut raw = match serde_json::to_string(&req) {
                    Ok(raw) => raw,
                    Err(e) => break Err(anyhow::anyhow!("unserializable request: {}", e)),
                };
                raw.push('\n');
                debug!("node: send space={} gen={} {}", req.space, req.generation, raw.trim());
                if let Err(e) = write_half.write_all(raw.as_bytes()).await {
                    break Err(anyhow::anyhow!("write error: {}", e));
                }
            }
            _ = &mut done_rx => {
                break Err(anyhow::anyhow!("read side closed"));
            }
        }
    };

    reader.abort();
    result
}

async fn reader_task(
    read_half: OwnedReadHalf,
    signal_tx: mpsc::Sender<NodeSignal>,
    done_tx: oneshot::Sender<()>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("node reader: connection closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<NodeEvent>(trimmed) {
                    Ok(event) => {
                        if signal_tx.send(NodeSignal::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("node reader: invalid event '{}': {}", trimmed, e);
                    }
                }
            }
            Err(e) => {
                warn!("node reader: read error: {}", e);
                break;
            }
        }
    }
    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use jockey_proto::protocol::NodeEventKind;
    use tokio::net::TcpListener;

    fn test_cfg(port: u16) -> NodeConfig {
        NodeConfig {
            endpoint: format!("127.0.0.1:{port}"),
            reconnect_initial_ms: 10,
            reconnect_max_ms: 40,
        }
    }

    #[tokio::test]
    async fn test_submit_reaches_node_and_events_flow_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (signal_tx, mut signal_rx) = mpsc::channel(16);
        let handle = NodeClient::connect(test_cfg(port), signal_tx);

        let (stream, _) = listener.accept().await.unwrap();
        assert_eq!(signal_rx.recv().await, Some(NodeSignal::LinkUp));

        handle
            .submit(SpaceId(3), 1, NodeCommand::Pause)
            .await;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let req: NodeRequest = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(req.space, SpaceId(3));
        assert_eq!(req.generation, 1);
        assert_eq!(req.command, NodeCommand::Pause);

        let event = NodeEvent {
            space: SpaceId(3),
            generation: 1,
            kind: NodeEventKind::TrackStarted,
        };
        let mut raw = serde_json::to_string(&event).unwrap();
        raw.push('\n');
        write_half.write_all(raw.as_bytes()).await.unwrap();

        assert_eq!(signal_rx.recv().await, Some(NodeSignal::Event(event)));
    }

    #[tokio::test]
    async fn test_reconnect_after_node_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (signal_tx, mut signal_rx) = mpsc::channel(16);
        let _handle = NodeClient::connect(test_cfg(port), signal_tx);

        let (stream, _) = listener.accept().await.unwrap();
        assert_eq!(signal_rx.recv().await, Some(NodeSignal::LinkUp));

        drop(stream);
        assert_eq!(signal_rx.recv().await, Some(NodeSignal::LinkDown));

        // Supervisor redials; the channel is restartable without state loss.
        let _ = listener.accept().await.unwrap();
        assert_eq!(signal_rx.recv().await, Some(NodeSignal::LinkUp));
    }
}

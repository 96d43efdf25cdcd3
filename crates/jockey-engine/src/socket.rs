//! TCP control socket: the bot process sends normalized control actions and
//! receives acks, session snapshots, and notices as length-prefixed JSON
//! frames.

use crate::router::Router;
use crate::EngineEvent;
use jockey_proto::protocol::{ClientMessage, Message, ServerMessage, PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    router: Arc<Router>,
    events: broadcast::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind control socket {}: {}", addr, e);
                return;
            }
        };
        info!("Control socket listening at {}", addr);
        serve(listener, router, events).await;
    })
}

pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut client_id = 0usize;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let router = router.clone();
                let events_rx = events.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, router, id, events_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    router: Arc<Router>,
    client_id: usize,
    mut events_rx: broadcast::Receiver<EngineEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = Message::Server(ServerMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
    });
    if let Ok(encoded) = hello.encode() {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Client(ClientMessage::Action { action }), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!(
                                        "Client {} sent {} for space {}",
                                        client_id,
                                        action.kind.name(),
                                        action.space
                                    );

                                    let ack = match router.dispatch(action).await {
                                        Ok(notice) => ServerMessage::Ack { ok: true, notice },
                                        Err(e) => {
                                            debug!("Client {} action rejected: {}", client_id, e);
                                            ServerMessage::Ack { ok: false, notice: e.notice() }
                                        }
                                    };
                                    if let Ok(encoded) = Message::Server(ack).encode() {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            event = events_rx.recv() => {
                match event {
                    Ok(EngineEvent::Snapshot(data)) => {
                        if let Ok(encoded) = Message::Server(ServerMessage::Snapshot { data }).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(EngineEvent::Notice { space, notice }) => {
                        if let Ok(encoded) = Message::Server(ServerMessage::Notice { space, notice }).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} engine events", client_id, n);
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeHandle;
    use crate::prefs::NullPrefStore;
    use crate::presence::LogSurface;
    use crate::registry::Registry;
    use crate::scrobble::NullScrobbleSink;
    use jockey_proto::config::{PresenceConfig, SessionConfig};
    use jockey_proto::protocol::{ActionKind, ControlAction};
    use jockey_proto::track::{Actor, ActorId, Role, SpaceId, Track};
    use std::time::Duration;

    async fn read_message(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Message {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(buf) {
                buf.drain(..consumed);
                return msg;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut tmp))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "server closed connection");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn test_client_action_roundtrip() {
        let (node, _node_rx) = NodeHandle::channel(32);
        let (events, _keep) = broadcast::channel(64);
        let registry = Registry::new(
            SessionConfig::default(),
            PresenceConfig::default(),
            node,
            std::sync::Arc::new(NullPrefStore),
            std::sync::Arc::new(NullScrobbleSink),
            std::sync::Arc::new(LogSurface::default()),
            events.clone(),
        );
        let router = Arc::new(Router::new(registry));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, router, events));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();

        match read_message(&mut stream, &mut buf).await {
            Message::Server(ServerMessage::Hello { protocol_version }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected hello, got {other:?}"),
        }

        let action = ControlAction {
            space: SpaceId(1),
            actor: Actor {
                id: ActorId(7),
                role: Role::Listener,
            },
            display_channel: None,
            kind: ActionKind::Enqueue {
                track: Track {
                    id: "a".into(),
                    title: "A".into(),
                    uri: "https://example.com/a".into(),
                    duration_ms: None,
                    requester: ActorId(7),
                    artwork: None,
                },
            },
        };
        let frame = Message::Client(ClientMessage::Action { action })
            .encode()
            .unwrap();
        stream.write_all(&frame).await.unwrap();

        // The ack and the snapshot push both arrive; order between them is
        // not fixed.
        let mut saw_ack = false;
        let mut saw_snapshot = false;
        while !(saw_ack && saw_snapshot) {
            match read_message(&mut stream, &mut buf).await {
                Message::Server(ServerMessage::Ack { ok, notice }) => {
                    assert!(ok);
                    assert_eq!(notice.key, "queue.added");
                    saw_ack = true;
                }
                Message::Server(ServerMessage::Snapshot { data }) => {
                    if data.queue_len == 1 {
                        assert_eq!(data.space, SpaceId(1));
                        saw_snapshot = true;
                    }
                }
                _ => {}
            }
        }
    }
}

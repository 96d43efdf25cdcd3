use jockey_engine::node::NodeClient;
use jockey_engine::prefs::{FilePrefStore, PrefStore};
use jockey_engine::presence::{LogSurface, PresenceSurface};
use jockey_engine::registry::Registry;
use jockey_engine::router::Router;
use jockey_engine::scrobble::{NullScrobbleSink, ScrobbleSink, WebhookSink};
use jockey_engine::{socket, EngineEvent};
use jockey_proto::config::Config;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = jockey_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("engine.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,jockey_engine=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Engine-wide event fanout for connected bot processes.
    let (events_tx, _) = broadcast::channel::<EngineEvent>(256);

    // All node signals funnel through one channel into the registry.
    let (signal_tx, signal_rx) = mpsc::channel(256);
    let node = NodeClient::connect(config.node.clone(), signal_tx);

    let prefs: Arc<dyn PrefStore> = Arc::new(FilePrefStore::open(data_dir.join("prefs.json")));
    let scrobble: Arc<dyn ScrobbleSink> =
        if config.scrobble.enabled && !config.scrobble.webhook_url.is_empty() {
            Arc::new(WebhookSink::new(config.scrobble.webhook_url.clone()))
        } else {
            Arc::new(NullScrobbleSink)
        };
    let surface: Arc<dyn PresenceSurface> = Arc::new(LogSurface::default());

    let registry = Registry::new(
        config.session.clone(),
        config.presence.clone(),
        node,
        prefs,
        scrobble,
        surface,
        events_tx.clone(),
    );

    tokio::spawn(registry.clone().route_node_signals(signal_rx));
    tokio::spawn(registry.clone().run_sweep());

    let router = Arc::new(Router::new(registry));

    info!("Engine initialised");

    if config.socket.enabled {
        let server = socket::start_server(
            config.socket.bind_address.clone(),
            config.socket.port,
            router,
            events_tx.clone(),
        );
        server.await?;
    } else {
        std::future::pending::<()>().await;
    }

    Ok(())
}

use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::OnceCell;

use widgetd_core::buffer::{Broker, BufferProvider};
use widgetd_core::config::Config;
use widgetd_core::direct::DirectRegistry;
use widgetd_core::engine::Engine;
use widgetd_core::protocol;
use widgetd_core::so_handler::SoHandler;
use widgetd_core::transport::{Connection, ConnectionEvents};
use widgetd_core::update_monitor::UpdateMonitor;

/// Exits the process once the master drops us, per spec.md §4.6 — a slave
/// has no life beyond its one master connection.
struct MasterEvents {
    engine: Arc<Engine>,
}

impl ConnectionEvents for MasterEvents {
    fn disconnected(&self) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.disconnect().await;
            std::process::exit(0);
        });
    }
}

#[tokio::main]
async fn main() {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().compact().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").compact().init();
    }

    let so_handler = Arc::new(SoHandler::new(Config::with(|c| c.disable_call_option)));
    // A secured slave doesn't self-broker its buffers' backing resources; it
    // asks the (not-yet-connected) master instead. `master_cell` is filled in
    // once that connection is actually accepted below.
    let master_cell: Arc<OnceCell<Arc<Connection>>> = Arc::new(OnceCell::new());
    let broker = if Config::with(|c| c.secured) { Broker::Remote(master_cell.clone()) } else { Broker::Local };
    let buffers = Arc::new(BufferProvider::new(broker, Config::with(|c| c.extra_buffer_slots)));
    let monitor = Arc::new(UpdateMonitor::new());
    let direct = Arc::new(DirectRegistry::new());

    let image_path = Config::with(|c| c.image_path.clone());
    match widgetd_core::update_monitor::watch_directory(image_path.clone()) {
        Ok((watcher, mut events)) => {
            let monitor_for_watch = monitor.clone();
            tokio::spawn(async move {
                // Keep the watcher alive for the lifetime of this task.
                let _watcher = watcher;
                while let Some(event) = events.recv().await {
                    monitor_for_watch.dispatch(event).await;
                }
            });
        }
        Err(err) => tracing::error!(%err, path = %image_path.display(), "failed to watch image directory"),
    }

    let (engine, outbound_rx) = Engine::new(so_handler, buffers, monitor, direct.clone());

    let master_path = Config::with(|c| c.master_socket_path.clone());
    let _ = std::fs::remove_file(&master_path);
    let listener = match UnixListener::bind(&master_path) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, path = %master_path.display(), "failed to bind master socket");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %master_path.display(), "widgetd listening");

    let dispatch = Arc::new(protocol::build_dispatch_table(engine.clone()));

    let (stream, _addr) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::error!(%err, "failed to accept master connection");
            std::process::exit(1);
        }
    };
    let master = Connection::spawn(stream, dispatch, Arc::new(MasterEvents { engine: engine.clone() }));
    let _ = master_cell.set(master.clone());

    tokio::spawn(protocol::run_outbound(outbound_rx, direct, master.clone()));
    tokio::spawn(protocol::run_ping_timer(master));

    // A slave serves exactly one master connection for its whole lifetime
    // (spec.md §4.6); once it drops, tear every instance down and exit.
    std::future::pending::<()>().await;
}

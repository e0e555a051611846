// Relay host. Serves the coordination relay over websockets
//
// `/ws` upgrades to a relay socket, `/health` reports relay statistics.
// All routing decisions live in `peerlink_core::RelayServer`; this module
// only moves frames between warp sockets and the relay.

use futures::{SinkExt, StreamExt};
use peerlink_core::relay::RelayServerStats;
use peerlink_core::RelayServer;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use warp::Filter;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    relay: RelayServerStats,
}

/// Build the relay routes
pub fn routes(
    relay: Arc<RelayServer>,
    start_time: Instant,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let relay_filter = warp::any().map({
        let relay = relay.clone();
        move || relay.clone()
    });

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(relay_filter.clone())
        .map(|ws: warp::ws::Ws, relay: Arc<RelayServer>| {
            ws.on_upgrade(move |socket| handle_connection(socket, relay))
        });

    let health_route = warp::path("health")
        .and(warp::get())
        .and(relay_filter)
        .and_then(move |relay: Arc<RelayServer>| handle_health(relay, start_time));

    ws_route.or(health_route).with(warp::cors().allow_any_origin())
}

/// Serve the relay until the process exits
pub async fn run(addr: SocketAddr) {
    let relay = Arc::new(RelayServer::new());
    info!(%addr, "Relay listening");
    warp::serve(routes(relay, Instant::now())).run(addr).await;
}

fn health(relay: &RelayServer, start_time: Instant) -> HealthResponse {
    HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: start_time.elapsed().as_secs(),
        relay: relay.get_stats(),
    }
}

async fn handle_health(
    relay: Arc<RelayServer>,
    start_time: Instant,
) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&health(&relay, start_time)))
}

async fn handle_connection(ws: warp::ws::WebSocket, relay: Arc<RelayServer>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (conn, mut outbound) = match relay.connect() {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Refusing relay socket: {}", e);
            let _ = ws_tx.send(warp::ws::Message::close()).await;
            return;
        }
    };

    // Relay -> socket
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode relay frame: {}", e);
                    continue;
                }
            };
            if ws_tx.send(warp::ws::Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    // Socket -> relay
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    relay.handle_text(conn, text);
                } else if msg.is_close() {
                    break;
                } else if msg.is_binary() {
                    relay.reject_frame(conn, "binary frames are not supported");
                }
            }
            Err(e) => {
                debug!(connection = conn, "Relay socket error: {}", e);
                break;
            }
        }
    }

    relay.disconnect(conn);
    forward_task.abort();
}

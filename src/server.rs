//! HTTP/WebSocket surface: the `/cdp` and `/extension` upgrade endpoints,
//! the status route, per-socket reader/writer loops and keepalive.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth;
use crate::error::RelayError;
use crate::registry::{Outbound, Outbox, QueueGauge};
use crate::relay::{ExtInbound, Relay};

/// A relay bound to its listen socket but not yet serving. Splitting bind
/// from serve keeps bind failures synchronous (exit code 2) and lets
/// tests bind port 0 and read the ephemeral address.
pub struct RelayServer {
    relay: Arc<Relay>,
    listener: TcpListener,
    addr: SocketAddr,
}

impl RelayServer {
    pub async fn bind(relay: Arc<Relay>) -> Result<Self, RelayError> {
        let cfg = relay.config();
        let ip: IpAddr = cfg
            .host
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid host address: {}", cfg.host)))?;
        let addr = SocketAddr::new(ip, cfg.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let addr = listener.local_addr()?;
        Ok(Self {
            relay,
            listener,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Serve until [`Relay::shutdown`] is invoked. Connections get the
    /// configured grace window to flush their close frames; stragglers
    /// are torn down with the server.
    pub async fn serve(self) -> Result<(), RelayError> {
        let Self {
            relay,
            listener,
            addr,
        } = self;
        info!(target: "relay", %addr, "listening");

        let app = router(relay.clone());
        let grace = Duration::from_millis(relay.config().shutdown_grace_ms);

        let mut graceful_rx = relay.shutdown_rx();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            if !*graceful_rx.borrow() {
                let _ = graceful_rx.changed().await;
            }
        });

        let mut force_rx = relay.shutdown_rx();
        tokio::select! {
            result = server => result.map_err(RelayError::Io),
            _ = async {
                if !*force_rx.borrow() {
                    let _ = force_rx.changed().await;
                }
                sleep(grace).await;
            } => {
                info!(target: "relay", "grace window elapsed, terminating stragglers");
                Ok(())
            }
        }
    }
}

fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/cdp", get(cdp_upgrade))
        .route("/extension", get(extension_upgrade))
        .route("/extension/status", any(status))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(relay)
}

#[derive(Deserialize)]
struct CdpQuery {
    token: Option<String>,
}

async fn cdp_upgrade(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<CdpQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if relay.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Err(rejection) =
        auth::check_client_token(relay.config().token.as_deref(), query.token.as_deref())
    {
        warn!(
            target: "relay",
            category = rejection.category(),
            %remote,
            "client upgrade rejected"
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| client_socket(relay, socket, remote.to_string()))
}

async fn extension_upgrade(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if relay.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let extension_id =
        match auth::check_extension_origin(&relay.config().extension_ids, origin) {
            Ok(id) => id.to_string(),
            Err(rejection) => {
                warn!(
                    target: "relay",
                    category = rejection.category(),
                    %remote,
                    "extension upgrade rejected"
                );
                return StatusCode::FORBIDDEN.into_response();
            }
        };
    ws.on_upgrade(move |socket| extension_socket(relay, socket, extension_id))
}

async fn status(State(relay): State<Arc<Relay>>, method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(relay.status()),
    )
        .into_response()
}

/// Drain a connection's outbound channel into its sink. Exits when the
/// channel closes or a close frame goes out.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    gauge: QueueGauge,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(text) => {
                let bytes = text.len();
                let result = sink.send(Message::Text(text)).await;
                gauge.mark_sent(bytes);
                if result.is_err() {
                    break;
                }
            }
            Outbound::Ping => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn client_socket(relay: Arc<Relay>, socket: WebSocket, remote: String) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let outbox = Outbox::new(tx);
    let writer = tokio::spawn(write_loop(sink, rx, outbox.gauge()));

    let client = relay.admit_client(outbox.clone(), remote);
    // A connection that slipped in as shutdown began missed the broadcast
    // close; give it one directly.
    if relay.is_shutting_down() {
        outbox.push_close(1001, "shutting down");
    }
    client_read_loop(&relay, client, stream, &outbox).await;
    relay.client_closed(client);
    drop(outbox);

    let grace = Duration::from_millis(relay.config().shutdown_grace_ms);
    let _ = timeout(grace, writer).await;
}

async fn client_read_loop(
    relay: &Relay,
    client: u64,
    mut stream: SplitStream<WebSocket>,
    outbox: &Outbox,
) {
    let ping_every = Duration::from_millis(relay.config().ping_interval_ms);
    let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = relay.shutdown_rx();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    relay.handle_client_frame(client, &text);
                }
                Some(Ok(Message::Binary(_))) => {
                    // CDP is text-only; binary frames from clients are
                    // dropped without closing the connection.
                    debug!(target: "relay-ws", client, "dropping binary client frame");
                }
                Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(target: "relay-ws", client, %err, "client socket error");
                    break;
                }
            },
            _ = ticker.tick() => {
                if last_seen.elapsed() > ping_every * 2 {
                    warn!(target: "relay-ws", client, "client unresponsive, dropping");
                    break;
                }
                outbox.push_ping();
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn extension_socket(relay: Arc<Relay>, socket: WebSocket, extension_id: String) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let outbox = Outbox::new(tx);
    let writer = tokio::spawn(write_loop(sink, rx, outbox.gauge()));

    let epoch = relay.admit_extension(extension_id, outbox.clone());
    if relay.is_shutting_down() {
        outbox.push_close(1001, "shutting down");
    }
    extension_read_loop(&relay, epoch, stream, &outbox).await;
    relay.extension_closed(epoch);
    drop(outbox);

    let grace = Duration::from_millis(relay.config().shutdown_grace_ms);
    let _ = timeout(grace, writer).await;
}

async fn extension_read_loop(
    relay: &Relay,
    epoch: u64,
    mut stream: SplitStream<WebSocket>,
    outbox: &Outbox,
) {
    let ping_every = Duration::from_millis(relay.config().ping_interval_ms);
    let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = relay.shutdown_rx();
    let mut last_seen = Instant::now();

    // The extension must announce itself promptly or be treated as
    // unresponsive.
    let handshake = sleep(Duration::from_millis(relay.config().handshake_timeout_ms));
    tokio::pin!(handshake);
    let mut awaiting_first_frame = true;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    awaiting_first_frame = false;
                    match relay.handle_extension_frame(epoch, &text) {
                        ExtInbound::Routine
                        | ExtInbound::Pong
                        | ExtInbound::Handshake => {}
                        ExtInbound::ProtocolViolation => {
                            warn!(target: "relay-ws", epoch, "extension protocol violation");
                            outbox.push_close(1002, "protocol error");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    // The producer is trusted and text-only; a binary
                    // frame is a programming error on its side.
                    warn!(target: "relay-ws", epoch, "binary frame from extension");
                    outbox.push_close(1002, "protocol error");
                    break;
                }
                Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(target: "relay-ws", epoch, %err, "extension socket error");
                    break;
                }
            },
            _ = &mut handshake, if awaiting_first_frame => {
                warn!(target: "relay-ws", epoch, "extension handshake timeout");
                outbox.push_close(1008, "handshake timeout");
                break;
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > ping_every * 2 {
                    warn!(target: "relay-ws", epoch, "extension unresponsive, dropping");
                    break;
                }
                outbox.push_ping();
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Background task resolving expired commands, one per served relay.
pub fn spawn_timeout_sweep(relay: Arc<Relay>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = relay.shutdown_rx();
        loop {
            tokio::select! {
                _ = ticker.tick() => relay.sweep_expired(),
                _ = shutdown.changed() => break,
            }
        }
    })
}

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use aetherport_mux::Session as MuxSession;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use crypto_box::SecretKey;
use tracing::{debug, info, warn};

use crate::{
    beacon::{beacon_mux_config, open_token, parse_http_date, skew_ok, WsByteStream},
    relay::relay,
};

/// How long a bridged egress may hold its relay; signalling completes well
/// within this.
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(60);

struct BeaconState {
    secret: SecretKey,
    ingresses: Mutex<HashMap<String, Arc<MuxSession>>>,
}

/// The rendezvous relay.
///
/// `GET /public-key` hands out the beacon's session public key. `GET
/// /ingresses/{id}` upgrades to a WebSocket: with a valid `x-token` header it
/// registers the master (the ingress) under `id`, without one it bridges the
/// caller (an egress) to the registered master over one multiplexer stream.
pub struct BeaconServer {
    state: Arc<BeaconState>,
}

impl BeaconServer {
    pub fn new() -> Self {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        Self {
            state: Arc::new(BeaconState {
                secret,
                ingresses: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/public-key", get(public_key))
            .route("/ingresses/:id", get(attach))
            .with_state(Arc::clone(&self.state))
    }

    pub async fn serve(&self, listener: tokio::net::TcpListener) -> io::Result<()> {
        info!("beacon listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await
    }
}

impl Default for BeaconServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn public_key(State(state): State<Arc<BeaconState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        state.secret.public_key().as_bytes().to_vec(),
    )
}

async fn attach(
    State(state): State<Arc<BeaconState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let is_master = headers.contains_key("x-token");
    if is_master {
        if let Err(status) = authorize_master(&state.secret, &id, &headers, Utc::now()) {
            warn!("beacon: master authentication for '{id}' failed");
            return status.into_response();
        }
    }

    let registered = state.ingresses.lock().unwrap().contains_key(&id);
    if is_master && registered {
        warn!("beacon: ingress '{id}' exists");
        return StatusCode::CONFLICT.into_response();
    }
    if !is_master && !registered {
        warn!("beacon: ingress '{id}' not found");
        return StatusCode::NOT_FOUND.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(state, id, is_master, socket))
}

/// Checks the registration token: the `id` must be the base58 public key the
/// token was sealed with, and the `date` header must be fresh since it seeds
/// the box nonce.
fn authorize_master(secret: &SecretKey, id: &str, headers: &HeaderMap, now: DateTime<Utc>) -> Result<(), StatusCode> {
    let decoded = bs58::decode(id).into_vec().map_err(|_| StatusCode::UNAUTHORIZED)?;
    let public: [u8; 32] = decoded.try_into().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let date = headers
        .get("date")
        .or_else(|| headers.get("x-date"))
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !skew_ok(now, date) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let token = headers
        .get("x-token")
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    match open_token(secret, &public, date, token) {
        true => Ok(()),
        false => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn handle_socket(state: Arc<BeaconState>, id: String, is_master: bool, socket: WebSocket) {
    let conn = WsByteStream::new(socket);

    match is_master {
        true => {
            let session = Arc::new(MuxSession::client(conn, beacon_mux_config()));
            {
                let mut ingresses = state.ingresses.lock().unwrap();
                if ingresses.contains_key(&id) {
                    // Raced another master between the status check and here.
                    session.close();
                    return;
                }
                ingresses.insert(id.clone(), Arc::clone(&session));
            }
            info!("beacon: ingress '{id}' registered");

            session.closed().await;

            let mut ingresses = state.ingresses.lock().unwrap();
            if let Some(current) = ingresses.get(&id) {
                if Arc::ptr_eq(current, &session) {
                    ingresses.remove(&id);
                }
            }
            info!("beacon: ingress '{id}' has been disconnected");
        }
        false => {
            let session = state.ingresses.lock().unwrap().get(&id).cloned();
            let session = match session {
                Some(session) => session,
                None => return,
            };

            let stream = match session.open_stream().await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!("beacon: opening a bridge to '{id}' failed: {error}");
                    return;
                }
            };

            match tokio::time::timeout(BRIDGE_TIMEOUT, relay(conn, stream)).await {
                Err(_) => debug!("beacon: bridge to '{id}' timed out"),
                Ok(Err(error)) => debug!("beacon: bridge to '{id}' ended with error: {error}"),
                Ok(Ok(_)) => debug!("beacon: bridge to '{id}' closed"),
            }
        }
    }
}

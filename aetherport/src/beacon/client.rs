use std::sync::Arc;

use aetherport_identity::Identity;
use aetherport_mux::Session as MuxSession;
use chrono::Utc;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    beacon::{beacon_mux_config, format_http_date, seal_token, WsByteStream},
    messenger::{ChunkedMessenger, NoiseMessenger},
    peer::PeerTransport,
    proxy::{EgressProxy, IngressProxy},
    signal::SignalMessenger,
    Endpoint, EndpointAuthorizer, Error,
};

/// Fetches the beacon's X25519 public key.
pub async fn fetch_public_key(base_url: &str) -> Result<[u8; 32], Error> {
    let url = format!("{}/public-key", base_url.trim_end_matches('/'));
    let body = reqwest::get(&url)
        .await
        .map_err(|error| Error::Signal(format!("fetching the beacon public key failed: {error}")))?
        .bytes()
        .await
        .map_err(|error| Error::Signal(format!("reading the beacon public key failed: {error}")))?;

    body.as_ref()
        .try_into()
        .map_err(|_| Error::Signal(format!("beacon returned a {}-byte public key", body.len())))
}

/// Registers with the beacon as the master for this identity and serves one
/// ingress session per bridged egress.
///
/// The ingress is the handshake initiator on every bridged connection: it
/// knows which CA signed its certificate, so it can lead with the right
/// pre-shared key.
pub async fn run_beacon_ingress(
    base_url: &str,
    identity: Arc<Identity>,
    authorizer: EndpointAuthorizer,
    ice_servers: Vec<String>,
    token: CancellationToken,
) -> Result<(), Error> {
    let beacon_public = fetch_public_key(base_url).await?;
    let date = Utc::now();
    let sealed = seal_token(identity.private_key(), &beacon_public, date)?;
    let ingress_id = bs58::encode(&identity.certificate().details.public_key).into_string();

    let url = format!("{}/ingresses/{ingress_id}", ws_url(base_url));
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|error| Error::ConfigInvalid(format!("invalid beacon url ({url}): {error}")))?;
    request.headers_mut().insert(
        "date",
        HeaderValue::from_str(&format_http_date(date)).map_err(|error| Error::Signal(error.to_string()))?,
    );
    request
        .headers_mut()
        .insert("x-token", HeaderValue::from_str(&sealed).map_err(|error| Error::Signal(error.to_string()))?);

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|error| Error::Signal(format!("websocket connection to the beacon failed: {error}")))?;
    info!("registered with the beacon at {url}");

    let session = MuxSession::server(WsByteStream::new(ws), beacon_mux_config());
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            stream = session.accept_stream() => match stream {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };

        debug!("beacon bridged a new egress");
        let identity = Arc::clone(&identity);
        let authorizer = authorizer.clone();
        let ice_servers = ice_servers.clone();
        let child = token.child_token();
        tokio::spawn(async move {
            let messenger = match NoiseMessenger::initiate(ChunkedMessenger::new(stream), &identity).await {
                Ok(messenger) => messenger,
                Err(error) => {
                    warn!("ingress: peer handshake failed: {error}");
                    return;
                }
            };
            debug!("ingress: peer authenticated: {}", messenger.peer_certificate().details.name);

            let peer = match PeerTransport::new(&ice_servers).await {
                Ok(peer) => peer,
                Err(error) => {
                    warn!("ingress: create peer connection failed: {error}");
                    return;
                }
            };

            let proxy = IngressProxy::new(SignalMessenger::new(messenger), peer, authorizer);
            match proxy.run(child).await {
                Ok(()) => info!("ingress session done"),
                Err(error) => warn!("ingress session failed: {error}"),
            }
        });
    }

    Ok(())
}

/// Attaches to a beacon-registered ingress and runs the egress side of the
/// tunnel over the bridged byte stream.
pub async fn run_beacon_egress(
    ingress_url: &str,
    identity: Arc<Identity>,
    endpoints: Vec<Endpoint>,
    ice_servers: Vec<String>,
    token: CancellationToken,
) -> Result<(), Error> {
    let (ws, _) = tokio_tungstenite::connect_async(ws_url(ingress_url))
        .await
        .map_err(|error| Error::Signal(format!("websocket connection to the beacon failed: {error}")))?;

    let messenger = NoiseMessenger::respond(ChunkedMessenger::new(WsByteStream::new(ws)), &identity).await?;
    debug!("egress: peer authenticated: {}", messenger.peer_certificate().details.name);

    let peer = PeerTransport::new(&ice_servers).await?;
    let proxy = EgressProxy::new(SignalMessenger::new(messenger), peer, endpoints);
    proxy.run(token).await
}

fn ws_url(base: &str) -> String {
    match base {
        _ if base.starts_with("http://") => format!("ws://{}", &base["http://".len()..]),
        _ if base.starts_with("https://") => format!("wss://{}", &base["https://".len()..]),
        _ => base.to_string(),
    }
    .trim_end_matches('/')
    .to_string()
}

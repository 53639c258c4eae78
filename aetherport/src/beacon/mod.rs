//! The beacon: an out-of-band rendezvous relay.
//!
//! An ingress registers with the beacon over an authenticated WebSocket and
//! keeps a multiplexer session open on it. A roaming egress attaches to the
//! same beacon and is bridged, over one multiplexer stream, to the ingress.
//! The bridged byte stream then carries the encrypted signalling channel that
//! bootstraps the direct WebRTC connection; once that connection is up the
//! bridge is no longer needed.

mod client;
mod server;
mod token;
mod ws;

use std::time::Duration;

pub use client::{fetch_public_key, run_beacon_egress, run_beacon_ingress};
pub use server::BeaconServer;
pub use token::{format_http_date, open_token, parse_http_date, seal_token, skew_ok, MAX_DATE_SKEW_SECONDS};
pub use ws::WsByteStream;

use aetherport_mux::Config as MuxConfig;

/// Sessions over the beacon ping aggressively: the bridge is only useful
/// while both sides are actually reachable.
pub(crate) fn beacon_mux_config() -> MuxConfig {
    MuxConfig {
        keepalive_interval: Duration::from_secs(1),
        keepalive_timeout: Duration::from_secs(3),
        ..MuxConfig::default()
    }
}

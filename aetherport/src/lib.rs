//! Peer-to-peer TCP tunnels over WebRTC.
//!
//! Two hosts, an egress (holding local listeners) and an ingress (holding the
//! remote services), prove their identities to each other with aetherport
//! certificates, exchange SDP and ICE over an encrypted signalling channel,
//! and then multiplex TCP connections over WebRTC data channels. When the two
//! cannot reach each other to signal directly, a beacon rendezvous server
//! bridges them.
//!
//! The layers, bottom up:
//!
//! - [`messenger`]: length-prefixed message framing and the Noise-encrypted
//!   messenger that authenticates both ends (see [`aetherport_identity`]).
//! - [`signal`]: SDP offer/answer and ICE candidate exchange over a messenger
//!   or over the terminal.
//! - [`peer`] and [`channel`]: the WebRTC peer connection and the adaptation
//!   of its data channels into backpressured byte streams.
//! - [`proxy`]: the egress and ingress data planes, one multiplexer session
//!   ([`aetherport_mux`]) per forwarded endpoint.
//! - [`beacon`]: the rendezvous relay and its client side.

pub mod beacon;
pub mod channel;
mod endpoint;
mod error;
pub mod messenger;
pub mod peer;
pub mod proxy;
pub mod relay;
pub mod signal;

pub use endpoint::{Endpoint, EndpointAuthorizer};
pub use error::Error;

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::unwrap_in_result))]

//! A sans-IO core for the GlobalProtect SSL VPN tunnel.
//!
//! Given an authenticated session cookie and collaborators for HTTPS and TLS,
//! [`GpSession`] negotiates the tunnel configuration, performs the
//! GET-tunnel handshake and shuttles framed IPv4 packets, with dead-peer
//! detection, keepalive, periodic rekey and reconnect handled internally.
//! All I/O is non-blocking and driven by an outer event loop.

pub mod cookie;
pub mod getconfig;
pub mod mtu;
pub mod packet;
pub mod session;
pub mod timers;
pub mod transport;

mod connect;

pub use cookie::SessionCookie;
pub use getconfig::{ConfigError, IpInfo, NegotiatedConfig};
pub use packet::Packet;
pub use session::{Activity, GpSession, SessionConfig, TunnelError};
pub use timers::{KeepaliveAction, TimerState};
pub use transport::{HttpsClient, HttpsRequest, TlsConnect, TunnelStream};

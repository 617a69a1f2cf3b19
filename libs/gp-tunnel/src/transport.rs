//! Collaborator seams: HTTPS request execution and the TLS byte stream.
//!
//! TLS session management lives outside this crate. The tunnel core only
//! needs an executor for the two HTTP exchanges and a raw byte stream it can
//! drive without blocking.

use std::io;

pub use crate::mtu::TcpMetrics;
pub use gp_proto::response::HttpError;

/// An HTTPS request against the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpsRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub body: Option<&'a str>,
}

/// Executes HTTPS requests against the gateway on its own connection.
pub trait HttpsClient {
    fn request(&mut self, request: HttpsRequest<'_>) -> Result<String, HttpError>;

    /// TCP diagnostics of the connection the last request ran on, for MTU
    /// estimation.
    fn tcp_metrics(&self) -> Option<TcpMetrics> {
        None
    }

    /// Whether the gateway was reached over IPv6.
    fn peer_is_ipv6(&self) -> bool {
        false
    }
}

/// The TLS byte stream carrying the tunnel.
pub trait TunnelStream {
    /// Blocking read used during the handshake. `Ok(0)` means the peer
    /// closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write of the whole buffer, used for the handshake request.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Non-blocking read. `Ok(0)` means no data is available right now.
    fn read_nonblock(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write. `Ok(0)` means nothing could be written; the
    /// caller MUST retry with the same bytes. A short count is partial
    /// progress and the caller resumes from the reported offset.
    fn write_nonblock(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Opens fresh TLS connections to the gateway's tunnel endpoint.
pub trait TlsConnect {
    type Stream: TunnelStream;

    fn open(&mut self) -> io::Result<Self::Stream>;
}

impl<F, S> TlsConnect for F
where
    F: FnMut() -> io::Result<S>,
    S: TunnelStream,
{
    type Stream = S;

    fn open(&mut self) -> io::Result<S> {
        (self)()
    }
}

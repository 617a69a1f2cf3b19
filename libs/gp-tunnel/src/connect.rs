//! The GET-tunnel handshake.
//!
//! The tunnel rides a hijacked HTTPS connection: a single raw request line is
//! sent and the server answers with the bare 12-byte `START_TUNNEL` sentinel
//! instead of an HTTP status. Anything else means the connection will not
//! carry frames.

use crate::cookie::{Filter, SessionCookie, filter_opts};
use crate::session::TunnelError;
use crate::transport::TunnelStream;

pub(crate) const START_TUNNEL: &[u8; 12] = b"START_TUNNEL";

/// How much of a non-sentinel response prelude we read for the log.
const RESPONSE_LOG_LIMIT: usize = 244;

pub(crate) fn open_tunnel<S: TunnelStream>(
    stream: &mut S,
    path: &str,
    cookie: &SessionCookie,
) -> Result<(), TunnelError> {
    tracing::debug!("Connecting to HTTPS tunnel endpoint");

    let mut request = format!("GET {path}?");
    filter_opts(
        &mut request,
        cookie.as_str(),
        &["user", "authcookie"],
        Filter::Keep,
    );
    request.push_str(" HTTP/1.1\r\n\r\n");

    tracing::trace!("> GET {path}?<cookie>");

    stream.write_all(request.as_bytes())?;

    let mut prelude = [0u8; START_TUNNEL.len()];
    let mut filled = 0;

    while filled < prelude.len() {
        let n = stream.read(&mut prelude[filled..])?;

        if n == 0 {
            break;
        }

        filled += n;
    }

    if filled == 0 {
        tracing::error!("Gateway disconnected immediately after GET-tunnel request");

        return Err(TunnelError::ConnectionClosed);
    }

    if prelude[..filled] == START_TUNNEL[..] {
        return Ok(());
    }

    // Pull in up to one more line so the log shows what the server actually
    // said, typically an HTTP status line.
    let mut response = String::from_utf8_lossy(&prelude[..filled]).into_owned();
    if filled == prelude.len() {
        response.push_str(&read_line(stream));
    }

    tracing::error!("Got inappropriate HTTP GET-tunnel response: {response}");

    Err(TunnelError::UnexpectedTunnelResponse)
}

fn read_line<S: TunnelStream>(stream: &mut S) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    while line.len() < RESPONSE_LOG_LIMIT {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => line.push(byte[0]),
        }
    }

    String::from_utf8_lossy(&line).into_owned()
}

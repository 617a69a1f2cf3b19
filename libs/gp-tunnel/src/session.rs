//! The tunnel session and its main loop.
//!
//! The session is cooperatively scheduled: the outer event loop calls
//! [`GpSession::step`] whenever the stream is readable or the previously
//! returned timeout expires. A step never blocks; it drains inbound frames,
//! resumes or starts at most one outbound write, and lets the timers decide
//! about DPD, keepalive, rekey and reconnect. Packets are handed off through
//! [`GpSession::send`] and [`GpSession::poll_inbound`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gp_proto::frame::{FrameError, FrameKind, HEADER_LEN, Header};

use crate::connect;
use crate::cookie::SessionCookie;
use crate::getconfig::{self, ConfigError, IpInfo, NegotiatedConfig, NegotiationParams};
use crate::packet::{DPD_FRAME, Packet, PacketPool};
use crate::timers::{KeepaliveAction, TimerState};
use crate::transport::{HttpsClient, TlsConnect, TunnelStream};

/// Frames are read into at least this much payload space, however small the
/// negotiated MTU.
const MIN_RECEIVE_BUFFER: usize = 2048;

/// What a [`GpSession::step`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Packets moved; the outer loop should call again soon.
    Progress,
    /// Nothing to do until the stream is readable or the timeout expires.
    Idle,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("gateway closed the connection during the tunnel handshake")]
    ConnectionClosed,
    #[error("unexpected response to the GET-tunnel request")]
    UnexpectedTunnelResponse,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unknown packet received")]
    UnknownPacket,
    #[error("stream claimed to write {wrote} bytes of {requested}")]
    WriteShort { requested: usize, wrote: usize },
    #[error("reconnect failed: {0}")]
    ReconnectFailed(#[source] Box<TunnelError>),
}

impl TunnelError {
    /// The human-readable quit reason for the outer loop.
    pub fn quit_reason(&self) -> &'static str {
        match self {
            TunnelError::Frame(FrameError::ShortFrame { .. }) => "Short packet received",
            TunnelError::Frame(_) | TunnelError::UnknownPacket => "Unknown packet received",
            TunnelError::WriteShort { .. } => "Internal error",
            TunnelError::ReconnectFailed(_) => "GPST reconnect failed",
            TunnelError::Config(_)
            | TunnelError::Io(_)
            | TunnelError::ConnectionClosed
            | TunnelError::UnexpectedTunnelResponse => "GPST setup failed",
        }
    }
}

/// Session parameters fixed at construction.
pub struct SessionConfig {
    /// The gateway host, for informational comparison against `<gw-address>`.
    pub gateway: String,
    pub cookie: SessionCookie,
    /// Value of `os-version` (and, mapped, `clientos`) during negotiation.
    pub os: String,
    /// Requested tunnel MTU; 0 derives it from the connection.
    pub mtu: u16,
    /// Base (outer) MTU; 0 derives it from kernel TCP diagnostics.
    pub base_mtu: u16,
    /// DPD interval override; zero keeps the protocol default of 10 s.
    pub dpd: Duration,
}

impl SessionConfig {
    pub fn new(gateway: impl Into<String>, cookie: SessionCookie) -> Self {
        Self {
            gateway: gateway.into(),
            cookie,
            os: "linux".to_owned(),
            mtu: 0,
            base_mtu: 0,
            dpd: Duration::ZERO,
        }
    }
}

pub struct GpSession<H, C: TlsConnect> {
    https: H,
    connector: C,
    stream: Option<C::Stream>,

    cookie: SessionCookie,
    os: String,
    gateway: String,
    requested_mtu: u16,
    base_mtu: u16,

    config: Option<Arc<NegotiatedConfig>>,
    timers: TimerState,

    pool: PacketPool,
    /// Spare receive buffer, reused while frames are consumed in place.
    recv_buf: Option<Vec<u8>>,
    inbound: VecDeque<Packet>,
    outbound: VecDeque<Packet>,
    /// The write in flight. A stalled or partial write MUST resume with
    /// these exact bytes, so the slot survives across steps.
    current: Option<TxSlot>,
}

enum TxSlot {
    Data { packet: Packet, written: usize },
    Dpd { written: usize },
}

impl TxSlot {
    fn frame(&self) -> &[u8] {
        match self {
            TxSlot::Data { packet, .. } => packet.frame_bytes(),
            TxSlot::Dpd { .. } => &DPD_FRAME[..],
        }
    }

    fn written(&self) -> usize {
        match self {
            TxSlot::Data { written, .. } | TxSlot::Dpd { written } => *written,
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            TxSlot::Data { written, .. } | TxSlot::Dpd { written } => *written += n,
        }
    }
}

enum ReadOutcome {
    /// Nothing buffered on the stream right now.
    NoData,
    /// A frame was consumed without producing a deliverable packet.
    Control,
    /// An IPv4 packet was queued for the caller.
    Data,
    Reconnect,
}

enum Flush {
    Done,
    /// The stream took none or part of the frame; retry next step.
    Blocked,
    Reconnect,
}

impl<H, C> GpSession<H, C>
where
    H: HttpsClient,
    C: TlsConnect,
{
    pub fn new(https: H, connector: C, config: SessionConfig, now: Instant) -> Self {
        let mut timers = TimerState::new(now);

        if !config.dpd.is_zero() {
            timers.dpd = config.dpd;
            timers.keepalive = config.dpd;
        }

        Self {
            https,
            connector,
            stream: None,
            cookie: config.cookie,
            os: config.os,
            gateway: config.gateway,
            requested_mtu: config.mtu,
            base_mtu: config.base_mtu,
            config: None,
            timers,
            pool: PacketPool::new(HEADER_LEN + MIN_RECEIVE_BUFFER),
            recv_buf: None,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            current: None,
        }
    }

    /// Negotiates the tunnel configuration and performs the GET-tunnel
    /// handshake.
    ///
    /// A challenge from the gateway surfaces as
    /// [`ResponseError::ChallengeRequired`](gp_proto::response::ResponseError::ChallengeRequired)
    /// inside [`ConfigError::Response`]; the caller answers it out of band
    /// and retries with a fresh cookie.
    pub fn setup(&mut self, now: Instant) -> Result<(), TunnelError> {
        self.connect_cycle(now)
    }

    /// Runs one main-loop iteration at `now`.
    ///
    /// `timeout` is lowered to the next timer deadline so the outer loop
    /// knows when to call back even without stream activity. Fatal errors
    /// carry a [`TunnelError::quit_reason`].
    pub fn step(&mut self, now: Instant, timeout: &mut Duration) -> Result<Activity, TunnelError> {
        if self.stream.is_none() {
            return self.reconnect(now);
        }

        let mut progress = false;

        // Drain inbound before touching the write side.
        loop {
            match self.read_frame(now)? {
                ReadOutcome::NoData => break,
                ReadOutcome::Control => {}
                ReadOutcome::Data => progress = true,
                ReadOutcome::Reconnect => return self.reconnect(now),
            }
        }

        // Finish the write a previous step left pending before anything else
        // may transmit.
        match self.flush_current(now, timeout)? {
            Flush::Done => {}
            Flush::Blocked => return Ok(activity(progress)),
            Flush::Reconnect => return self.reconnect(now),
        }

        match self.timers.action(now, timeout) {
            KeepaliveAction::Rekey => {
                tracing::info!("GlobalProtect rekey due");

                return self.reconnect(now);
            }
            KeepaliveAction::DpdDead => {
                tracing::error!("GPST Dead Peer Detection detected dead peer!");

                return self.reconnect(now);
            }
            KeepaliveAction::Keepalive if !self.outbound.is_empty() => {
                // Queued data is about to refresh last_tx by itself.
            }
            KeepaliveAction::Keepalive | KeepaliveAction::Dpd => {
                tracing::debug!("Send GPST DPD/keepalive request");

                self.current = Some(TxSlot::Dpd { written: 0 });
            }
            KeepaliveAction::None => {}
        }

        // At most one outbound packet per step; its write may stall and has
        // to be resumable with the same bytes.
        if self.current.is_none()
            && let Some(mut packet) = self.outbound.pop_front()
        {
            packet.stamp_header();
            tracing::trace!("Sending data packet of {} bytes", packet.payload_len());

            self.current = Some(TxSlot::Data { packet, written: 0 });
        }

        match self.flush_current(now, timeout)? {
            Flush::Done | Flush::Blocked => {}
            Flush::Reconnect => return self.reconnect(now),
        }

        Ok(activity(progress))
    }

    /// Queues an IPv4 datagram for transmission.
    pub fn send(&mut self, payload: &[u8]) {
        let storage = self.pool.acquire();

        self.outbound
            .push_back(Packet::from_payload(storage, payload));
    }

    /// The next inbound IPv4 packet, in exact stream order.
    pub fn poll_inbound(&mut self) -> Option<Packet> {
        self.inbound.pop_front()
    }

    /// Hands a consumed packet's buffer back for reuse.
    pub fn recycle(&mut self, packet: Packet) {
        self.pool.release(packet.into_storage());
    }

    /// Tears the tunnel down; the next [`GpSession::step`] reconnects.
    pub fn close(&mut self) {
        self.drop_stream();
    }

    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn ip_info(&self) -> Option<&IpInfo> {
        self.config.as_deref().map(|c| &c.ip)
    }

    /// The current negotiation snapshot; stays valid across renegotiations
    /// for anyone holding the `Arc`.
    pub fn config(&self) -> Option<Arc<NegotiatedConfig>> {
        self.config.clone()
    }

    fn read_frame(&mut self, now: Instant) -> Result<ReadOutcome, TunnelError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(ReadOutcome::Reconnect);
        };

        let mut buf = match self.recv_buf.take() {
            Some(buf) => buf,
            None => self.pool.acquire(),
        };
        buf.resize(self.pool.capacity(), 0);

        let n = match stream.read_nonblock(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Packet receive error: {e}");
                self.pool.release(buf);

                return Ok(ReadOutcome::Reconnect);
            }
        };

        if n == 0 {
            self.recv_buf = Some(buf);

            return Ok(ReadOutcome::NoData);
        }

        let header = match Header::parse(&buf[..n]) {
            Ok(header) => header,
            Err(e @ FrameError::ShortFrame { .. }) => {
                tracing::error!("Short packet received ({n} bytes)");

                return Err(e.into());
            }
            Err(e) => {
                tracing::error!(
                    "Unknown packet. Header dump follows: {}",
                    hex::encode(&buf[..HEADER_LEN.min(n)])
                );

                return Err(e.into());
            }
        };

        if n != header.frame_len() {
            tracing::error!(
                "Unexpected packet length. Read {n} bytes (includes {HEADER_LEN} header bytes) but header payload_len is {}",
                header.payload_len
            );
            tracing::error!("< {}", hex::encode(&buf[..HEADER_LEN]));
            self.recv_buf = Some(buf);

            return Ok(ReadOutcome::Control);
        }

        self.timers.last_rx = now;

        match header.kind() {
            Some(FrameKind::Dpd) => {
                tracing::debug!("Got GPST DPD/keepalive response");

                if header.trailer_is_anomalous() {
                    tracing::debug!(
                        "Expected 0000000000000000 as last 8 bytes of DPD/keepalive packet header, but got: {}",
                        hex::encode(&buf[8..HEADER_LEN])
                    );
                }

                self.recv_buf = Some(buf);

                Ok(ReadOutcome::Control)
            }
            Some(FrameKind::Ipv4) => {
                tracing::trace!("Received data packet of {} bytes", header.payload_len);

                if header.trailer_is_anomalous() {
                    tracing::debug!(
                        "Expected 0100000000000000 as last 8 bytes of data packet header, but got: {}",
                        hex::encode(&buf[8..HEADER_LEN])
                    );
                }

                buf.truncate(header.frame_len());
                self.inbound.push_back(Packet::from_frame(buf));

                Ok(ReadOutcome::Data)
            }
            None => {
                tracing::error!(
                    "Unknown packet. Header dump follows: {}",
                    hex::encode(&buf[..HEADER_LEN])
                );

                Err(TunnelError::UnknownPacket)
            }
        }
    }

    fn flush_current(
        &mut self,
        now: Instant,
        timeout: &mut Duration,
    ) -> Result<Flush, TunnelError> {
        let Some(mut slot) = self.current.take() else {
            return Ok(Flush::Done);
        };

        let Some(stream) = self.stream.as_mut() else {
            self.current = Some(slot);

            return Ok(Flush::Reconnect);
        };

        loop {
            self.timers.last_tx = now;

            let offset = slot.written();
            let remaining_len = slot.frame().len() - offset;

            let n = match stream.write_nonblock(&slot.frame()[offset..]) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Packet write error: {e}");
                    self.current = Some(slot);

                    return Ok(Flush::Reconnect);
                }
            };

            if n == 0 {
                let action = self.timers.stalled_action(now, timeout);
                self.current = Some(slot);

                return match action {
                    KeepaliveAction::Rekey => {
                        tracing::info!("GlobalProtect rekey due");

                        Ok(Flush::Reconnect)
                    }
                    KeepaliveAction::DpdDead => {
                        tracing::error!("GPST Dead Peer Detection detected dead peer!");

                        Ok(Flush::Reconnect)
                    }
                    KeepaliveAction::None | KeepaliveAction::Keepalive | KeepaliveAction::Dpd => {
                        Ok(Flush::Blocked)
                    }
                };
            }

            if n > remaining_len {
                return Err(TunnelError::WriteShort {
                    requested: remaining_len,
                    wrote: n,
                });
            }

            slot.advance(n);

            if slot.written() == slot.frame().len() {
                self.release_slot(slot);

                return Ok(Flush::Done);
            }
        }
    }

    fn reconnect(&mut self, now: Instant) -> Result<Activity, TunnelError> {
        match self.connect_cycle(now) {
            // Report progress so the outer scheduler re-enters promptly.
            Ok(()) => Ok(Activity::Progress),
            Err(e) => {
                tracing::error!("Reconnect failed: {e}");

                Err(TunnelError::ReconnectFailed(Box::new(e)))
            }
        }
    }

    fn connect_cycle(&mut self, now: Instant) -> Result<(), TunnelError> {
        self.drop_stream();

        let config = self.negotiate(now)?;

        let mut stream = self.connector.open()?;
        connect::open_tunnel(&mut stream, &config.ip.tunnel_path, &self.cookie)?;

        self.stream = Some(stream);
        self.timers.mark_all(now);

        Ok(())
    }

    fn negotiate(&mut self, now: Instant) -> Result<Arc<NegotiatedConfig>, TunnelError> {
        let params = NegotiationParams {
            cookie: &self.cookie,
            os: &self.os,
            requested_mtu: self.requested_mtu,
            base_mtu: self.base_mtu,
            gateway: &self.gateway,
            previous: self.config.as_deref().map(|c| &c.ip),
        };

        let negotiated = Arc::new(getconfig::negotiate(
            &mut self.https,
            params,
            &mut self.timers,
            now,
        )?);

        self.pool
            .set_capacity(HEADER_LEN + receive_buffer_len(negotiated.ip.mtu));
        self.config = Some(negotiated.clone());

        Ok(negotiated)
    }

    fn drop_stream(&mut self) {
        self.stream = None;

        // A data packet mid-write has no frame sync on the new stream; its
        // buffer goes back to the pool. The DPD sentinel is only untagged.
        if let Some(slot) = self.current.take() {
            self.release_slot(slot);
        }
    }

    fn release_slot(&mut self, slot: TxSlot) {
        if let TxSlot::Data { packet, .. } = slot {
            self.pool.release(packet.into_storage());
        }
    }
}

fn receive_buffer_len(mtu: u16) -> usize {
    MIN_RECEIVE_BUFFER.max(usize::from(mtu) + 256)
}

fn activity(progress: bool) -> Activity {
    if progress {
        Activity::Progress
    } else {
        Activity::Idle
    }
}

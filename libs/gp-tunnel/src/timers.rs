//! Liveness and rekey timers.
//!
//! The main loop never blocks on time; it asks [`TimerState::action`] what is
//! due *now* and lets the oracle shrink the caller-supplied poll timeout to
//! the next deadline. All timestamps are monotonic [`Instant`]s fed in by the
//! caller, never sampled here.

use std::time::{Duration, Instant};

/// Default DPD/keepalive interval, matching the vendor client.
pub const DEFAULT_DPD_INTERVAL: Duration = Duration::from_secs(10);

/// Subtracted from the server-supplied tunnel timeout to get the rekey
/// interval, so the rekey lands before the gateway expires the session.
pub const REKEY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    /// Nothing sent for a while; transmit something to keep NAT state alive.
    Keepalive,
    /// Nothing received for a while; probe the peer.
    Dpd,
    /// The peer has not answered probes for two DPD intervals.
    DpdDead,
    /// The negotiated tunnel lifetime is nearly up.
    Rekey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyMethod {
    None,
    /// Tear the TLS connection down and renegotiate from scratch.
    Tunnel,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerState {
    pub last_rx: Instant,
    pub last_tx: Instant,
    pub last_rekey: Instant,
    pub dpd: Duration,
    pub keepalive: Duration,
    pub rekey: Duration,
    pub rekey_method: RekeyMethod,
}

impl TimerState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_rx: now,
            last_tx: now,
            last_rekey: now,
            dpd: DEFAULT_DPD_INTERVAL,
            keepalive: DEFAULT_DPD_INTERVAL,
            rekey: Duration::ZERO,
            rekey_method: RekeyMethod::None,
        }
    }

    /// Re-arms every timer; called when a tunnel (re)connects.
    pub fn mark_all(&mut self, now: Instant) {
        self.last_rx = now;
        self.last_tx = now;
        self.last_rekey = now;
    }

    /// What is due at `now`, by severity: rekey, dead peer, DPD probe,
    /// keepalive. Every armed timer that is not yet due lowers `timeout`
    /// to its remaining time.
    pub fn action(&self, now: Instant, timeout: &mut Duration) -> KeepaliveAction {
        if self.rekey_method != RekeyMethod::None {
            match self.deadline(self.last_rekey, self.rekey, now, timeout) {
                Due::Now => return KeepaliveAction::Rekey,
                Due::Later => {}
            }
        }

        if !self.dpd.is_zero() {
            if now > self.last_rx + self.dpd * 2 {
                return KeepaliveAction::DpdDead;
            }

            match self.deadline(self.last_rx, self.dpd, now, timeout) {
                Due::Now => return KeepaliveAction::Dpd,
                Due::Later => {}
            }
        }

        if !self.keepalive.is_zero() {
            match self.deadline(self.last_tx, self.keepalive, now, timeout) {
                Due::Now => return KeepaliveAction::Keepalive,
                Due::Later => {}
            }
        }

        KeepaliveAction::None
    }

    /// The subset of [`TimerState::action`] consulted when a tunnel write
    /// reports zero progress: only conditions that warrant abandoning the
    /// stalled connection.
    pub fn stalled_action(&self, now: Instant, timeout: &mut Duration) -> KeepaliveAction {
        if self.rekey_method != RekeyMethod::None
            && matches!(
                self.deadline(self.last_rekey, self.rekey, now, timeout),
                Due::Now
            )
        {
            return KeepaliveAction::Rekey;
        }

        if !self.dpd.is_zero() {
            if now > self.last_rx + self.dpd * 2 {
                return KeepaliveAction::DpdDead;
            }

            let _ = self.deadline(self.last_rx, self.dpd * 2, now, timeout);
        }

        KeepaliveAction::None
    }

    fn deadline(
        &self,
        since: Instant,
        interval: Duration,
        now: Instant,
        timeout: &mut Duration,
    ) -> Due {
        let due = since + interval;

        if now >= due {
            return Due::Now;
        }

        *timeout = (*timeout).min(due - now);

        Due::Later
    }
}

enum Due {
    Now,
    Later,
}

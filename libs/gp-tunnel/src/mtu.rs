//! Tunnel MTU estimation.
//!
//! The gateway almost always reports `<mtu>0</mtu>`, so the usable MTU has to
//! be derived from the path MTU of the TLS connection. The result is sized so
//! that the same inner MTU would also fit an ESP-in-UDP encapsulation, which
//! keeps the addressing stable if the data plane is ever switched.

/// SPI (4) + sequence number (4) + biggest supported MAC (SHA1, 20) +
/// biggest supported IV (AES-256, 32) + pad length (1) + next header (1) +
/// max padding (16).
const ESP_OVERHEAD: u16 = 4 + 4 + 20 + 32 + 1 + 1 + 16;
const UDP_HEADER_SIZE: u16 = 8;
const IPV4_HEADER_SIZE: u16 = 20;
const IPV6_HEADER_SIZE: u16 = 40;

/// Per-segment overhead the TLS record layer adds on the wire.
const TLS_RECORD_OVERHEAD: u32 = 13;

const DEFAULT_BASE_MTU: u16 = 1406;
const MIN_BASE_MTU: u16 = 1280;

/// Kernel TCP diagnostics for the connection to the gateway.
///
/// A zero field means "unknown"; all fields default to unknown on platforms
/// without `TCP_INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpMetrics {
    pub path_mtu: u32,
    pub rcv_mss: u32,
    pub snd_mss: u32,
    /// The `TCP_MAXSEG` socket option, as a last resort.
    pub max_segment: u32,
}

/// Derives the tunnel MTU.
///
/// `requested` and `base` are operator-configured values; zero means
/// "derive". The estimate walks: configured base MTU, kernel path MTU,
/// MSS-derived base, `TCP_MAXSEG`, protocol default, in that order, then
/// subtracts the encapsulation overheads.
pub fn calculate_mtu(
    requested: u16,
    base: u16,
    metrics: Option<TcpMetrics>,
    peer_is_ipv6: bool,
) -> u16 {
    let mut base_mtu = base;

    if base_mtu == 0
        && let Some(metrics) = metrics
    {
        tracing::debug!(
            rcv_mss = metrics.rcv_mss,
            snd_mss = metrics.snd_mss,
            pmtu = metrics.path_mtu,
            maxseg = metrics.max_segment,
            "TCP diagnostics"
        );

        base_mtu = clamp_u16(metrics.path_mtu);

        if base_mtu == 0 && metrics.rcv_mss != 0 && metrics.snd_mss != 0 {
            let mss = metrics.rcv_mss.min(metrics.snd_mss);
            base_mtu = clamp_u16(mss.saturating_sub(TLS_RECORD_OVERHEAD));
        }

        if base_mtu == 0 && metrics.max_segment != 0 {
            base_mtu = clamp_u16(metrics.max_segment.saturating_sub(TLS_RECORD_OVERHEAD));
        }
    }

    if base_mtu == 0 {
        base_mtu = DEFAULT_BASE_MTU;
    }

    base_mtu = base_mtu.max(MIN_BASE_MTU);

    if requested != 0 {
        return requested;
    }

    let ip_header = if peer_is_ipv6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };

    base_mtu - ESP_OVERHEAD - UDP_HEADER_SIZE - ip_header
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u32::from(u16::MAX)) as u16
}

/// Reads `TCP_INFO` / `TCP_MAXSEG` for a connected TCP socket.
#[cfg(target_os = "linux")]
pub fn probe_socket(fd: std::os::fd::BorrowedFd<'_>) -> Option<TcpMetrics> {
    use std::os::fd::AsRawFd as _;

    let mut metrics = TcpMetrics::default();

    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    // SAFETY: `info` is a properly aligned, zero-initialised `tcp_info` and
    // `len` describes its size.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            std::ptr::from_mut(&mut info).cast(),
            &mut len,
        )
    };

    if rc == 0 {
        metrics.path_mtu = info.tcpi_pmtu;
        metrics.rcv_mss = info.tcpi_rcv_mss;
        metrics.snd_mss = info.tcpi_snd_mss;
    }

    let mut mss: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: `mss` is a properly aligned `c_int` and `len` describes its size.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            std::ptr::from_mut(&mut mss).cast(),
            &mut len,
        )
    };

    if rc == 0 && mss > 0 {
        metrics.max_segment = mss as u32;
    }

    (metrics != TcpMetrics::default()).then_some(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4_OVERHEAD: u16 = ESP_OVERHEAD + UDP_HEADER_SIZE + IPV4_HEADER_SIZE;

    #[test]
    fn default_base_mtu_without_diagnostics() {
        assert_eq!(calculate_mtu(0, 0, None, false), 1406 - V4_OVERHEAD);
    }

    #[test]
    fn explicit_request_wins() {
        assert_eq!(calculate_mtu(1380, 0, None, false), 1380);
    }

    #[test]
    fn path_mtu_is_preferred() {
        let metrics = TcpMetrics {
            path_mtu: 1500,
            rcv_mss: 1388,
            snd_mss: 1388,
            max_segment: 1388,
        };

        assert_eq!(
            calculate_mtu(0, 0, Some(metrics), false),
            1500 - V4_OVERHEAD
        );
    }

    #[test]
    fn mss_minus_tls_overhead_when_no_path_mtu() {
        let metrics = TcpMetrics {
            rcv_mss: 1400,
            snd_mss: 1460,
            ..Default::default()
        };

        assert_eq!(
            calculate_mtu(0, 0, Some(metrics), false),
            1400 - 13 - V4_OVERHEAD
        );
    }

    #[test]
    fn max_segment_is_the_last_resort() {
        let metrics = TcpMetrics {
            max_segment: 1380,
            ..Default::default()
        };

        assert_eq!(
            calculate_mtu(0, 0, Some(metrics), false),
            1380 - 13 - V4_OVERHEAD
        );
    }

    #[test]
    fn base_mtu_is_clamped_to_1280() {
        let metrics = TcpMetrics {
            path_mtu: 600,
            ..Default::default()
        };

        assert_eq!(
            calculate_mtu(0, 0, Some(metrics), false),
            1280 - V4_OVERHEAD
        );
        assert_eq!(calculate_mtu(0, 900, None, false), 1280 - V4_OVERHEAD);
    }

    #[test]
    fn ipv6_peer_costs_twenty_more_bytes() {
        let v4 = calculate_mtu(0, 0, None, false);
        let v6 = calculate_mtu(0, 0, None, true);

        assert_eq!(v4 - v6, 20);
    }

    #[test]
    fn result_never_drops_below_clamped_floor() {
        for base in [0u16, 1, 1279, 1280, 1406, 9000] {
            assert!(calculate_mtu(0, base, None, false) >= 1280 - V4_OVERHEAD);
        }
    }
}

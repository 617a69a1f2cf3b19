//! The `getconfig` negotiation.
//!
//! A POST to `ssl-vpn/getconfig.esp` trades the session cookie for the
//! tunnel's IP configuration. Negotiation is repeated on every reconnect; a
//! reconnect must hand back the same address and netmask or the local
//! interface state would silently diverge from what the gateway routes.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use gp_proto::config::{self, ConfigOption, DEFAULT_TUNNEL_PATH};
use gp_proto::response::{self, ResponseError};
use ip_network::Ipv4Network;

use crate::cookie::{Filter, SessionCookie, append_opt, filter_opts};
use crate::mtu;
use crate::timers::{DEFAULT_DPD_INTERVAL, REKEY_MARGIN, RekeyMethod, TimerState};
use crate::transport::{HttpsClient, HttpsRequest};

pub const GETCONFIG_PATH: &str = "ssl-vpn/getconfig.esp";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// The negotiated interface configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    pub addr: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub mtu: u16,
    pub dns: Vec<Ipv4Addr>,
    pub wins: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    pub split_includes: Vec<Ipv4Network>,
    pub tunnel_path: String,
    /// Informational; a tunnel does not route via a gateway.
    pub gateway: Option<String>,
}

/// One negotiation's immutable result: the interface configuration plus the
/// raw options the gateway sent. Swapped wholesale on successful
/// renegotiation; a failed renegotiation leaves the previous snapshot
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub ip: IpInfo,
    pub options: Vec<ConfigOption>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error("no IP address received")]
    NoAddress,
    #[error("reconnect gave a different {what} ({new} != {old})")]
    ReconnectChangedAddress {
        what: &'static str,
        old: String,
        new: String,
    },
}

pub(crate) struct NegotiationParams<'a> {
    pub cookie: &'a SessionCookie,
    pub os: &'a str,
    pub requested_mtu: u16,
    pub base_mtu: u16,
    pub gateway: &'a str,
    pub previous: Option<&'a IpInfo>,
}

pub(crate) fn negotiate<H: HttpsClient>(
    https: &mut H,
    params: NegotiationParams<'_>,
    timers: &mut TimerState,
    now: Instant,
) -> Result<NegotiatedConfig, ConfigError> {
    let body = build_request_body(params.os, params.cookie, params.previous.map(|ip| ip.addr));

    let result = https.request(HttpsRequest {
        method: "POST",
        path: GETCONFIG_PATH,
        content_type: Some(FORM_CONTENT_TYPE),
        body: Some(&body),
    });

    let parsed = response::interpret(result, config::parse_config)?;

    if let Some(timeout) = parsed.timeout {
        timers.last_rekey = now;
        timers.rekey = Duration::from_secs(timeout).saturating_sub(REKEY_MARGIN);
        timers.rekey_method = RekeyMethod::Tunnel;
    }

    // 10-second DPD/keepalive (same as the vendor client) unless overridden.
    if timers.dpd.is_zero() {
        timers.dpd = DEFAULT_DPD_INTERVAL;
    }
    timers.keepalive = timers.dpd;

    let mtu = if parsed.mtu == 0 {
        // Gateways report <mtu>0</mtu> in practice.
        let mtu = mtu::calculate_mtu(
            params.requested_mtu,
            params.base_mtu,
            https.tcp_metrics(),
            https.peer_is_ipv6(),
        );

        tracing::info!("No MTU received. Calculated {mtu}");

        mtu
    } else {
        parsed.mtu
    };

    let Some(addr) = parsed.addr else {
        tracing::error!("No IP address received. Aborting");
        return Err(ConfigError::NoAddress);
    };

    if let Some(previous) = params.previous {
        if previous.addr != addr {
            tracing::error!(
                "Reconnect gave different IP address ({addr} != {})",
                previous.addr
            );

            return Err(ConfigError::ReconnectChangedAddress {
                what: "IP address",
                old: previous.addr.to_string(),
                new: addr.to_string(),
            });
        }

        if previous.netmask.is_some() && previous.netmask != parsed.netmask {
            tracing::error!(
                "Reconnect gave different netmask ({:?} != {:?})",
                parsed.netmask,
                previous.netmask
            );

            return Err(ConfigError::ReconnectChangedAddress {
                what: "netmask",
                old: display_netmask(previous.netmask),
                new: display_netmask(parsed.netmask),
            });
        }
    }

    if let Some(gateway) = &parsed.gateway
        && gateway.as_str() != params.gateway
    {
        tracing::debug!(
            "Gateway address in config XML ({gateway}) differs from external gateway address ({})",
            params.gateway
        );
    }

    let tunnel_path = parsed
        .tunnel_path
        .or_else(|| params.previous.map(|ip| ip.tunnel_path.clone()))
        .unwrap_or_else(|| DEFAULT_TUNNEL_PATH.to_owned());

    Ok(NegotiatedConfig {
        ip: IpInfo {
            addr,
            netmask: parsed.netmask,
            mtu,
            dns: parsed.dns,
            wins: parsed.wins,
            domain: parsed.domain,
            split_includes: parsed.split_includes,
            tunnel_path,
            gateway: parsed.gateway,
        },
        options: parsed.options,
    })
}

fn build_request_body(os: &str, cookie: &SessionCookie, previous_addr: Option<Ipv4Addr>) -> String {
    let mut body = String::from("client-type=1&protocol-version=p1&app-version=3.0.1-10");

    append_opt(&mut body, "os-version", os);
    let clientos = if os == "win" { "Windows" } else { os };
    append_opt(&mut body, "clientos", clientos);
    append_opt(&mut body, "hmac-algo", "sha1,md5");
    append_opt(&mut body, "enc-algo", "aes-128-cbc,aes-256-cbc");

    match previous_addr {
        Some(addr) => {
            append_opt(&mut body, "preferred-ip", &addr.to_string());
            filter_opts(&mut body, cookie.as_str(), &["preferred-ip"], Filter::Drop);
        }
        None => {
            body.push('&');
            body.push_str(cookie.as_str());
        }
    }

    body
}

fn display_netmask(netmask: Option<Ipv4Addr>) -> String {
    match netmask {
        Some(netmask) => netmask.to_string(),
        None => "none".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpMetrics;
    use std::collections::VecDeque;

    struct FakeHttps {
        responses: VecDeque<String>,
        requests: Vec<(String, String, Option<String>)>,
        metrics: Option<TcpMetrics>,
    }

    impl FakeHttps {
        fn replying(responses: &[&str]) -> Self {
            Self {
                responses: responses.iter().map(|r| (*r).to_owned()).collect(),
                requests: Vec::new(),
                metrics: None,
            }
        }
    }

    impl HttpsClient for FakeHttps {
        fn request(&mut self, request: HttpsRequest<'_>) -> Result<String, response::HttpError> {
            self.requests.push((
                request.path.to_owned(),
                request.body.unwrap_or_default().to_owned(),
                request.content_type.map(ToOwned::to_owned),
            ));

            Ok(self.responses.pop_front().expect("unexpected request"))
        }

        fn tcp_metrics(&self) -> Option<TcpMetrics> {
            self.metrics
        }
    }

    const COOKIE: &str = "user=alice&authcookie=deadbeef&portal=gw&preferred-ip=10.0.0.2";

    const HAPPY_XML: &str = "<response><ip-address>10.0.0.2</ip-address><netmask>255.255.255.0</netmask><mtu>0</mtu><timeout>1800</timeout></response>";

    fn negotiate_once(
        https: &mut FakeHttps,
        previous: Option<&IpInfo>,
        timers: &mut TimerState,
        now: Instant,
    ) -> Result<NegotiatedConfig, ConfigError> {
        negotiate(
            https,
            NegotiationParams {
                cookie: &SessionCookie::new(COOKIE),
                os: "linux",
                requested_mtu: 0,
                base_mtu: 0,
                gateway: "gw.example.com",
                previous,
            },
            timers,
            now,
        )
    }

    #[test]
    fn happy_path_body_and_config() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[HAPPY_XML]);
        let mut timers = TimerState::new(now);

        let config = negotiate_once(&mut https, None, &mut timers, now).unwrap();

        let (path, body, content_type) = &https.requests[0];
        assert_eq!(path, "ssl-vpn/getconfig.esp");
        assert_eq!(
            content_type.as_deref(),
            Some("application/x-www-form-urlencoded")
        );
        assert!(body.starts_with(
            "client-type=1&protocol-version=p1&app-version=3.0.1-10&os-version=linux&clientos=linux&hmac-algo=sha1,md5&enc-algo=aes-128-cbc,aes-256-cbc"
        ));
        assert!(body.ends_with(&format!("&{COOKIE}")));

        assert_eq!(config.ip.addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.ip.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(config.ip.mtu, mtu::calculate_mtu(0, 0, None, false));
        assert_eq!(config.ip.tunnel_path, DEFAULT_TUNNEL_PATH);

        assert_eq!(timers.rekey, Duration::from_secs(1740));
        assert_eq!(timers.rekey_method, RekeyMethod::Tunnel);
        assert_eq!(timers.last_rekey, now);
        assert_eq!(timers.keepalive, timers.dpd);
    }

    #[test]
    fn windows_clientos_is_mapped() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[HAPPY_XML]);
        let mut timers = TimerState::new(now);

        negotiate(
            &mut https,
            NegotiationParams {
                cookie: &SessionCookie::new(COOKIE),
                os: "win",
                requested_mtu: 0,
                base_mtu: 0,
                gateway: "gw.example.com",
                previous: None,
            },
            &mut timers,
            now,
        )
        .unwrap();

        assert!(https.requests[0].1.contains("os-version=win&clientos=Windows&"));
    }

    #[test]
    fn reconnect_suppresses_preferred_ip_from_cookie() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[HAPPY_XML]);
        let mut timers = TimerState::new(now);
        let previous = IpInfo {
            addr: Ipv4Addr::new(10, 0, 0, 2),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            mtu: 1300,
            dns: Vec::new(),
            wins: Vec::new(),
            domain: None,
            split_includes: Vec::new(),
            tunnel_path: DEFAULT_TUNNEL_PATH.to_owned(),
            gateway: None,
        };

        negotiate_once(&mut https, Some(&previous), &mut timers, now).unwrap();

        let body = &https.requests[0].1;
        assert!(body.contains("&preferred-ip=10.0.0.2&"));
        assert!(body.ends_with("user=alice&authcookie=deadbeef&portal=gw"));
    }

    #[test]
    fn reconnect_with_changed_address_fails() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[HAPPY_XML]);
        let mut timers = TimerState::new(now);
        let previous = IpInfo {
            addr: Ipv4Addr::new(10, 0, 0, 99),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            mtu: 1300,
            dns: Vec::new(),
            wins: Vec::new(),
            domain: None,
            split_includes: Vec::new(),
            tunnel_path: DEFAULT_TUNNEL_PATH.to_owned(),
            gateway: None,
        };

        let result = negotiate_once(&mut https, Some(&previous), &mut timers, now);

        assert!(matches!(
            result,
            Err(ConfigError::ReconnectChangedAddress { what: "IP address", .. })
        ));
    }

    #[test]
    fn missing_address_is_fatal() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&["<response><mtu>1400</mtu></response>"]);
        let mut timers = TimerState::new(now);

        let result = negotiate_once(&mut https, None, &mut timers, now);

        assert!(matches!(result, Err(ConfigError::NoAddress)));
    }

    #[test]
    fn explicit_mtu_skips_the_estimator() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[
            "<response><ip-address>10.0.0.2</ip-address><mtu>1380</mtu></response>",
        ]);
        let mut timers = TimerState::new(now);

        let config = negotiate_once(&mut https, None, &mut timers, now).unwrap();

        assert_eq!(config.ip.mtu, 1380);
    }

    #[test]
    fn tcp_metrics_feed_the_estimator() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[HAPPY_XML]);
        https.metrics = Some(TcpMetrics {
            path_mtu: 1500,
            ..Default::default()
        });
        let mut timers = TimerState::new(now);

        let config = negotiate_once(&mut https, None, &mut timers, now).unwrap();

        assert_eq!(config.ip.mtu, 1500 - 78 - 8 - 20);
    }

    #[test]
    fn challenge_surfaces_as_recoverable_error() {
        let now = Instant::now();
        let mut https = FakeHttps::replying(&[
            "var respStatus = \"Challenge\";\nvar respMsg = \"OTP?\";\nthisForm.inputStr.value = \"abc\";\n",
        ]);
        let mut timers = TimerState::new(now);

        let result = negotiate_once(&mut https, None, &mut timers, now);

        assert!(matches!(
            result,
            Err(ConfigError::Response(
                ResponseError::ChallengeRequired { .. }
            ))
        ));
    }
}

//! Parsing of the `getconfig` XML document into a tunnel configuration.
//!
//! The gateway is lenient about what it sends; we are lenient about what we
//! accept. Unknown elements are skipped, unparseable addresses and routes are
//! logged and dropped, and only the complete absence of an IP address is
//! treated as fatal by the negotiator downstream.

use std::net::Ipv4Addr;

use ip_network::Ipv4Network;

use crate::response::ResponseError;

pub const DEFAULT_TUNNEL_PATH: &str = "/ssl-tunnel-connect.sslvpn";

/// A `(name, value)` pair recorded during negotiation, mirroring what the
/// gateway sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: String,
    pub value: String,
}

impl ConfigOption {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            value: value.into(),
        }
    }
}

/// The raw result of parsing a `getconfig` response document.
///
/// Interval bookkeeping (rekey from `timeout`, MTU fill-in, DPD defaulting)
/// happens in the negotiator; this struct only reflects the document.
/// The protocol has no IPv6 data plane, so only legacy-IP fields exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfig {
    pub addr: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub mtu: u16,
    pub tunnel_path: Option<String>,
    /// Tunnel lifetime in seconds; drives the rekey interval.
    pub timeout: Option<u64>,
    pub gateway: Option<String>,
    pub dns: Vec<Ipv4Addr>,
    pub wins: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    pub split_includes: Vec<Ipv4Network>,
    pub options: Vec<ConfigOption>,
}

/// XML callback for [`crate::response::interpret`]: parses a `<response>`
/// config document.
pub fn parse_config(root: roxmltree::Node<'_, '_>) -> Result<TunnelConfig, ResponseError> {
    if !root.has_tag_name("response") {
        return Err(ResponseError::MalformedResponse);
    }

    let mut config = TunnelConfig::default();

    for node in root.children().filter(|n| n.is_element()) {
        let text = || node.text().unwrap_or_default().trim();

        match node.tag_name().name() {
            "ip-address" => {
                config.addr = parse_addr(text(), "ip-address");

                if config.addr.is_some() {
                    config.options.push(ConfigOption::new("ipaddr", text()));
                }
            }
            "netmask" => {
                config.netmask = parse_addr(text(), "netmask");

                if config.netmask.is_some() {
                    config.options.push(ConfigOption::new("netmask", text()));
                }
            }
            "mtu" => {
                config.mtu = text().parse().unwrap_or(0);
            }
            "ssl-tunnel-url" => {
                let path = text();

                if path != DEFAULT_TUNNEL_PATH {
                    tracing::info!("Non-standard SSL tunnel path: {path}");
                }

                config.tunnel_path = Some(path.to_owned());
            }
            "timeout" => {
                let seconds: u64 = text().parse().unwrap_or(0);

                tracing::info!(
                    "Tunnel timeout (rekey interval) is {} minutes",
                    seconds / 60
                );

                config.timeout = Some(seconds);
            }
            "gw-address" => {
                config.gateway = Some(text().to_owned());
            }
            "dns" => {
                collect_members(node, 3, |member| {
                    if let Some(addr) = parse_addr(member, "dns") {
                        config.dns.push(addr);
                        config.options.push(ConfigOption::new("DNS", member));
                    }
                });
            }
            "wins" => {
                collect_members(node, 3, |member| {
                    if let Some(addr) = parse_addr(member, "wins") {
                        config.wins.push(addr);
                        config.options.push(ConfigOption::new("WINS", member));
                    }
                });
            }
            "dns-suffix" => {
                collect_members(node, 1, |member| {
                    config.domain = Some(member.to_owned());
                    config.options.push(ConfigOption::new("search", member));
                });
            }
            "access-routes" => {
                collect_members(node, usize::MAX, |member| match member.parse() {
                    Ok(route) => {
                        config.split_includes.push(route);
                        config
                            .options
                            .push(ConfigOption::new("split-include", member));
                    }
                    Err(_) => tracing::info!("Ignoring unparseable access route: {member}"),
                });
            }
            "ipsec" => {
                tracing::debug!("Ignoring ESP configuration; ESP is not supported on this tunnel");
            }
            _ => {}
        }
    }

    Ok(config)
}

fn parse_addr(text: &str, element: &str) -> Option<Ipv4Addr> {
    match text.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            tracing::info!("Ignoring unparseable <{element}> value: {text}");

            None
        }
    }
}

fn collect_members(node: roxmltree::Node<'_, '_>, limit: usize, mut visit: impl FnMut(&str)) {
    node.children()
        .filter(|n| n.has_tag_name("member"))
        .filter_map(|n| n.text())
        .map(str::trim)
        .take(limit)
        .for_each(|member| visit(member));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::interpret;

    fn parse(body: &str) -> TunnelConfig {
        interpret(Ok(body.to_owned()), parse_config).unwrap()
    }

    #[test]
    fn parses_minimal_config() {
        let config = parse(
            "<response><ip-address>10.0.0.2</ip-address><netmask>255.255.255.0</netmask><mtu>0</mtu><timeout>1800</timeout></response>",
        );

        assert_eq!(config.addr, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(config.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(config.mtu, 0);
        assert_eq!(config.timeout, Some(1800));
    }

    #[test]
    fn records_options_the_gateway_sent() {
        let config = parse(
            "<response><ip-address>10.0.0.2</ip-address><netmask>255.255.255.0</netmask></response>",
        );

        assert_eq!(
            config.options,
            vec![
                ConfigOption::new("ipaddr", "10.0.0.2"),
                ConfigOption::new("netmask", "255.255.255.0"),
            ]
        );
    }

    #[test]
    fn caps_dns_and_wins_at_three() {
        let config = parse(
            "<response><dns><member>1.1.1.1</member><member>8.8.8.8</member><member>9.9.9.9</member><member>4.4.4.4</member></dns><wins><member>10.0.0.1</member></wins></response>",
        );

        assert_eq!(
            config.dns,
            vec![
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(9, 9, 9, 9),
            ]
        );
        assert_eq!(config.wins, vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[test]
    fn first_dns_suffix_member_wins() {
        let config = parse(
            "<response><dns-suffix><member>corp.example.com</member><member>example.com</member></dns-suffix></response>",
        );

        assert_eq!(config.domain, Some("corp.example.com".to_owned()));
    }

    #[test]
    fn split_routes_preserve_document_order() {
        let config = parse(
            "<response><access-routes><member>10.0.0.0/8</member><member>192.168.1.0/24</member></access-routes></response>",
        );

        assert_eq!(
            config.split_includes,
            vec![
                "10.0.0.0/8".parse::<Ipv4Network>().unwrap(),
                "192.168.1.0/24".parse::<Ipv4Network>().unwrap(),
            ]
        );
    }

    #[test]
    fn unparseable_route_is_skipped() {
        let config = parse(
            "<response><access-routes><member>not-a-route</member><member>10.0.0.0/8</member></access-routes></response>",
        );

        assert_eq!(
            config.split_includes,
            vec!["10.0.0.0/8".parse::<Ipv4Network>().unwrap()]
        );
    }

    #[test]
    fn tunnel_url_and_gateway_are_captured() {
        let config = parse(
            "<response><ssl-tunnel-url>/ssl-tunnel-connect.sslvpn</ssl-tunnel-url><gw-address>192.0.2.1</gw-address></response>",
        );

        assert_eq!(
            config.tunnel_path,
            Some("/ssl-tunnel-connect.sslvpn".to_owned())
        );
        assert_eq!(config.gateway, Some("192.0.2.1".to_owned()));
    }

    #[test]
    fn unknown_elements_are_ignored() {
        let config = parse(
            "<response><ip-address>10.0.0.2</ip-address><frobnicate>1</frobnicate><ipsec><c1>x</c1></ipsec></response>",
        );

        assert_eq!(config.addr, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn non_response_root_is_malformed() {
        let result = interpret(Ok("<policy/>".to_owned()), parse_config);

        assert!(matches!(result, Err(ResponseError::MalformedResponse)));
    }
}

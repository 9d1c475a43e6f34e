//! WireGuard config rendering
//!
//! Renders the reconciled interface state as a `wg-quick` style file for
//! operator inspection. The reconcile path programs the driver directly and
//! never goes through this.

use super::driver::Peer;
use ipnet::IpNet;
use std::fmt::Write as FmtWrite;

/// Render an `[Interface]` section plus one `[Peer]` section per peer.
pub fn render_interface_config(
    private_key: &str,
    listen_port: u16,
    addresses: &[IpNet],
    peers: &[Peer],
) -> String {
    let mut config = String::new();

    writeln!(config, "[Interface]").unwrap();
    writeln!(config, "PrivateKey = {}", private_key).unwrap();
    writeln!(config, "ListenPort = {}", listen_port).unwrap();
    if !addresses.is_empty() {
        let addrs: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        writeln!(config, "Address = {}", addrs.join(", ")).unwrap();
    }

    for peer in peers {
        writeln!(config).unwrap();
        writeln!(config, "# {}", peer.id).unwrap();
        writeln!(config, "[Peer]").unwrap();
        writeln!(config, "PublicKey = {}", peer.public_key).unwrap();
        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
            writeln!(config, "AllowedIPs = {}", ips.join(", ")).unwrap();
        }
        if let Some(endpoint) = peer.endpoint {
            writeln!(config, "Endpoint = {}", endpoint).unwrap();
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_render() {
        let peers = vec![Peer {
            id: "node-b".to_string(),
            public_key: "b-key".to_string(),
            endpoint: Some("203.0.113.2:51820".parse().unwrap()),
            allowed_ips: vec![
                IpNet::from_str("10.0.0.2/32").unwrap(),
                IpNet::from_str("10.0.0.3/32").unwrap(),
            ],
        }];
        let config = render_interface_config(
            "priv",
            51820,
            &[IpNet::from_str("10.0.0.1/32").unwrap()],
            &peers,
        );

        assert!(config.contains("[Interface]"));
        assert!(config.contains("ListenPort = 51820"));
        assert!(config.contains("# node-b"));
        assert!(config.contains("AllowedIPs = 10.0.0.2/32, 10.0.0.3/32"));
        assert!(config.contains("Endpoint = 203.0.113.2:51820"));
    }

    #[test]
    fn test_render_no_peers() {
        let config = render_interface_config("priv", 51820, &[], &[]);
        assert!(config.contains("[Interface]"));
        assert!(!config.contains("[Peer]"));
    }
}

//! Cross-network firewall rule derivation: when instance B declares `allowedConnections =
//! itemA/port/proto` and instance A declares `exposedPorts = port/proto`,
//! B's params gain an explicit `(srcIP=B, dstIP=A, proto, dstPort=port)`
//! rule. A's params stay empty — the remote side configures the symmetric
//! rule itself.

use std::net::IpAddr;

use cm_proto::domain::{ConnectionSpec, FirewallRule, PortSpec};

/// One peer already assigned on the same network.
pub struct Peer<'a> {
    pub item_id: &'a str,
    pub ip: IpAddr,
    pub exposed_ports: &'a [PortSpec],
}

pub fn derive_rules(src_ip: IpAddr, allowed: &[ConnectionSpec], peers: &[Peer<'_>]) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    for conn in allowed {
        for peer in peers {
            if peer.item_id != conn.item_id {
                continue;
            }
            let exposes = peer
                .exposed_ports
                .iter()
                .any(|p| p.port == conn.port && p.proto == conn.proto);
            if exposes {
                rules.push(FirewallRule {
                    src_ip,
                    dst_ip: peer.ip,
                    proto: conn.proto,
                    dst_port: conn.port,
                });
            }
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::domain::Proto;

    #[test]
    fn rule_generated_only_when_peer_exposes_the_requested_port() {
        let b_ip: IpAddr = "10.0.0.2".parse().unwrap();
        let a_ip: IpAddr = "10.0.0.1".parse().unwrap();

        let allowed = vec![ConnectionSpec {
            item_id: "itemA".into(),
            port: 8080,
            proto: Proto::Tcp,
        }];
        let peers = vec![Peer {
            item_id: "itemA",
            ip: a_ip,
            exposed_ports: &[PortSpec { port: 8080, proto: Proto::Tcp }],
        }];

        let rules = derive_rules(b_ip, &allowed, &peers);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].src_ip, b_ip);
        assert_eq!(rules[0].dst_ip, a_ip);

        let peers_without_port = vec![Peer {
            item_id: "itemA",
            ip: a_ip,
            exposed_ports: &[],
        }];
        assert!(derive_rules(b_ip, &allowed, &peers_without_port).is_empty());
    }
}

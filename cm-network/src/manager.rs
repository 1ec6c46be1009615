//! Network Manager: provider networks, per-instance IP/DNS/
//! firewall parameters, and DNS zone rebuilding.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use cm_proto::domain::{ConnectionSpec, Host, InstanceIdent, Network, NetworkInstance, NodeId, PortSpec};
use cm_proto::{CmError, CmResult};
use cm_store::Store;
use ipnet::Ipv4Net;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::info;

use crate::dns::{self, DnsResolver, ZoneEntry};
use crate::firewall::{self, Peer};
use crate::{ip, vlan};

pub struct NetworkManagerConfig {
    pub subnet_pool: Vec<Ipv4Net>,
    pub dns_primary: IpAddr,
}

/// The network-affecting fields of an `InstanceInfo`, passed in by the
/// reconciler when it asks for this instance's network parameters. Kept
/// separate from the full `InstanceInfo` so `cm-network` doesn't need to
/// depend on the rest of that type's fields.
pub struct ServiceNetworkData {
    pub item_id: String,
    pub exposed_ports: Vec<PortSpec>,
    pub allowed_connections: Vec<ConnectionSpec>,
}

pub struct NetworkManager {
    store: Arc<Store>,
    config: NetworkManagerConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
    dns: Arc<dyn DnsResolver>,
}

impl NetworkManager {
    pub fn new(
        store: Arc<Store>,
        config: NetworkManagerConfig,
        rng: Box<dyn RngCore + Send>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        Self { store, config, rng: Mutex::new(rng), dns }
    }

    /// Creates/retains networks named by `providers`, allocating a fresh
    /// subnet+VLAN for each new one and a host IP for `node_id`; removes any
    /// network no longer in the provider set, cascading through hosts and
    /// network instances.
    pub async fn update_provider_network(&self, providers: &[String], node_id: &NodeId) -> CmResult<()> {
        let existing = self.store.list_networks().await?;
        let existing_ids: HashSet<&str> = existing.iter().map(|n| n.network_id.as_str()).collect();

        for provider in providers {
            if existing_ids.contains(provider.as_str()) {
                continue;
            }
            let network = self.allocate_network(provider, &existing).await?;
            self.store.add_network(&network).await?;
            self.assign_host(&network, node_id).await?;
            info!(network_id = %provider, vlan_id = network.vlan_id, "provider network created");
        }

        for network in &existing {
            if providers.iter().any(|p| p == &network.network_id) {
                continue;
            }
            self.remove_network_cascading(&network.network_id).await?;
            info!(network_id = %network.network_id, "provider network removed");
        }
        Ok(())
    }

    async fn allocate_network(&self, provider: &str, existing: &[Network]) -> CmResult<Network> {
        let used_subnets: HashSet<String> = existing.iter().map(|n| n.subnet.clone()).collect();
        let subnet = ip::allocate_subnet(&self.config.subnet_pool, &used_subnets)?;
        let used_vlans: HashSet<u16> = existing.iter().map(|n| n.vlan_id).collect();
        let vlan_id = {
            let mut rng = self.rng.lock().await;
            vlan::pick(rng.as_mut(), &used_vlans)?
        };
        Ok(Network {
            network_id: provider.to_string(),
            subnet: subnet.to_string(),
            vlan_id,
        })
    }

    async fn assign_host(&self, network: &Network, node_id: &NodeId) -> CmResult<()> {
        let in_use: HashSet<IpAddr> = self.store.ips_in_use(&network.network_id).await?.into_iter().collect();
        let host_ip = ip::allocate(&network.subnet, &in_use)?;
        self.store
            .add_host(&Host {
                network_id: network.network_id.clone(),
                node_id: node_id.clone(),
                ip: host_ip,
            })
            .await
    }

    async fn remove_network_cascading(&self, network_id: &str) -> CmResult<()> {
        for ni in self.store.list_network_instances().await? {
            if ni.network_id == network_id {
                self.store.remove_network_instance(&ni.ident).await?;
            }
        }
        for host in self.store.list_hosts(network_id).await? {
            self.store.remove_host(network_id, &host.node_id.0).await?;
        }
        self.store.remove_network(network_id).await
    }

    /// Returns the existing assignment if one exists; otherwise allocates a
    /// new IP, DNS servers and firewall rules.
    pub async fn prepare_instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        network_id: &str,
        node_id: &NodeId,
        service: &ServiceNetworkData,
    ) -> CmResult<NetworkInstance> {
        if let Some(existing) = self.store.get_network_instance(ident).await? {
            return Ok(existing);
        }

        let network = self.store.get_network(network_id).await?;
        let hosts = self.store.list_hosts(network_id).await?;
        if !hosts.iter().any(|h| &h.node_id == node_id) {
            return Err(CmError::not_found(format!("host {node_id} on network {network_id}")));
        }

        let in_use: HashSet<IpAddr> = self.store.ips_in_use(network_id).await?.into_iter().collect();
        let assigned_ip = ip::allocate(&network.subnet, &in_use)?;

        let existing_instances = self.store.list_network_instances().await?;
        let same_network: Vec<_> = existing_instances.iter().filter(|ni| ni.network_id == network_id).collect();
        let peers: Vec<Peer<'_>> = same_network
            .iter()
            .map(|ni| Peer {
                item_id: ni.ident.item_id.as_str(),
                ip: ni.ip,
                exposed_ports: ni.exposed_ports.as_slice(),
            })
            .collect();
        let firewall_rules = firewall::derive_rules(assigned_ip, &service.allowed_connections, &peers);

        let network_instance = NetworkInstance {
            ident: ident.clone(),
            network_id: network_id.to_string(),
            node_id: node_id.clone(),
            ip: assigned_ip,
            exposed_ports: service.exposed_ports.clone(),
            dns_servers: vec![self.config.dns_primary],
            firewall_rules,
        };
        self.store.add_network_instance(&network_instance).await?;
        Ok(network_instance)
    }

    /// Deletes the `NetworkInstance`; the freed IP becomes immediately
    /// available to the next allocation.
    pub async fn remove_instance_network_parameters(&self, ident: &InstanceIdent, _node_id: &NodeId) -> CmResult<()> {
        self.store.remove_network_instance(ident).await
    }

    pub async fn get_instances(&self) -> CmResult<Vec<NetworkInstance>> {
        self.store.list_network_instances().await
    }

    /// Rebuilds the DNS zone as `{ip -> canonical names}` and signals the
    /// resolver to reload.
    pub async fn restart_dns_server(&self) -> CmResult<()> {
        let instances = self.store.list_network_instances().await?;
        let entries: Vec<ZoneEntry> = instances
            .into_iter()
            .map(|ni| ZoneEntry { ip: ni.ip, names: vec![dns::canonical_name(&ni.ident)] })
            .collect();
        let zone = dns::build_zone(&entries);
        self.dns.reload(&zone).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::domain::Proto;
    use std::sync::Mutex as StdMutex;

    struct FixedRng(std::vec::IntoIter<u32>);
    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            self.0.next().expect("fixed rng exhausted")
        }
        fn next_u64(&mut self) -> u64 {
            self.next_u32() as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(4) {
                let bytes = self.next_u32().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDns(StdMutex<Vec<String>>);
    #[async_trait::async_trait]
    impl DnsResolver for RecordingDns {
        async fn reload(&self, zone: &str) -> CmResult<()> {
            self.0.lock().unwrap().push(zone.to_string());
            Ok(())
        }
    }

    fn config() -> NetworkManagerConfig {
        NetworkManagerConfig {
            subnet_pool: vec!["10.0.0.0/24".parse().unwrap(), "10.0.1.0/24".parse().unwrap()],
            dns_primary: "10.0.0.1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn two_providers_get_the_literal_vlan_sequence() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let rng = Box::new(FixedRng(vec![1000, 2000].into_iter()));
        let manager = NetworkManager::new(store.clone(), config(), rng, Arc::new(RecordingDns::default()));

        manager
            .update_provider_network(&["net-a".into(), "net-b".into()], &NodeId("node1".into()))
            .await
            .unwrap();

        let networks = store.list_networks().await.unwrap();
        let mut vlans: Vec<u16> = networks.iter().map(|n| n.vlan_id).collect();
        vlans.sort();
        assert_eq!(vlans, vec![1000, 2000]);
        assert_eq!(store.list_hosts("net-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_a_provider_cascades_through_hosts_and_instances() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let rng = Box::new(FixedRng(vec![1000].into_iter()));
        let manager = NetworkManager::new(store.clone(), config(), rng, Arc::new(RecordingDns::default()));
        let node = NodeId("node1".into());

        manager.update_provider_network(&["net-a".into()], &node).await.unwrap();
        let ident = InstanceIdent { item_id: "itemA".into(), subject_id: "subj".into(), instance: 0 };
        manager
            .prepare_instance_network_parameters(
                &ident,
                "net-a",
                &node,
                &ServiceNetworkData { item_id: "itemA".into(), exposed_ports: vec![], allowed_connections: vec![] },
            )
            .await
            .unwrap();

        manager.update_provider_network(&[], &node).await.unwrap();
        assert!(store.list_networks().await.unwrap().is_empty());
        assert!(store.get_network_instance(&ident).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn allowed_connection_becomes_an_explicit_firewall_rule() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let rng = Box::new(FixedRng(vec![1000].into_iter()));
        let manager = NetworkManager::new(store.clone(), config(), rng, Arc::new(RecordingDns::default()));
        let node = NodeId("node1".into());
        manager.update_provider_network(&["net-a".into()], &node).await.unwrap();

        let ident_a = InstanceIdent { item_id: "itemA".into(), subject_id: "subj".into(), instance: 0 };
        manager
            .prepare_instance_network_parameters(
                &ident_a,
                "net-a",
                &node,
                &ServiceNetworkData {
                    item_id: "itemA".into(),
                    exposed_ports: vec![PortSpec { port: 8080, proto: Proto::Tcp }],
                    allowed_connections: vec![],
                },
            )
            .await
            .unwrap();

        let ident_b = InstanceIdent { item_id: "itemB".into(), subject_id: "subj".into(), instance: 0 };
        let params_b = manager
            .prepare_instance_network_parameters(
                &ident_b,
                "net-a",
                &node,
                &ServiceNetworkData {
                    item_id: "itemB".into(),
                    exposed_ports: vec![],
                    allowed_connections: vec![ConnectionSpec {
                        item_id: "itemA".into(),
                        port: 8080,
                        proto: Proto::Tcp,
                    }],
                },
            )
            .await
            .unwrap();

        assert_eq!(params_b.firewall_rules.len(), 1);
        assert_eq!(params_b.firewall_rules[0].dst_port, 8080);
    }
}

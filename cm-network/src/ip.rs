//! IP allocation.

use std::collections::HashSet;
use std::net::IpAddr;

use cm_proto::{CmError, CmResult, ErrorKind};
use ipnet::Ipv4Net;

/// Enumerates a subnet's usable host addresses in ascending order (excludes
/// the network and broadcast addresses for a `/31`-or-wider IPv4 net).
pub fn usable_hosts(subnet: &str) -> CmResult<Vec<IpAddr>> {
    let net: Ipv4Net = subnet
        .parse()
        .map_err(|e| CmError::wrap(ErrorKind::InvalidArgument, format!("invalid subnet '{subnet}'"), e))?;
    Ok(net.hosts().map(IpAddr::V4).collect())
}

/// Picks the lowest free IP in `subnet` not present in `in_use`.
pub fn allocate(subnet: &str, in_use: &HashSet<IpAddr>) -> CmResult<IpAddr> {
    usable_hosts(subnet)?
        .into_iter()
        .find(|ip| !in_use.contains(ip))
        .ok_or_else(|| CmError::new(ErrorKind::OutOfRange, format!("subnet {subnet} has no free addresses")))
}

/// Picks the first pool entry whose subnet isn't already assigned to an
/// existing network.
pub fn allocate_subnet(pool: &[Ipv4Net], used: &HashSet<String>) -> CmResult<Ipv4Net> {
    pool.iter()
        .copied()
        .find(|candidate| !used.contains(&candidate.to_string()))
        .ok_or_else(|| CmError::new(ErrorKind::OutOfRange, "subnet pool exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_skips_in_use_addresses_in_order() {
        let mut in_use = HashSet::new();
        in_use.insert("10.0.0.1".parse().unwrap());
        let ip = allocate("10.0.0.0/29", &in_use).unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn allocate_subnet_returns_first_unused_pool_entry() {
        let pool: Vec<Ipv4Net> = vec!["10.0.0.0/24".parse().unwrap(), "10.0.1.0/24".parse().unwrap()];
        let mut used = HashSet::new();
        used.insert("10.0.0.0/24".to_string());
        let picked = allocate_subnet(&pool, &used).unwrap();
        assert_eq!(picked.to_string(), "10.0.1.0/24");
    }
}

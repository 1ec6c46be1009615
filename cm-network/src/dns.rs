//! DNS zone rebuilding.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use cm_proto::domain::InstanceIdent;
use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::process::Command;

/// Reloads the resolver with a freshly built zone.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn reload(&self, zone: &str) -> CmResult<()>;
}

pub struct ZoneEntry {
    pub ip: IpAddr,
    pub names: Vec<String>,
}

/// Canonical name derived from the instance triple.
pub fn canonical_name(ident: &InstanceIdent) -> String {
    format!("{}.{}.{}", ident.instance, ident.subject_id, ident.item_id)
}

/// One `A` record per name, sorted for a stable diff between reloads.
pub fn build_zone(entries: &[ZoneEntry]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .flat_map(|entry| entry.names.iter().map(move |name| format!("{name} IN A {}", entry.ip)))
        .collect();
    lines.sort();
    lines.join("\n") + "\n"
}

/// Writes the zone file to disk and signals the resolver process to reload
/// it, the same external-process-signal pattern the route reconciler uses
/// for `ip route` (`mvirt-node::reconciler::route`).
pub struct FileDnsResolver {
    pub zone_path: PathBuf,
    pub reload_command: Vec<String>,
}

#[async_trait]
impl DnsResolver for FileDnsResolver {
    async fn reload(&self, zone: &str) -> CmResult<()> {
        tokio::fs::write(&self.zone_path, zone).await?;
        if let Some((cmd, args)) = self.reload_command.split_first() {
            let output = Command::new(cmd)
                .args(args)
                .output()
                .await
                .map_err(|e| CmError::wrap(ErrorKind::Failed, "spawning dns reload command", e))?;
            if !output.status.success() {
                return Err(CmError::new(
                    ErrorKind::Failed,
                    format!("dns reload command failed: {}", String::from_utf8_lossy(&output.stderr)),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_is_instance_dot_subject_dot_item() {
        let ident = InstanceIdent {
            item_id: "itemA".into(),
            subject_id: "subjectB".into(),
            instance: 3,
        };
        assert_eq!(canonical_name(&ident), "3.subjectB.itemA");
    }

    #[test]
    fn zone_lists_one_record_per_name_sorted() {
        let entries = vec![
            ZoneEntry { ip: "10.0.0.2".parse().unwrap(), names: vec!["b".into()] },
            ZoneEntry { ip: "10.0.0.1".parse().unwrap(), names: vec!["a".into()] },
        ];
        let zone = build_zone(&entries);
        assert_eq!(zone, "a IN A 10.0.0.1\nb IN A 10.0.0.2\n");
    }
}

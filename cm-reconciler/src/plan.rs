//! Pure planning functions for one reconciliation round. Kept free of I/O so the ordering and dependency rules can be
//! tested without a store or a network.

use std::collections::{HashMap, HashSet};

use cm_proto::domain::{InstanceIdent, InstanceInfo, NodeId, UpdateItem, UpdateItemType};
use cm_proto::sm::InstanceDelta;

/// `desired`/`current` items to install and to drop this round, `install`
/// already ordered components-then-layers-then-services.
pub struct ItemPlan {
    pub install: Vec<UpdateItem>,
    pub remove: Vec<UpdateItem>,
}

pub fn diff_items(desired: &[UpdateItem], current: &[UpdateItem]) -> ItemPlan {
    let current_keys: HashSet<(&str, &str)> =
        current.iter().map(|i| (i.item_id.as_str(), i.version.as_str())).collect();
    let desired_keys: HashSet<(&str, &str)> =
        desired.iter().map(|i| (i.item_id.as_str(), i.version.as_str())).collect();

    let mut install: Vec<UpdateItem> = desired
        .iter()
        .filter(|i| !current_keys.contains(&(i.item_id.as_str(), i.version.as_str())))
        .cloned()
        .collect();
    install.sort_by_key(type_rank);

    let remove: Vec<UpdateItem> = current
        .iter()
        .filter(|i| !desired_keys.contains(&(i.item_id.as_str(), i.version.as_str())))
        .cloned()
        .collect();

    ItemPlan { install, remove }
}

fn type_rank(item: &UpdateItem) -> u8 {
    match item.item_type {
        UpdateItemType::Component => 0,
        UpdateItemType::Layer => 1,
        UpdateItemType::Service => 2,
    }
}

/// Per-SM `stop[]`/`start[]` delta.
#[derive(Debug, Default, Clone)]
pub struct SmDelta {
    pub stop: Vec<InstanceDelta>,
    pub start: Vec<InstanceInfo>,
}

/// Outcome of diffing one node's instance set for a round.
#[derive(Default)]
pub struct InstanceDiff {
    pub per_sm: HashMap<String, SmDelta>,
    /// Desired-but-unroutable starts (no SM advertises the runtime).
    pub unroutable: Vec<InstanceIdent>,
    /// Idents with no desired entry left at all this round — the caller
    /// tears down their storage/state/network records entirely. Idents
    /// merely bumping version are stopped+started but kept out of this
    /// list since their on-disk state carries over.
    pub removed: Vec<InstanceIdent>,
}

/// Splits `desired`/`current` instances targeting `node_id` into per-SM
/// deltas, routing each instance by matching its `runtime` against the
/// runtimes an SM advertised in its `SmInfo`. An instance
/// whose runtime no SM advertises is skipped; the caller is expected to
/// surface that as a failed `InstanceStatus`.
pub fn diff_instances(
    desired: &[InstanceInfo],
    current: &[InstanceInfo],
    node_id: &NodeId,
    sm_runtimes: &HashMap<String, Vec<String>>,
) -> InstanceDiff {
    let mut diff = InstanceDiff::default();

    let desired_here: HashMap<&InstanceIdent, &InstanceInfo> =
        desired.iter().filter(|i| &i.target_node == node_id).map(|i| (&i.ident, i)).collect();
    let current_here: HashMap<&InstanceIdent, &InstanceInfo> =
        current.iter().filter(|i| &i.target_node == node_id).map(|i| (&i.ident, i)).collect();

    let mut starts: Vec<&InstanceInfo> = Vec::new();
    let mut replaced: HashSet<&InstanceIdent> = HashSet::new();
    for (ident, info) in &desired_here {
        match current_here.get(ident) {
            Some(existing) if existing.version == info.version => {}
            Some(_) => {
                starts.push(info);
                replaced.insert(ident);
            }
            None => starts.push(info),
        }
    }
    starts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.ident.to_string().cmp(&b.ident.to_string())));

    for info in starts {
        match sm_for_runtime(&info.runtime, sm_runtimes) {
            Some(sm_id) => diff.per_sm.entry(sm_id).or_default().start.push((*info).clone()),
            None => diff.unroutable.push(info.ident.clone()),
        }
    }

    for (ident, info) in &current_here {
        if !desired_here.contains_key(ident) || replaced.contains(ident) {
            if let Some(sm_id) = sm_for_runtime(&info.runtime, sm_runtimes) {
                diff.per_sm.entry(sm_id).or_default().stop.push(InstanceDelta {
                    ident: (*ident).clone(),
                    version: info.version.clone(),
                });
            }
            if !desired_here.contains_key(ident) {
                diff.removed.push((*ident).clone());
            }
        }
    }

    diff
}

/// Picks the lowest `sm_node_id` (deterministic) among SMs that advertised
/// `runtime`.
fn sm_for_runtime(runtime: &str, sm_runtimes: &HashMap<String, Vec<String>>) -> Option<String> {
    sm_runtimes
        .iter()
        .filter(|(_, runtimes)| runtimes.iter().any(|r| r == runtime))
        .map(|(sm_id, _)| sm_id.clone())
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cm_proto::domain::{ConnectionSpec, InstanceState, UpdateItemState};

    fn item(item_id: &str, version: &str, item_type: UpdateItemType) -> UpdateItem {
        UpdateItem {
            item_id: item_id.into(),
            item_type,
            version: version.into(),
            owner_id: "owner".into(),
            index_digest: format!("sha256:{item_id}"),
            state: UpdateItemState::Pending,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn install_plan_orders_components_before_layers_before_services() {
        let desired = vec![
            item("svcA", "1", UpdateItemType::Service),
            item("compA", "1", UpdateItemType::Component),
            item("layerA", "1", UpdateItemType::Layer),
        ];
        let plan = diff_items(&desired, &[]);
        let order: Vec<&str> = plan.install.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(order, vec!["compA", "layerA", "svcA"]);
    }

    #[test]
    fn items_already_current_are_not_reinstalled() {
        let current = vec![item("svcA", "1", UpdateItemType::Service)];
        let desired = current.clone();
        let plan = diff_items(&desired, &current);
        assert!(plan.install.is_empty());
        assert!(plan.remove.is_empty());
    }

    fn instance(item_id: &str, version: &str, priority: i32, runtime: &str, node: &str) -> InstanceInfo {
        InstanceInfo {
            ident: InstanceIdent { item_id: item_id.into(), subject_id: "subj".into(), instance: 0 },
            version: version.into(),
            manifest_digest: "sha256:x".into(),
            runtime: runtime.into(),
            target_node: NodeId(node.into()),
            uid: 1000,
            gid: 1000,
            priority,
            labels: vec![],
            env: HashMap::new(),
            network_id: None,
            exposed_ports: vec![],
            allowed_connections: Vec::<ConnectionSpec>::new(),
            monitoring_thresholds: None,
            state: InstanceState::Active,
            storage_quota: 0,
            state_quota: 0,
        }
    }

    #[test]
    fn starts_are_ordered_by_descending_priority() {
        let node = NodeId("node1".into());
        let mut runtimes = HashMap::new();
        runtimes.insert("sm-1".to_string(), vec!["docker".to_string()]);

        let desired = vec![
            instance("low", "1", 1, "docker", "node1"),
            instance("high", "1", 10, "docker", "node1"),
        ];
        let diff = diff_instances(&desired, &[], &node, &runtimes);
        assert!(diff.unroutable.is_empty());
        let starts = &diff.per_sm["sm-1"].start;
        assert_eq!(starts[0].ident.item_id, "high");
        assert_eq!(starts[1].ident.item_id, "low");
    }

    #[test]
    fn instance_dropped_from_desired_is_stopped_and_marked_removed() {
        let node = NodeId("node1".into());
        let mut runtimes = HashMap::new();
        runtimes.insert("sm-1".to_string(), vec!["docker".to_string()]);

        let current = vec![instance("svcA", "1", 5, "docker", "node1")];
        let diff = diff_instances(&[], &current, &node, &runtimes);
        assert_eq!(diff.per_sm["sm-1"].stop.len(), 1);
        assert_eq!(diff.per_sm["sm-1"].stop[0].ident.item_id, "svcA");
        assert_eq!(diff.removed, vec![InstanceIdent { item_id: "svcA".into(), subject_id: "subj".into(), instance: 0 }]);
    }

    #[test]
    fn version_bump_stops_the_old_version_without_marking_it_removed() {
        let node = NodeId("node1".into());
        let mut runtimes = HashMap::new();
        runtimes.insert("sm-1".to_string(), vec!["docker".to_string()]);

        let current = vec![instance("svcA", "1", 5, "docker", "node1")];
        let desired = vec![instance("svcA", "2", 5, "docker", "node1")];
        let diff = diff_instances(&desired, &current, &node, &runtimes);
        assert_eq!(diff.per_sm["sm-1"].stop.len(), 1);
        assert_eq!(diff.per_sm["sm-1"].stop[0].version, "1");
        assert_eq!(diff.per_sm["sm-1"].start.len(), 1);
        assert_eq!(diff.per_sm["sm-1"].start[0].version, "2");
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn instance_with_no_matching_sm_runtime_is_unroutable() {
        let node = NodeId("node1".into());
        let runtimes = HashMap::new();
        let desired = vec![instance("svcA", "1", 5, "docker", "node1")];
        let diff = diff_instances(&desired, &[], &node, &runtimes);
        assert!(diff.per_sm.is_empty());
        assert_eq!(diff.unroutable, vec![InstanceIdent { item_id: "svcA".into(), subject_id: "subj".into(), instance: 0 }]);
    }
}

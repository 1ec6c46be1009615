//! Builds the `NodeInfo` hello payload from the node's static
//! identity plus its live provisioning state.

use std::sync::Arc;

use cm_iam::NodeStateStore;
use cm_proto::domain::{NodeId, NodeInfo};
use cm_transport::NodeInfoSource;

pub struct LiveNodeInfo {
    node_id: NodeId,
    node_type: String,
    cpus: u32,
    ram_mb: u64,
    state: Arc<NodeStateStore>,
}

impl LiveNodeInfo {
    pub fn new(node_id: NodeId, node_type: String, cpus: u32, ram_mb: u64, state: Arc<NodeStateStore>) -> Self {
        Self { node_id, node_type, cpus, ram_mb, state }
    }
}

impl NodeInfoSource for LiveNodeInfo {
    fn current(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            node_type: self.node_type.clone(),
            state: self.state.current().state,
            cpus: self.cpus,
            ram_mb: self.ram_mb,
            partitions: Vec::new(),
            attributes: Default::default(),
        }
    }
}

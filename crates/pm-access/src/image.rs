//! Sweep image data model.
//!
//! An [`ImageData`] is one complete fabric snapshot: nodes indexed by LID,
//! their ports with raw and delta counters, the group and virtual fabric
//! tables, and link (neighbor) relationships. It is the *data* half of a ring
//! slot; the slot's lock and bookkeeping live in the store and are never
//! replaced when the data is.

use crate::counters::{PortCounters, VlCounters, STL_MAX_VLS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the implicit group containing every port.
pub const ALL_GROUP_NAME: &str = "All";

/// Maximum number of groups a port may belong to.
pub const PM_MAX_GROUPS_PER_PORT: usize = 8;

/// Name of the hidden virtual fabric that owns VL15.
pub const HIDDEN_VL15_VF: &str = "HIDDEN_VL15_VF";

/// VL mask of the hidden VL15 virtual fabric.
pub const HIDDEN_VL15_VL_MASK: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Switch,
    Fi,
}

/// Identity of a node, shared across every image that contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub guid: u64,
    pub node_desc: String,
    pub node_type: NodeType,
}

/// Link endpoint reference into the same image's LID map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub lid: u32,
    pub port_num: u8,
}

/// Outcome of the last sweep's counter query for a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    #[default]
    Ok,
    /// The port was not queried this sweep.
    Skip,
    /// The counter query failed (no response).
    FailQuery,
    /// Counters were read but clearing them failed.
    FailClear,
}

/// Membership of a port in one virtual fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfVlMap {
    /// Index into [`ImageData::vfs`].
    pub vf: usize,
    /// VLs the virtual fabric uses on this port.
    pub vl_mask: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmPort {
    pub port_num: u8,
    pub guid: u64,
    /// Per-lane signalling rate in Gb/s.
    pub lane_speed_gbps: u32,
    /// Active lanes.
    pub active_width: u8,
    /// Active MTU in bytes.
    pub mtu: u16,
    /// Neighbor as declared by the sweep; zero when there is no link.
    pub neighbor_lid: u32,
    pub neighbor_port_num: u8,
    /// Resolved neighbor within this image.
    pub neighbor: Option<PortRef>,
    pub initialized: bool,
    pub query_status: QueryStatus,
    pub unexpected_clear: bool,
    /// Indices into [`ImageData::groups`].
    pub groups: Vec<u8>,
    pub vf_vl_map: Vec<VfVlMap>,
    /// Raw counter values read this sweep.
    pub counters: PortCounters,
    /// Change since the previous sweep.
    pub delta: PortCounters,
    pub vl_counters: [VlCounters; STL_MAX_VLS],
    pub delta_vl: [VlCounters; STL_MAX_VLS],
}

impl PmPort {
    pub fn new(port_num: u8, guid: u64) -> Self {
        Self {
            port_num,
            guid,
            lane_speed_gbps: 25,
            active_width: 4,
            mtu: 8192,
            neighbor_lid: 0,
            neighbor_port_num: 0,
            neighbor: None,
            initialized: true,
            query_status: QueryStatus::Ok,
            unexpected_clear: false,
            groups: Vec::new(),
            vf_vl_map: Vec::new(),
            counters: PortCounters::default(),
            delta: PortCounters::default(),
            vl_counters: Default::default(),
            delta_vl: Default::default(),
        }
    }

    /// Link rate in Gb/s.
    pub fn rate_gbps(&self) -> u32 {
        self.lane_speed_gbps
            .saturating_mul(u32::from(self.active_width))
    }

    /// Link capacity in MB/s.
    pub fn max_mbps(&self) -> u64 {
        u64::from(self.rate_gbps()) * 1000 / 8
    }

    pub fn in_group(&self, group: u8) -> bool {
        self.groups.contains(&group)
    }

    pub fn in_vf(&self, vf: usize) -> bool {
        self.vf_vl_map.iter().any(|m| m.vf == vf && m.vl_mask != 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmNode {
    pub identity: Arc<NodeIdentity>,
    pub lid: u32,
    pub num_ports: u8,
    pub ports: BTreeMap<u8, PmPort>,
}

impl PmNode {
    pub fn new(identity: Arc<NodeIdentity>, lid: u32, num_ports: u8) -> Self {
        Self {
            identity,
            lid,
            num_ports,
            ports: BTreeMap::new(),
        }
    }

    pub fn guid(&self) -> u64 {
        self.identity.guid
    }

    pub fn node_desc(&self) -> &str {
        &self.identity.node_desc
    }

    pub fn is_switch(&self) -> bool {
        self.identity.node_type == NodeType::Switch
    }

    pub fn port(&self, port_num: u8) -> Option<&PmPort> {
        self.ports.get(&port_num)
    }

    pub fn port_mut(&mut self, port_num: u8) -> Option<&mut PmPort> {
        self.ports.get_mut(&port_num)
    }
}

/// Subnet manager summary captured with a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmInfo {
    pub lid: u32,
    pub port_guid: u64,
    pub priority: u8,
    pub state: u8,
}

/// Per-sweep error tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCounts {
    pub no_resp_nodes: u32,
    pub no_resp_ports: u32,
    pub skipped_nodes: u32,
    pub skipped_ports: u32,
    pub unexpected_clear_ports: u32,
    pub downgraded_ports: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfDescriptor {
    pub name: String,
    pub active: bool,
}

/// Group selector resolved against one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRef {
    All,
    Index(u8),
}

/// One fabric snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageData {
    pub sweep_num: u32,
    /// Sweep start, seconds since the epoch.
    pub sweep_start: u64,
    /// Sweep duration in microseconds.
    pub sweep_duration: u32,
    /// Seconds covered by this image's delta counters.
    pub image_interval: u32,
    pub counts: SweepCounts,
    pub sm_info: [SmInfo; 2],
    /// User-defined group names; a port's group index points here.
    pub groups: Vec<String>,
    pub vfs: Vec<VfDescriptor>,
    pub max_lid: u32,
    /// Nodes indexed by LID; entry 0 is always empty.
    pub lid_map: Vec<Option<PmNode>>,
}

impl ImageData {
    pub fn new(sweep_num: u32, sweep_start: u64, image_interval: u32) -> Self {
        Self {
            sweep_num,
            sweep_start,
            image_interval,
            lid_map: vec![None],
            ..Self::default()
        }
    }

    pub fn node(&self, lid: u32) -> Option<&PmNode> {
        self.lid_map.get(lid as usize).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, lid: u32) -> Option<&mut PmNode> {
        self.lid_map.get_mut(lid as usize).and_then(Option::as_mut)
    }

    pub fn find_port(&self, lid: u32, port_num: u8) -> Option<&PmPort> {
        self.node(lid).and_then(|n| n.port(port_num))
    }

    /// Looks up a node by GUID with a linear scan.
    pub fn find_node_by_guid(&self, guid: u64) -> Option<&PmNode> {
        self.nodes().find(|n| n.guid() == guid)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PmNode> {
        self.lid_map.iter().filter_map(Option::as_ref)
    }

    /// Every port of every node, in LID then port order.
    pub fn ports(&self) -> impl Iterator<Item = (&PmNode, &PmPort)> {
        self.nodes()
            .flat_map(|node| node.ports.values().map(move |port| (node, port)))
    }

    /// Resolved neighbor of `port`.
    pub fn neighbor(&self, port: &PmPort) -> Option<(&PmNode, &PmPort)> {
        let r = port.neighbor?;
        let node = self.node(r.lid)?;
        Some((node, node.port(r.port_num)?))
    }

    pub fn group_ref(&self, name: &str) -> Option<GroupRef> {
        if name == ALL_GROUP_NAME {
            return Some(GroupRef::All);
        }
        self.groups
            .iter()
            .position(|g| g == name)
            .and_then(|i| u8::try_from(i).ok())
            .map(GroupRef::Index)
    }

    pub fn vf_index(&self, name: &str) -> Option<usize> {
        self.vfs.iter().position(|vf| vf.name == name)
    }

    /// Installs `node` at its LID, growing the LID map as needed.
    pub fn insert_node(&mut self, node: PmNode) {
        let lid = node.lid as usize;
        if self.lid_map.len() <= lid {
            self.lid_map.resize_with(lid + 1, || None);
        }
        self.max_lid = self.max_lid.max(node.lid);
        self.lid_map[lid] = Some(node);
    }

    /// Records a link in both directions and resolves the neighbor refs.
    ///
    /// Returns `false` when either endpoint is missing.
    pub fn link(&mut self, a: PortRef, b: PortRef) -> bool {
        if self.find_port(a.lid, a.port_num).is_none()
            || self.find_port(b.lid, b.port_num).is_none()
        {
            return false;
        }
        for (from, to) in [(a, b), (b, a)] {
            if let Some(port) = self.node_mut(from.lid).and_then(|n| n.port_mut(from.port_num)) {
                port.neighbor_lid = to.lid;
                port.neighbor_port_num = to.port_num;
                port.neighbor = Some(to);
            }
        }
        true
    }

    pub fn num_switch_nodes(&self) -> u32 {
        self.nodes().filter(|n| n.is_switch()).count() as u32
    }

    pub fn num_fi_nodes(&self) -> u32 {
        self.nodes().filter(|n| !n.is_switch()).count() as u32
    }

    pub fn num_switch_ports(&self) -> u32 {
        self.ports()
            .filter(|(n, p)| n.is_switch() && p.port_num != 0)
            .count() as u32
    }

    pub fn num_fi_ports(&self) -> u32 {
        self.ports().filter(|(n, _)| !n.is_switch()).count() as u32
    }
}

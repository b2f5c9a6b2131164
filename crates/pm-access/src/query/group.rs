//! Group queries: list, aggregate statistics, configuration, node and link
//! listings.

use super::focus::{neighbor_status, port_status, FocusStatus};
use super::{check_name, group_membership, lookup_group, Membership};
use crate::error::{PaError, Result};
use crate::image::{ImageData, NodeType, PmNode, PmPort, QueryStatus, ALL_GROUP_NAME};
use crate::image_id::{ImageIdQuery, ReturnedImageId};
use crate::metrics::{self, MetricContext};
use crate::store::PmStore;
use fm_common::config::ErrorThresholds;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Utilization histogram buckets, 10% each.
pub const UTIL_BUCKETS: usize = 10;

/// Error histogram buckets, 25% of the category threshold each; the last one
/// collects everything at or above the threshold.
pub const ERR_BUCKETS: usize = 5;

/// Bandwidth and packet-rate statistics over a set of ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UtilStats {
    pub total_mbps: u64,
    pub total_kpps: u64,
    pub avg_mbps: u32,
    pub min_mbps: u32,
    pub max_mbps: u32,
    pub avg_kpps: u32,
    pub min_kpps: u32,
    pub max_kpps: u32,
    /// Ports by transmit utilization, 10% per bucket.
    pub buckets: [u32; UTIL_BUCKETS],
    /// Ports whose counters could not be read; saturates.
    pub pma_no_resp_ports: u16,
    /// Ports with no known link partner; saturates.
    pub topo_incomp_ports: u16,
    #[serde(skip)]
    samples: u32,
}

impl UtilStats {
    pub(crate) fn add(&mut self, mbps: u64, kpps: u64, util_pct10: u64) {
        let mbps32 = u32::try_from(mbps).unwrap_or(u32::MAX);
        let kpps32 = u32::try_from(kpps).unwrap_or(u32::MAX);
        if self.samples == 0 {
            self.min_mbps = mbps32;
            self.min_kpps = kpps32;
        } else {
            self.min_mbps = self.min_mbps.min(mbps32);
            self.min_kpps = self.min_kpps.min(kpps32);
        }
        self.max_mbps = self.max_mbps.max(mbps32);
        self.max_kpps = self.max_kpps.max(kpps32);
        self.total_mbps = self.total_mbps.saturating_add(mbps);
        self.total_kpps = self.total_kpps.saturating_add(kpps);
        let bucket = usize::try_from(util_pct10 / 100)
            .unwrap_or(UTIL_BUCKETS - 1)
            .min(UTIL_BUCKETS - 1);
        self.buckets[bucket] += 1;
        self.samples += 1;
    }

    pub(crate) fn note_no_response(&mut self) {
        self.pma_no_resp_ports = self.pma_no_resp_ports.saturating_add(1);
    }

    pub(crate) fn note_topology_incomplete(&mut self) {
        self.topo_incomp_ports = self.topo_incomp_ports.saturating_add(1);
    }

    pub(crate) fn finalize(&mut self) {
        if self.samples > 0 {
            let n = u64::from(self.samples);
            self.avg_mbps = u32::try_from(self.total_mbps / n).unwrap_or(u32::MAX);
            self.avg_kpps = u32::try_from(self.total_kpps / n).unwrap_or(u32::MAX);
        }
    }
}

/// Worst value seen per error category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrSummary {
    pub integrity: u64,
    pub congestion: u64,
    pub sma_congestion: u64,
    pub bubble: u64,
    pub security: u64,
    pub routing: u64,
}

impl ErrSummary {
    pub(crate) fn of_port(port: &PmPort, ctx: &MetricContext<'_>) -> Self {
        Self {
            integrity: metrics::integrity(port, ctx),
            congestion: metrics::congestion(port, ctx),
            sma_congestion: metrics::sma_congestion(port, ctx),
            bubble: metrics::bubble(port, ctx),
            security: metrics::security(port, ctx),
            routing: metrics::routing(port, ctx),
        }
    }

    fn max(self, other: Self) -> Self {
        Self {
            integrity: self.integrity.max(other.integrity),
            congestion: self.congestion.max(other.congestion),
            sma_congestion: self.sma_congestion.max(other.sma_congestion),
            bubble: self.bubble.max(other.bubble),
            security: self.security.max(other.security),
            routing: self.routing.max(other.routing),
        }
    }
}

/// Error statistics: per-category maxima and threshold histograms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrStats {
    pub max: ErrSummary,
    pub integrity_buckets: [u32; ERR_BUCKETS],
    pub congestion_buckets: [u32; ERR_BUCKETS],
    pub sma_congestion_buckets: [u32; ERR_BUCKETS],
    pub bubble_buckets: [u32; ERR_BUCKETS],
    pub security_buckets: [u32; ERR_BUCKETS],
    pub routing_buckets: [u32; ERR_BUCKETS],
}

fn err_bucket(value: u64, threshold: u32) -> usize {
    if threshold == 0 {
        return if value == 0 { 0 } else { ERR_BUCKETS - 1 };
    }
    let quarter = value.saturating_mul(4) / u64::from(threshold);
    usize::try_from(quarter)
        .unwrap_or(ERR_BUCKETS - 1)
        .min(ERR_BUCKETS - 1)
}

impl ErrStats {
    pub(crate) fn add(&mut self, errs: ErrSummary, thresholds: &ErrorThresholds) {
        self.max = self.max.max(errs);
        self.integrity_buckets[err_bucket(errs.integrity, thresholds.integrity)] += 1;
        self.congestion_buckets[err_bucket(errs.congestion, thresholds.congestion)] += 1;
        self.sma_congestion_buckets[err_bucket(errs.sma_congestion, thresholds.sma_congestion)] +=
            1;
        self.bubble_buckets[err_bucket(errs.bubble, thresholds.bubble)] += 1;
        self.security_buckets[err_bucket(errs.security, thresholds.security)] += 1;
        self.routing_buckets[err_bucket(errs.routing, thresholds.routing)] += 1;
    }
}

/// Min/max link rate in Gb/s over a set of ports (0 when the set is empty).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RateRange {
    pub min: u32,
    pub max: u32,
    seen: bool,
}

impl RateRange {
    pub fn add(&mut self, rate: u32) {
        if self.seen {
            self.min = self.min.min(rate);
        } else {
            self.min = rate;
            self.seen = true;
        }
        self.max = self.max.max(rate);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub num_int_ports: u32,
    pub num_ext_ports: u32,
    pub int_util: UtilStats,
    pub send_util: UtilStats,
    pub recv_util: UtilStats,
    pub int_err: ErrStats,
    pub ext_err: ErrStats,
    pub min_int_rate: u32,
    pub max_int_rate: u32,
    pub min_ext_rate: u32,
    pub max_ext_rate: u32,
}

/// One port of a group or virtual fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConfig {
    pub lid: u32,
    pub port_num: u8,
    pub guid: u64,
    pub node_desc: String,
}

impl PortConfig {
    pub(crate) fn new(node: &PmNode, port: &PmPort) -> Self {
        Self {
            lid: node.lid,
            port_num: port.port_num,
            guid: node.guid(),
            node_desc: node.node_desc().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupConfig {
    pub name: String,
    pub ports: Vec<PortConfig>,
}

/// Node selection for [`PmStore::get_group_node_info`]. Empty fields match
/// every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfoFilter {
    pub guid: Option<u64>,
    pub lid: Option<u32>,
    pub node_desc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub lid: u32,
    pub guid: u64,
    pub node_desc: String,
    pub node_type: NodeType,
    /// Bit `n % 64` of word `n / 64` is set when port `n` is in the group.
    pub port_select_mask: [u64; 4],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupNodeInfo {
    pub name: String,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub from_lid: u32,
    pub from_port: u8,
    pub to_lid: u32,
    pub to_port: u8,
    pub mtu: u16,
    pub lane_speed_gbps: u32,
    pub active_width: u8,
    pub local_status: FocusStatus,
    pub neighbor_status: FocusStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupLinkInfo {
    pub name: String,
    pub links: Vec<LinkInfo>,
}

/// Nodes in `[start, end]` LID order.
fn nodes_in_range(image: &ImageData, start: u32, end: u32) -> impl Iterator<Item = &PmNode> {
    image
        .nodes()
        .filter(move |n| n.lid >= start && n.lid <= end)
}

impl PmStore {
    /// Names of every group in the image, `All` first.
    pub fn get_group_list(&self, query: &ImageIdQuery) -> Result<(Vec<String>, ReturnedImageId)> {
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let mut names = Vec::new();
        names.try_reserve(image.groups.len() + 1)?;
        names.push(ALL_GROUP_NAME.to_string());
        names.extend(image.groups.iter().cloned());
        Ok((names, returned))
    }

    /// Aggregate utilization and error statistics for a group.
    pub fn get_group_info(
        &self,
        group_name: &str,
        query: &ImageIdQuery,
    ) -> Result<(GroupInfo, ReturnedImageId)> {
        check_name("group", group_name)?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;
        let ctx = self.metric_context(&image);
        let thresholds = &self.config.thresholds;

        let mut info = GroupInfo {
            name: group_name.to_string(),
            ..GroupInfo::default()
        };
        let mut int_rate = RateRange::default();
        let mut ext_rate = RateRange::default();

        for (_, port) in image.ports() {
            let Some(membership) = group_membership(&image, port, group) else {
                continue;
            };
            let neighbor = image.neighbor(port);
            match membership {
                Membership::Internal => {
                    if port.query_status != QueryStatus::Ok {
                        info.int_util.note_no_response();
                    }
                    info.num_int_ports += 1;
                    info.int_util.add(
                        metrics::send_mbps(port, &ctx),
                        metrics::send_kpps(port, &ctx),
                        metrics::util_pct10(port, &ctx),
                    );
                    info.int_err.add(ErrSummary::of_port(port, &ctx), thresholds);
                    int_rate.add(port.rate_gbps());
                    if neighbor.is_none() && port.port_num != 0 {
                        info.int_util.note_topology_incomplete();
                    }
                }
                Membership::External => {
                    if port.query_status != QueryStatus::Ok {
                        info.send_util.note_no_response();
                    }
                    info.num_ext_ports += 1;
                    match neighbor {
                        None => info.recv_util.note_topology_incomplete(),
                        Some((_, peer)) if peer.query_status != QueryStatus::Ok => {
                            info.recv_util.note_no_response()
                        }
                        Some(_) => {}
                    }
                    info.send_util.add(
                        metrics::send_mbps(port, &ctx),
                        metrics::send_kpps(port, &ctx),
                        metrics::util_pct10(port, &ctx),
                    );
                    let recv_mbps = metrics::recv_mbps(port, &ctx);
                    info.recv_util.add(
                        recv_mbps,
                        metrics::recv_kpps(port, &ctx),
                        recv_mbps.saturating_mul(1000) / port.max_mbps().max(1),
                    );
                    // Errors on a link are charged to both ends.
                    let mut errs = ErrSummary::of_port(port, &ctx);
                    if let Some((_, peer)) = neighbor {
                        errs = errs.max(ErrSummary::of_port(peer, &ctx));
                    }
                    info.ext_err.add(errs, thresholds);
                    ext_rate.add(port.rate_gbps());
                }
            }
        }
        info.int_util.finalize();
        info.send_util.finalize();
        info.recv_util.finalize();
        info.min_int_rate = int_rate.min;
        info.max_int_rate = int_rate.max;
        info.min_ext_rate = ext_rate.min;
        info.max_ext_rate = ext_rate.max;
        debug!(
            group = group_name,
            internal = info.num_int_ports,
            external = info.num_ext_ports,
            "Group info computed"
        );
        Ok((info, returned))
    }

    /// Ports belonging to a group.
    pub fn get_group_config(
        &self,
        group_name: &str,
        query: &ImageIdQuery,
    ) -> Result<(GroupConfig, ReturnedImageId)> {
        check_name("group", group_name)?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;

        let mut ports = Vec::new();
        for (node, port) in image.ports() {
            if group_membership(&image, port, group).is_some() {
                ports.try_reserve(1)?;
                ports.push(PortConfig::new(node, port));
            }
        }
        if ports.is_empty() {
            info!(group = group_name, "Group has no ports");
        }
        Ok((
            GroupConfig {
                name: group_name.to_string(),
                ports,
            },
            returned,
        ))
    }

    /// Nodes with at least one port in the group, optionally narrowed by
    /// GUID, LID and node description.
    ///
    /// When both a LID and a GUID are given they must name the same node.
    /// A filter that matches nothing yields an empty list, not an error.
    pub fn get_group_node_info(
        &self,
        group_name: &str,
        filter: &NodeInfoFilter,
        query: &ImageIdQuery,
    ) -> Result<(GroupNodeInfo, ReturnedImageId)> {
        check_name("group", group_name)?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;

        let mut result = GroupNodeInfo {
            name: group_name.to_string(),
            nodes: Vec::new(),
        };
        let desc = filter.node_desc.as_deref().filter(|d| !d.is_empty());

        let mut selected: Option<&PmNode> = None;
        if let Some(guid) = filter.guid {
            selected = image.find_node_by_guid(guid);
        }
        if let Some(lid) = filter.lid {
            selected = image.node(lid);
            if let Some(guid) = filter.guid {
                if selected.map(|n| n.guid()) != Some(guid) {
                    warn!(lid, guid, "No node matches both LID and GUID");
                    return Ok((result, returned));
                }
            }
        }
        if (filter.lid.is_some() || filter.guid.is_some()) && selected.is_none() {
            warn!(lid = ?filter.lid, guid = ?filter.guid, "No node matches LID or GUID");
            return Ok((result, returned));
        }
        if let (Some(node), Some(desc)) = (selected, desc) {
            if node.node_desc() != desc {
                warn!(node_desc = desc, "No node matches node description");
                return Ok((result, returned));
            }
        }

        let (start, end) = match selected {
            Some(node) => (node.lid, node.lid),
            None => (1, image.max_lid),
        };
        for node in nodes_in_range(&image, start, end) {
            if desc.is_some_and(|d| node.node_desc() != d) {
                continue;
            }
            let mut mask = [0u64; 4];
            for port in node.ports.values() {
                if group_membership(&image, port, group).is_some() {
                    let p = usize::from(port.port_num);
                    mask[p / 64] |= 1 << (p % 64);
                }
            }
            if mask.iter().all(|&w| w == 0) {
                continue;
            }
            result.nodes.try_reserve(1)?;
            result.nodes.push(NodeInfo {
                lid: node.lid,
                guid: node.guid(),
                node_desc: node.node_desc().to_string(),
                node_type: node.identity.node_type,
                port_select_mask: mask,
            });
        }
        if result.nodes.is_empty() {
            warn!(group = group_name, "Group node info found no nodes");
        }
        Ok((result, returned))
    }

    /// Links with a group port on at least one end.
    ///
    /// Without `input_lid` every link is reported once, by its lower-LID
    /// end when both ends are in the group. With `input_lid`, `input_port`
    /// selects one port; 0 or [`super::PM_ALL_PORT_SELECT`] selects all.
    pub fn get_group_link_info(
        &self,
        group_name: &str,
        input_lid: Option<u32>,
        input_port: u8,
        query: &ImageIdQuery,
    ) -> Result<(GroupLinkInfo, ReturnedImageId)> {
        check_name("group", group_name)?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;

        let single_port = match (input_lid, input_port) {
            (Some(_), 0) | (Some(_), super::PM_ALL_PORT_SELECT) | (None, _) => None,
            (Some(_), port) => Some(port),
        };
        let (start, end) = match input_lid {
            Some(lid) => (lid, lid),
            None => (1, image.max_lid),
        };

        let mut result = GroupLinkInfo {
            name: group_name.to_string(),
            links: Vec::new(),
        };
        for node in nodes_in_range(&image, start, end) {
            let (first, last) = single_port.map_or((1, node.num_ports), |p| (p, p));
            if last > node.num_ports {
                warn!(
                    end_port = last,
                    num_ports = node.num_ports,
                    "End port is greater than the number of ports"
                );
                return Err(PaError::invalid(format!(
                    "port {} exceeds the {} ports of LID {:#06x}",
                    last, node.num_ports, node.lid
                )));
            }
            for port in node.ports.range(first..=last).map(|(_, p)| p) {
                let Some(membership) = group_membership(&image, port, group) else {
                    continue;
                };
                if input_lid.is_none() && membership.is_internal() && node.lid > port.neighbor_lid {
                    continue;
                }
                if port.neighbor.is_none() {
                    continue;
                }
                result.links.try_reserve(1)?;
                result.links.push(LinkInfo {
                    from_lid: node.lid,
                    from_port: port.port_num,
                    to_lid: port.neighbor_lid,
                    to_port: port.neighbor_port_num,
                    mtu: port.mtu,
                    lane_speed_gbps: port.lane_speed_gbps,
                    active_width: port.active_width,
                    local_status: port_status(port),
                    neighbor_status: neighbor_status(&image, port),
                });
            }
        }
        if result.links.is_empty() {
            info!(group = group_name, "Group has no links");
        }
        Ok((result, returned))
    }
}

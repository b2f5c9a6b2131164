//! Focus queries: the ports of a group or virtual fabric ranked, filtered or
//! selected by status.
//!
//! A link whose two ends are both in scope is reported once, by its lower-LID
//! end; the other end appears as the entry's neighbor.

use super::{check_name, group_membership, lookup_group, lookup_vf, vf_membership, Membership};
use crate::error::{PaError, Result};
use crate::image::{ImageData, PmNode, PmPort, QueryStatus};
use crate::image_id::{ImageIdQuery, ReturnedImageId};
use crate::metrics::{self, MetricContext, VfSelector};
use crate::store::PmStore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// Upper bound on the tuples of a multi-focus query.
pub const MAX_NUM_FOCUS_PORT_TUPLES: usize = 8;

type MetricFn = fn(&PmPort, &MetricContext<'_>) -> u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FocusSelect {
    UtilHigh,
    UtilPktsHigh,
    UtilLow,
    Integrity,
    Congestion,
    SmaCongestion,
    Bubble,
    Security,
    Routing,
    VfUtilHigh,
    VfUtilPktsHigh,
    VfUtilLow,
    VfCongestion,
    VfBubble,
    UnexpectedClear,
    NoResponse,
    Skipped,
}

impl FocusSelect {
    /// Metric ranked by this select, `None` for the status selects.
    pub fn metric(self) -> Option<MetricFn> {
        let f: MetricFn = match self {
            FocusSelect::UtilHigh | FocusSelect::UtilLow => metrics::util_pct10,
            FocusSelect::UtilPktsHigh => metrics::send_kpps,
            FocusSelect::Integrity => metrics::integrity,
            FocusSelect::Congestion => metrics::congestion,
            FocusSelect::SmaCongestion => metrics::sma_congestion,
            FocusSelect::Bubble => metrics::bubble,
            FocusSelect::Security => metrics::security,
            FocusSelect::Routing => metrics::routing,
            FocusSelect::VfUtilHigh | FocusSelect::VfUtilLow => metrics::vf_util_pct10,
            FocusSelect::VfUtilPktsHigh => metrics::vf_send_kpps,
            FocusSelect::VfCongestion => metrics::vf_congestion,
            FocusSelect::VfBubble => metrics::vf_bubble,
            FocusSelect::UnexpectedClear | FocusSelect::NoResponse | FocusSelect::Skipped => {
                return None
            }
        };
        Some(f)
    }

    /// Low-utilization selects rank ascending; everything else descending.
    pub fn is_ascending(self) -> bool {
        matches!(self, FocusSelect::UtilLow | FocusSelect::VfUtilLow)
    }

    pub fn is_vf(self) -> bool {
        matches!(
            self,
            FocusSelect::VfUtilHigh
                | FocusSelect::VfUtilPktsHigh
                | FocusSelect::VfUtilLow
                | FocusSelect::VfCongestion
                | FocusSelect::VfBubble
        )
    }

    /// Port status matched by a status select.
    pub fn status(self) -> Option<FocusStatus> {
        match self {
            FocusSelect::UnexpectedClear => Some(FocusStatus::UnexpectedClear),
            FocusSelect::NoResponse => Some(FocusStatus::PmaFailure),
            FocusSelect::Skipped => Some(FocusStatus::PmaIgnore),
            _ => None,
        }
    }

    /// Selects accepted by multi-focus tuples.
    fn is_multi(self) -> bool {
        self.metric().is_some() && !self.is_vf() && self != FocusSelect::UtilLow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusComparator {
    GE,
    LE,
    GT,
    LT,
}

impl FocusComparator {
    pub fn compare(self, value: u64, threshold: u64) -> bool {
        match self {
            FocusComparator::GE => value >= threshold,
            FocusComparator::LE => value <= threshold,
            FocusComparator::GT => value > threshold,
            FocusComparator::LT => value < threshold,
        }
    }
}

/// How multi-focus tuples combine. `Invalid` is only accepted with a single
/// tuple, where it behaves as `Or`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusOperator {
    #[default]
    Invalid,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusTuple {
    pub select: FocusSelect,
    pub comparator: FocusComparator,
    pub threshold: u64,
}

/// Health of one end of a link as seen by the last sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FocusStatus {
    #[default]
    Ok,
    /// The port was deliberately not queried.
    PmaIgnore,
    /// The port did not answer the counter query.
    PmaFailure,
    /// The link partner is unknown.
    TopoFailure,
    UnexpectedClear,
}

pub(crate) fn port_status(port: &PmPort) -> FocusStatus {
    match port.query_status {
        QueryStatus::Skip => FocusStatus::PmaIgnore,
        QueryStatus::FailQuery => FocusStatus::PmaFailure,
        QueryStatus::Ok | QueryStatus::FailClear if port.unexpected_clear => {
            FocusStatus::UnexpectedClear
        }
        QueryStatus::Ok | QueryStatus::FailClear => FocusStatus::Ok,
    }
}

/// Status of the far end of `port`'s link. Switch port 0 has no link and
/// always reports `Ok`.
pub(crate) fn neighbor_status(image: &ImageData, port: &PmPort) -> FocusStatus {
    if port.port_num == 0 {
        return FocusStatus::Ok;
    }
    match image.neighbor(port) {
        Some((_, peer)) => port_status(peer),
        None => FocusStatus::TopoFailure,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FocusPortDetail {
    pub lid: u32,
    pub port_num: u8,
    pub rate_gbps: u32,
    pub mtu: u16,
    pub guid: u64,
    pub node_desc: String,
    pub local_status: FocusStatus,
    pub value: u64,
    pub neighbor_lid: u32,
    pub neighbor_port_num: u8,
    pub neighbor_guid: u64,
    pub neighbor_node_desc: String,
    pub neighbor_status: FocusStatus,
    pub neighbor_value: u64,
}

impl FocusPortDetail {
    fn new(image: &ImageData, node: &PmNode, port: &PmPort, value: u64, neighbor_value: u64) -> Self {
        let mut detail = Self {
            lid: node.lid,
            port_num: port.port_num,
            rate_gbps: port.rate_gbps(),
            mtu: port.mtu,
            guid: node.guid(),
            node_desc: node.node_desc().to_string(),
            local_status: port_status(port),
            value,
            neighbor_status: neighbor_status(image, port),
            ..Self::default()
        };
        if port.port_num != 0 {
            if let Some((peer_node, peer)) = image.neighbor(port) {
                detail.neighbor_lid = peer_node.lid;
                detail.neighbor_port_num = peer.port_num;
                detail.neighbor_guid = peer_node.guid();
                detail.neighbor_node_desc = peer_node.node_desc().to_string();
                detail.neighbor_value = neighbor_value;
            }
        }
        detail
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FocusPorts {
    /// Group or virtual fabric name.
    pub name: String,
    pub select: FocusSelect,
    pub ports: Vec<FocusPortDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiFocusPortDetail {
    pub detail: FocusPortDetail,
    /// One value per tuple, in tuple order.
    pub values: Vec<u64>,
    pub neighbor_values: Vec<u64>,
}

/// Whether a multi-focus scan visited every port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MultiFocusCompletion {
    #[default]
    Complete,
    /// The window filled before the scan ended; more matches may exist.
    Early,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiFocusPorts {
    pub name: String,
    pub ports: Vec<MultiFocusPortDetail>,
    pub completion: MultiFocusCompletion,
}

/// A ranked port before windowing.
struct FocusItem<'a> {
    node: &'a PmNode,
    port: &'a PmPort,
    value: u64,
    neighbor_value: u64,
}

impl FocusItem<'_> {
    fn key(&self, ascending: bool) -> u64 {
        if ascending {
            self.value.min(self.neighbor_value)
        } else {
            self.value.max(self.neighbor_value)
        }
    }
}

fn compare_items(a: &FocusItem<'_>, b: &FocusItem<'_>, ascending: bool) -> Ordering {
    let by_value = if ascending {
        a.key(true).cmp(&b.key(true))
    } else {
        b.key(false).cmp(&a.key(false))
    };
    by_value.then(a.node.lid.cmp(&b.node.lid))
}

fn check_window(start: u32, range: u32, subnet_size: u32) -> Result<()> {
    if range == 0 || range > subnet_size {
        warn!(range, subnet_size, "Illegal range parameter");
        return Err(PaError::invalid(format!(
            "range {} must be between 1 and {}",
            range, subnet_size
        )));
    }
    debug!(start, range, "Focus window");
    Ok(())
}

/// Metric for a ranking select; VF selects only when `allow_vf`.
fn ranking_metric(select: FocusSelect, allow_vf: bool) -> Result<MetricFn> {
    match select.metric() {
        Some(metric) if allow_vf || !select.is_vf() => Ok(metric),
        _ => {
            warn!(?select, "Illegal select parameter");
            Err(PaError::invalid(format!("select {:?} is not supported", select)))
        }
    }
}

fn check_status_select(select: FocusSelect) -> Result<FocusStatus> {
    select.status().ok_or_else(|| {
        warn!(?select, "Illegal select parameter");
        PaError::invalid(format!("select {:?} is not a status select", select))
    })
}

/// Sorts `items` and returns the `[start, start + range)` window.
fn rank_window(
    image: &ImageData,
    mut items: Vec<FocusItem<'_>>,
    select: FocusSelect,
    start: u32,
    range: u32,
) -> Result<Vec<FocusPortDetail>> {
    let ascending = select.is_ascending();
    items.sort_by(|a, b| compare_items(a, b, ascending));
    let start = start as usize;
    let end = items.len().min(start.saturating_add(range as usize));
    let mut ports = Vec::new();
    if start >= end {
        return Ok(ports);
    }
    ports.try_reserve(end - start)?;
    ports.extend(items[start..end].iter().map(|item| {
        FocusPortDetail::new(image, item.node, item.port, item.value, item.neighbor_value)
    }));
    Ok(ports)
}

fn collect_items<'a>(
    image: &'a ImageData,
    metric: MetricFn,
    ctx: &MetricContext<'_>,
    mut membership: impl FnMut(&PmPort) -> Option<Membership>,
) -> Result<Vec<FocusItem<'a>>> {
    let mut items = Vec::new();
    for (node, port) in image.ports() {
        let Some(m) = membership(port) else {
            continue;
        };
        if m.is_internal() && port.port_num != 0 && node.lid > port.neighbor_lid {
            continue;
        }
        let neighbor_value = image
            .neighbor(port)
            .map_or(0, |(_, peer)| metric(peer, ctx));
        items.try_reserve(1)?;
        items.push(FocusItem {
            node,
            port,
            value: metric(port, ctx),
            neighbor_value,
        });
    }
    Ok(items)
}

/// Whether a status-select scan reports `port`.
fn ext_focus_match(image: &ImageData, node: &PmNode, port: &PmPort, wanted: FocusStatus) -> bool {
    if port_status(port) != wanted {
        return false;
    }
    if neighbor_status(image, port) != wanted {
        return true;
    }
    image
        .neighbor(port)
        .is_some_and(|(peer_node, _)| node.lid < peer_node.lid)
}

fn ext_window(
    image: &ImageData,
    wanted: FocusStatus,
    start: u32,
    range: u32,
    mut in_scope: impl FnMut(&PmPort) -> bool,
) -> Result<Vec<FocusPortDetail>> {
    let mut matches = Vec::new();
    for (node, port) in image.ports() {
        if in_scope(port) && ext_focus_match(image, node, port, wanted) {
            matches.try_reserve(1)?;
            matches.push(FocusPortDetail::new(image, node, port, 0, 0));
        }
    }
    if matches.is_empty() {
        info!(status = ?wanted, "No matching records");
        return Ok(matches);
    }
    let start = start as usize;
    if start >= matches.len() {
        warn!(
            start,
            available = matches.len(),
            "Illegal start parameter: exceeds range of available entries"
        );
        return Err(PaError::invalid(format!(
            "start {} exceeds the {} matching ports",
            start,
            matches.len()
        )));
    }
    let end = matches.len().min(start.saturating_add(range as usize));
    matches.truncate(end);
    matches.drain(..start);
    Ok(matches)
}

impl PmStore {
    /// Ports of a group ranked by `select`, windowed to `[start, start + range)`.
    ///
    /// High selects rank by the worse end of the link, descending; low
    /// utilization ranks by the lesser end, ascending. Ties go to the lower
    /// LID. An empty group or a start past the end yields no ports.
    pub fn get_focus_ports(
        &self,
        group_name: &str,
        select: FocusSelect,
        start: u32,
        range: u32,
        query: &ImageIdQuery,
    ) -> Result<(FocusPorts, ReturnedImageId)> {
        check_name("group", group_name)?;
        check_window(start, range, self.config.subnet_size)?;
        let metric = ranking_metric(select, false)?;

        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;
        let ctx = self.metric_context(&image);

        let items = collect_items(&image, metric, &ctx, |port| {
            group_membership(&image, port, group)
        })?;
        if items.is_empty() {
            info!(group = group_name, "Group has no ports to focus on");
        }
        let ports = rank_window(&image, items, select, start, range)?;
        Ok((
            FocusPorts {
                name: group_name.to_string(),
                select,
                ports,
            },
            returned,
        ))
    }

    /// Ports of a virtual fabric ranked by `select`; accepts the VF selects
    /// in addition to the port-level ones.
    pub fn get_vf_focus_ports(
        &self,
        vf_name: &str,
        select: FocusSelect,
        start: u32,
        range: u32,
        query: &ImageIdQuery,
    ) -> Result<(FocusPorts, ReturnedImageId)> {
        self.require_vl_counters("VF focus ports")?;
        check_name("VF", vf_name)?;
        check_window(start, range, self.config.subnet_size)?;
        let metric = ranking_metric(select, true)?;

        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let vf = lookup_vf(&image, vf_name)?;
        let ctx = self.metric_context(&image).with_vf(VfSelector::Index(vf));

        let items = collect_items(&image, metric, &ctx, |port| vf_membership(&image, port, vf))?;
        let ports = rank_window(&image, items, select, start, range)?;
        Ok((
            FocusPorts {
                name: vf_name.to_string(),
                select,
                ports,
            },
            returned,
        ))
    }

    /// Ports of a group satisfying a combination of threshold tuples, in scan
    /// order. Stops early once `start + range` matches have been seen.
    pub fn get_multi_focus_ports(
        &self,
        group_name: &str,
        start: u32,
        range: u32,
        tuples: &[FocusTuple],
        operator: FocusOperator,
        query: &ImageIdQuery,
    ) -> Result<(MultiFocusPorts, ReturnedImageId)> {
        check_name("group", group_name)?;
        check_window(start, range, self.config.subnet_size)?;
        if tuples.is_empty() || tuples.len() > MAX_NUM_FOCUS_PORT_TUPLES {
            warn!(tuples = tuples.len(), "Illegal number of focus tuples");
            return Err(PaError::invalid(format!(
                "{} tuples given, 1 to {} allowed",
                tuples.len(),
                MAX_NUM_FOCUS_PORT_TUPLES
            )));
        }
        if operator == FocusOperator::Invalid && tuples.len() > 1 {
            warn!(tuples = tuples.len(), "Logical operator required for multiple tuples");
            return Err(PaError::invalid("logical operator required for multiple tuples"));
        }
        let mut compiled = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            match tuple.select.metric() {
                Some(metric) if tuple.select.is_multi() => compiled.push((metric, *tuple)),
                _ => {
                    warn!(select = ?tuple.select, "Illegal select parameter in focus tuple");
                    return Err(PaError::invalid(format!(
                        "select {:?} is not supported in a focus tuple",
                        tuple.select
                    )));
                }
            }
        }

        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;
        let ctx = self.metric_context(&image);

        let mut result = MultiFocusPorts {
            name: group_name.to_string(),
            ..MultiFocusPorts::default()
        };
        let window_end = u64::from(start) + u64::from(range);
        let mut counter = 0u64;
        for (node, port) in image.ports() {
            let Some(membership) = group_membership(&image, port, group) else {
                continue;
            };
            if membership.is_internal() && node.lid > port.neighbor_lid {
                continue;
            }
            let peer = image.neighbor(port).map(|(_, p)| p);
            let Some((values, neighbor_values)) =
                evaluate_tuples(port, peer, membership, &compiled, operator, &ctx)
            else {
                continue;
            };
            if counter >= window_end {
                result.completion = MultiFocusCompletion::Early;
                break;
            }
            counter += 1;
            if counter <= u64::from(start) {
                continue;
            }
            result.ports.try_reserve(1)?;
            result.ports.push(MultiFocusPortDetail {
                detail: FocusPortDetail::new(&image, node, port, values[0], neighbor_values[0]),
                values,
                neighbor_values,
            });
        }
        debug!(
            group = group_name,
            matched = counter,
            completion = ?result.completion,
            "Multi-focus scan finished"
        );
        Ok((result, returned))
    }

    /// Ports of a group whose query status matches a status select.
    ///
    /// No match is success with no ports; a start past the matches is
    /// invalid.
    pub fn get_ext_focus_ports(
        &self,
        group_name: &str,
        select: FocusSelect,
        start: u32,
        range: u32,
        query: &ImageIdQuery,
    ) -> Result<(FocusPorts, ReturnedImageId)> {
        check_name("group", group_name)?;
        check_window(start, range, self.config.subnet_size)?;
        let wanted = check_status_select(select)?;

        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let group = lookup_group(&image, group_name)?;
        let ports = ext_window(&image, wanted, start, range, |port| {
            group_membership(&image, port, group).is_some()
        })?;
        Ok((
            FocusPorts {
                name: group_name.to_string(),
                select,
                ports,
            },
            returned,
        ))
    }

    /// Virtual fabric counterpart of [`PmStore::get_ext_focus_ports`].
    pub fn get_ext_vf_focus_ports(
        &self,
        vf_name: &str,
        select: FocusSelect,
        start: u32,
        range: u32,
        query: &ImageIdQuery,
    ) -> Result<(FocusPorts, ReturnedImageId)> {
        self.require_vl_counters("VF extended focus ports")?;
        check_name("VF", vf_name)?;
        check_window(start, range, self.config.subnet_size)?;
        let wanted = check_status_select(select)?;

        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let vf = lookup_vf(&image, vf_name)?;
        let ports = ext_window(&image, wanted, start, range, |port| port.in_vf(vf))?;
        Ok((
            FocusPorts {
                name: vf_name.to_string(),
                select,
                ports,
            },
            returned,
        ))
    }
}

/// Applies the tuples to both ends of a link. Returns the per-tuple values
/// when the port is selected.
fn evaluate_tuples(
    port: &PmPort,
    peer: Option<&PmPort>,
    membership: Membership,
    tuples: &[(MetricFn, FocusTuple)],
    operator: FocusOperator,
    ctx: &MetricContext<'_>,
) -> Option<(Vec<u64>, Vec<u64>)> {
    let mut values = vec![0; tuples.len()];
    let mut neighbor_values = vec![0; tuples.len()];
    let and = operator == FocusOperator::And;
    let (mut local_inc, mut neigh_inc) = (and, and);

    for (idx, (metric, tuple)) in tuples.iter().enumerate() {
        values[idx] = metric(port, ctx);
        let local_cmp = tuple.comparator.compare(values[idx], tuple.threshold);
        let neigh_cmp = match peer {
            Some(peer) => {
                neighbor_values[idx] = metric(peer, ctx);
                tuple.comparator.compare(neighbor_values[idx], tuple.threshold)
            }
            None => false,
        };
        if and {
            local_inc &= local_cmp;
            neigh_inc &= neigh_cmp;
            if !local_inc && !neigh_inc {
                return None;
            }
        } else {
            local_inc |= local_cmp;
            neigh_inc |= neigh_cmp;
        }
    }
    (local_inc || (membership.is_internal() && neigh_inc)).then_some((values, neighbor_values))
}

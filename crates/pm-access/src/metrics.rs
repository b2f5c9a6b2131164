//! Per-port metric computation.
//!
//! Every metric is a pure function of one port in one image. Percentages are
//! reported in tenths of a percent (`pct10`) so they stay integral.

use crate::counters::{PortCounters, VlCounters, STL_MAX_VLS, VL15};
use crate::image::{PmPort, HIDDEN_VL15_VL_MASK};
use fm_common::config::{CongestionWeights, IntegrityWeights};

/// Inputs shared by every metric computed against one image.
#[derive(Debug, Clone, Copy)]
pub struct MetricContext<'a> {
    /// Seconds covered by the image's delta counters (never zero).
    pub interval_secs: u32,
    pub integrity: &'a IntegrityWeights,
    pub congestion: &'a CongestionWeights,
    /// Virtual fabric selected for VF metrics.
    pub vf: Option<VfSelector>,
}

impl<'a> MetricContext<'a> {
    pub fn new(
        interval_secs: u32,
        integrity: &'a IntegrityWeights,
        congestion: &'a CongestionWeights,
    ) -> Self {
        Self {
            interval_secs: interval_secs.max(1),
            integrity,
            congestion,
            vf: None,
        }
    }

    pub fn with_vf(mut self, vf: VfSelector) -> Self {
        self.vf = Some(vf);
        self
    }
}

/// Virtual fabric whose VLs are summed for VF metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfSelector {
    /// The hidden VF owning VL15.
    Hidden,
    Index(usize),
}

fn pct10(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    numerator.saturating_mul(1000) / denominator
}

/// Flit times available on the link over `interval_secs`.
fn capacity_flits(port: &PmPort, interval_secs: u32) -> u64 {
    port.max_mbps() * 1_000_000 / 8 * u64::from(interval_secs)
}

fn mbps(flits: u64, interval_secs: u32) -> u64 {
    flits.saturating_mul(8) / u64::from(interval_secs.max(1)) / 1_000_000
}

/// Transmit bandwidth in MB/s.
pub fn send_mbps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    mbps(port.delta.xmit_data, ctx.interval_secs)
}

/// Receive bandwidth in MB/s.
pub fn recv_mbps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    mbps(port.delta.rcv_data, ctx.interval_secs)
}

/// Transmit packet rate in thousands of packets per second.
pub fn send_kpps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    port.delta.xmit_pkts / u64::from(ctx.interval_secs) / 1000
}

pub fn recv_kpps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    port.delta.rcv_pkts / u64::from(ctx.interval_secs) / 1000
}

/// Transmit utilization of link capacity, pct10.
pub fn util_pct10(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    pct10(send_mbps(port, ctx), port.max_mbps())
}

pub fn integrity(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    let w = ctx.integrity;
    let c = &port.delta;
    // Quality indicator 0 means "not reported".
    let lqi_penalty = match c.link_quality_indicator {
        0 => 0,
        q => 5u64.saturating_sub(u64::from(q)),
    };
    [
        (c.local_link_integrity_errors, w.local_link_integrity_errors),
        (c.rcv_errors, w.port_rcv_errors),
        (c.excessive_buffer_overruns, w.excessive_buffer_overruns),
        (u64::from(c.link_error_recovery), w.link_error_recovery),
        (u64::from(c.link_downed), w.link_downed),
        (u64::from(c.uncorrectable_errors), w.uncorrectable_errors),
        (c.fm_config_errors, w.fm_config_errors),
        (lqi_penalty, w.link_quality_indicator),
        (u64::from(c.link_width_downgrade), w.link_width_downgrade),
    ]
    .iter()
    .fold(0u64, |acc, &(value, weight)| {
        acc.saturating_add(value.saturating_mul(u64::from(weight)))
    })
}

struct CongestionInputs {
    xmit_wait: u64,
    xmit_time_cong: u64,
    sw_congestion: u64,
    rcv_fecn: u64,
    rcv_becn: u64,
    mark_fecn: u64,
    xmit_pkts: u64,
    rcv_pkts: u64,
}

impl From<&PortCounters> for CongestionInputs {
    fn from(c: &PortCounters) -> Self {
        Self {
            xmit_wait: c.xmit_wait,
            xmit_time_cong: c.xmit_time_cong,
            sw_congestion: c.sw_port_congestion,
            rcv_fecn: c.rcv_fecn,
            rcv_becn: c.rcv_becn,
            mark_fecn: c.mark_fecn,
            xmit_pkts: c.xmit_pkts,
            rcv_pkts: c.rcv_pkts,
        }
    }
}

impl From<&VlCounters> for CongestionInputs {
    fn from(c: &VlCounters) -> Self {
        Self {
            xmit_wait: c.xmit_wait,
            xmit_time_cong: c.xmit_time_cong,
            sw_congestion: c.sw_port_vl_congestion,
            rcv_fecn: c.rcv_fecn,
            rcv_becn: c.rcv_becn,
            mark_fecn: c.mark_fecn,
            xmit_pkts: c.xmit_pkts,
            rcv_pkts: c.rcv_pkts,
        }
    }
}

fn weighted_congestion(port: &PmPort, inputs: CongestionInputs, ctx: &MetricContext<'_>) -> u64 {
    let w = ctx.congestion;
    let capacity = capacity_flits(port, ctx.interval_secs);
    [
        (pct10(inputs.xmit_wait, capacity), w.port_xmit_wait_pct),
        (pct10(inputs.xmit_time_cong, capacity), w.port_xmit_time_cong_pct),
        (inputs.sw_congestion, w.sw_port_congestion),
        (pct10(inputs.rcv_fecn, inputs.rcv_pkts), w.port_rcv_fecn_pct),
        (pct10(inputs.rcv_becn, inputs.rcv_pkts), w.port_rcv_becn_pct),
        (pct10(inputs.mark_fecn, inputs.xmit_pkts), w.port_mark_fecn_pct),
    ]
    .iter()
    .fold(0u64, |acc, &(value, weight)| {
        acc.saturating_add(value.saturating_mul(u64::from(weight)))
    })
        / 100
}

pub fn congestion(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    weighted_congestion(port, CongestionInputs::from(&port.delta), ctx)
}

/// Congestion on the management VL.
pub fn sma_congestion(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    weighted_congestion(port, CongestionInputs::from(&port.delta_vl[VL15]), ctx)
}

/// Bandwidth wasted on bubbles, pct10 of link capacity.
pub fn bubble(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    let c = &port.delta;
    let xmit = c.xmit_wasted_bw.saturating_add(c.xmit_wait_data);
    pct10(xmit.max(c.rcv_bubble), capacity_flits(port, ctx.interval_secs))
}

pub fn security(port: &PmPort, _ctx: &MetricContext<'_>) -> u64 {
    port.delta
        .xmit_constraint_errors
        .saturating_add(port.delta.rcv_constraint_errors)
}

pub fn routing(port: &PmPort, _ctx: &MetricContext<'_>) -> u64 {
    port.delta.rcv_switch_relay_errors
}

/// VF counters summed over the VLs the virtual fabric uses on `port`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfPortCounters {
    pub counters: VlCounters,
    /// At least one of the VF's VLs is shared with another VF.
    pub shared_vl: bool,
}

/// Sums the per-VL counters of `vl_counters` belonging to `vf` on `port`.
///
/// Returns `None` when the VF uses no VL on the port.
pub fn vf_port_counters(
    port: &PmPort,
    vf: VfSelector,
    vl_counters: &[VlCounters; STL_MAX_VLS],
) -> Option<VfPortCounters> {
    let hidden = std::iter::once((None, HIDDEN_VL15_VL_MASK)).filter(|_| vf == VfSelector::Hidden);
    let masks = hidden.chain(port.vf_vl_map.iter().map(|m| (Some(m.vf), m.vl_mask)));

    let mut found = false;
    let mut result = VfPortCounters::default();
    let mut seen = 0u32;
    let mut shared = 0u32;
    let mut selected = 0u32;
    for (owner, vl_mask) in masks {
        for vl in (0..STL_MAX_VLS).filter(|vl| vl_mask & (1 << vl) != 0) {
            let bit = 1u32 << vl;
            let wanted = match (owner, vf) {
                (None, _) => true,
                (Some(idx), VfSelector::Index(target)) => idx == target,
                (Some(_), VfSelector::Hidden) => false,
            };
            if wanted {
                selected |= bit;
                result.counters.accumulate(&vl_counters[vl]);
                found = true;
            }
            if seen & bit != 0 {
                shared |= bit;
            } else {
                seen |= bit;
            }
        }
    }
    result.shared_vl = shared & selected != 0;
    found.then_some(result)
}

fn vf_counters(port: &PmPort, ctx: &MetricContext<'_>) -> Option<VlCounters> {
    let vf = ctx.vf?;
    vf_port_counters(port, vf, &port.delta_vl).map(|c| c.counters)
}

/// VF transmit bandwidth in MB/s.
pub fn vf_send_mbps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    vf_counters(port, ctx)
        .map(|c| mbps(c.xmit_data, ctx.interval_secs))
        .unwrap_or(0)
}

pub fn vf_util_pct10(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    pct10(vf_send_mbps(port, ctx), port.max_mbps())
}

pub fn vf_send_kpps(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    vf_counters(port, ctx)
        .map(|c| c.xmit_pkts / u64::from(ctx.interval_secs) / 1000)
        .unwrap_or(0)
}

pub fn vf_congestion(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    vf_counters(port, ctx)
        .map(|c| weighted_congestion(port, CongestionInputs::from(&c), ctx))
        .unwrap_or(0)
}

pub fn vf_bubble(port: &PmPort, ctx: &MetricContext<'_>) -> u64 {
    vf_counters(port, ctx)
        .map(|c| {
            let xmit = c.xmit_wasted_bw.saturating_add(c.xmit_wait_data);
            pct10(xmit.max(c.rcv_bubble), capacity_flits(port, ctx.interval_secs))
        })
        .unwrap_or(0)
}

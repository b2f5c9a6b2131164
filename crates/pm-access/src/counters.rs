//! Port and per-VL performance counters.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Number of virtual lanes tracked per port.
pub const STL_MAX_VLS: usize = 32;

/// Management VL.
pub const VL15: usize = 15;

/// Port counters as collected by a sweep (or accumulated as running totals).
///
/// Data counters are in 8-byte flits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub multicast_xmit_pkts: u64,
    pub multicast_rcv_pkts: u64,
    pub xmit_wait: u64,
    pub sw_port_congestion: u64,
    pub rcv_fecn: u64,
    pub rcv_becn: u64,
    pub xmit_time_cong: u64,
    pub xmit_wasted_bw: u64,
    pub xmit_wait_data: u64,
    pub rcv_bubble: u64,
    pub mark_fecn: u64,
    pub rcv_constraint_errors: u64,
    pub rcv_switch_relay_errors: u64,
    pub xmit_discards: u64,
    pub xmit_constraint_errors: u64,
    pub rcv_remote_physical_errors: u64,
    pub local_link_integrity_errors: u64,
    pub rcv_errors: u64,
    pub excessive_buffer_overruns: u64,
    pub fm_config_errors: u64,
    pub link_error_recovery: u32,
    pub link_downed: u32,
    pub uncorrectable_errors: u8,
    /// Link quality indicator, 0 (worst) through 5 (best).
    pub link_quality_indicator: u8,
    /// Active lanes lost to width downgrade.
    pub link_width_downgrade: u8,
}

bitflags! {
    /// Counter selection mask for clear operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CounterSelect: u32 {
        const XMIT_DATA = 1 << 0;
        const RCV_DATA = 1 << 1;
        const XMIT_PKTS = 1 << 2;
        const RCV_PKTS = 1 << 3;
        const MULTICAST_XMIT_PKTS = 1 << 4;
        const MULTICAST_RCV_PKTS = 1 << 5;
        const XMIT_WAIT = 1 << 6;
        const CONGESTION = 1 << 7;
        const RCV_FECN = 1 << 8;
        const RCV_BECN = 1 << 9;
        const XMIT_TIME_CONG = 1 << 10;
        const XMIT_WASTED_BW = 1 << 11;
        const XMIT_WAIT_DATA = 1 << 12;
        const RCV_BUBBLE = 1 << 13;
        const MARK_FECN = 1 << 14;
        const RCV_CONSTRAINT_ERRORS = 1 << 15;
        const RCV_SWITCH_RELAY_ERRORS = 1 << 16;
        const XMIT_DISCARDS = 1 << 17;
        const XMIT_CONSTRAINT_ERRORS = 1 << 18;
        const RCV_REMOTE_PHYSICAL_ERRORS = 1 << 19;
        const LOCAL_LINK_INTEGRITY = 1 << 20;
        const RCV_ERRORS = 1 << 21;
        const EXCESSIVE_BUFFER_OVERRUNS = 1 << 22;
        const FM_CONFIG_ERRORS = 1 << 23;
        const LINK_ERROR_RECOVERY = 1 << 24;
        const LINK_DOWNED = 1 << 25;
        const UNCORRECTABLE_ERRORS = 1 << 26;
    }
}

bitflags! {
    /// Per-VL counter selection mask for VF clear operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VlCounterSelect: u32 {
        const XMIT_DATA = 1 << 0;
        const RCV_DATA = 1 << 1;
        const XMIT_PKTS = 1 << 2;
        const RCV_PKTS = 1 << 3;
        const XMIT_DISCARDS = 1 << 4;
        const CONGESTION = 1 << 5;
        const XMIT_WAIT = 1 << 6;
        const RCV_FECN = 1 << 7;
        const RCV_BECN = 1 << 8;
        const XMIT_TIME_CONG = 1 << 9;
        const XMIT_WASTED_BW = 1 << 10;
        const XMIT_WAIT_DATA = 1 << 11;
        const RCV_BUBBLE = 1 << 12;
        const MARK_FECN = 1 << 13;
    }
}

macro_rules! clear_selected {
    ($counters:expr, $select:expr, { $($flag:path => $field:ident),* $(,)? }) => {
        $(
            if $select.contains($flag) {
                $counters.$field = Default::default();
            }
        )*
    };
}

impl PortCounters {
    /// Adds `delta` into `self`, saturating each counter.
    pub fn accumulate(&mut self, delta: &PortCounters) {
        self.xmit_data = self.xmit_data.saturating_add(delta.xmit_data);
        self.rcv_data = self.rcv_data.saturating_add(delta.rcv_data);
        self.xmit_pkts = self.xmit_pkts.saturating_add(delta.xmit_pkts);
        self.rcv_pkts = self.rcv_pkts.saturating_add(delta.rcv_pkts);
        self.multicast_xmit_pkts = self
            .multicast_xmit_pkts
            .saturating_add(delta.multicast_xmit_pkts);
        self.multicast_rcv_pkts = self
            .multicast_rcv_pkts
            .saturating_add(delta.multicast_rcv_pkts);
        self.xmit_wait = self.xmit_wait.saturating_add(delta.xmit_wait);
        self.sw_port_congestion = self
            .sw_port_congestion
            .saturating_add(delta.sw_port_congestion);
        self.rcv_fecn = self.rcv_fecn.saturating_add(delta.rcv_fecn);
        self.rcv_becn = self.rcv_becn.saturating_add(delta.rcv_becn);
        self.xmit_time_cong = self.xmit_time_cong.saturating_add(delta.xmit_time_cong);
        self.xmit_wasted_bw = self.xmit_wasted_bw.saturating_add(delta.xmit_wasted_bw);
        self.xmit_wait_data = self.xmit_wait_data.saturating_add(delta.xmit_wait_data);
        self.rcv_bubble = self.rcv_bubble.saturating_add(delta.rcv_bubble);
        self.mark_fecn = self.mark_fecn.saturating_add(delta.mark_fecn);
        self.rcv_constraint_errors = self
            .rcv_constraint_errors
            .saturating_add(delta.rcv_constraint_errors);
        self.rcv_switch_relay_errors = self
            .rcv_switch_relay_errors
            .saturating_add(delta.rcv_switch_relay_errors);
        self.xmit_discards = self.xmit_discards.saturating_add(delta.xmit_discards);
        self.xmit_constraint_errors = self
            .xmit_constraint_errors
            .saturating_add(delta.xmit_constraint_errors);
        self.rcv_remote_physical_errors = self
            .rcv_remote_physical_errors
            .saturating_add(delta.rcv_remote_physical_errors);
        self.local_link_integrity_errors = self
            .local_link_integrity_errors
            .saturating_add(delta.local_link_integrity_errors);
        self.rcv_errors = self.rcv_errors.saturating_add(delta.rcv_errors);
        self.excessive_buffer_overruns = self
            .excessive_buffer_overruns
            .saturating_add(delta.excessive_buffer_overruns);
        self.fm_config_errors = self.fm_config_errors.saturating_add(delta.fm_config_errors);
        self.link_error_recovery = self
            .link_error_recovery
            .saturating_add(delta.link_error_recovery);
        self.link_downed = self.link_downed.saturating_add(delta.link_downed);
        self.uncorrectable_errors = self
            .uncorrectable_errors
            .saturating_add(delta.uncorrectable_errors);
        // Gauges, not counters: the latest sample wins.
        self.link_quality_indicator = delta.link_quality_indicator;
        self.link_width_downgrade = delta.link_width_downgrade;
    }

    /// Zeroes the counters named by `select`.
    pub fn clear(&mut self, select: CounterSelect) {
        clear_selected!(self, select, {
            CounterSelect::XMIT_DATA => xmit_data,
            CounterSelect::RCV_DATA => rcv_data,
            CounterSelect::XMIT_PKTS => xmit_pkts,
            CounterSelect::RCV_PKTS => rcv_pkts,
            CounterSelect::MULTICAST_XMIT_PKTS => multicast_xmit_pkts,
            CounterSelect::MULTICAST_RCV_PKTS => multicast_rcv_pkts,
            CounterSelect::XMIT_WAIT => xmit_wait,
            CounterSelect::CONGESTION => sw_port_congestion,
            CounterSelect::RCV_FECN => rcv_fecn,
            CounterSelect::RCV_BECN => rcv_becn,
            CounterSelect::XMIT_TIME_CONG => xmit_time_cong,
            CounterSelect::XMIT_WASTED_BW => xmit_wasted_bw,
            CounterSelect::XMIT_WAIT_DATA => xmit_wait_data,
            CounterSelect::RCV_BUBBLE => rcv_bubble,
            CounterSelect::MARK_FECN => mark_fecn,
            CounterSelect::RCV_CONSTRAINT_ERRORS => rcv_constraint_errors,
            CounterSelect::RCV_SWITCH_RELAY_ERRORS => rcv_switch_relay_errors,
            CounterSelect::XMIT_DISCARDS => xmit_discards,
            CounterSelect::XMIT_CONSTRAINT_ERRORS => xmit_constraint_errors,
            CounterSelect::RCV_REMOTE_PHYSICAL_ERRORS => rcv_remote_physical_errors,
            CounterSelect::LOCAL_LINK_INTEGRITY => local_link_integrity_errors,
            CounterSelect::RCV_ERRORS => rcv_errors,
            CounterSelect::EXCESSIVE_BUFFER_OVERRUNS => excessive_buffer_overruns,
            CounterSelect::FM_CONFIG_ERRORS => fm_config_errors,
            CounterSelect::LINK_ERROR_RECOVERY => link_error_recovery,
            CounterSelect::LINK_DOWNED => link_downed,
            CounterSelect::UNCORRECTABLE_ERRORS => uncorrectable_errors,
        });
    }
}

/// Per-VL counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlCounters {
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub xmit_wait: u64,
    pub sw_port_vl_congestion: u64,
    pub rcv_fecn: u64,
    pub rcv_becn: u64,
    pub xmit_time_cong: u64,
    pub xmit_wasted_bw: u64,
    pub xmit_wait_data: u64,
    pub rcv_bubble: u64,
    pub mark_fecn: u64,
    pub xmit_discards: u64,
}

impl VlCounters {
    pub fn accumulate(&mut self, other: &VlCounters) {
        self.xmit_data = self.xmit_data.saturating_add(other.xmit_data);
        self.rcv_data = self.rcv_data.saturating_add(other.rcv_data);
        self.xmit_pkts = self.xmit_pkts.saturating_add(other.xmit_pkts);
        self.rcv_pkts = self.rcv_pkts.saturating_add(other.rcv_pkts);
        self.xmit_wait = self.xmit_wait.saturating_add(other.xmit_wait);
        self.sw_port_vl_congestion = self
            .sw_port_vl_congestion
            .saturating_add(other.sw_port_vl_congestion);
        self.rcv_fecn = self.rcv_fecn.saturating_add(other.rcv_fecn);
        self.rcv_becn = self.rcv_becn.saturating_add(other.rcv_becn);
        self.xmit_time_cong = self.xmit_time_cong.saturating_add(other.xmit_time_cong);
        self.xmit_wasted_bw = self.xmit_wasted_bw.saturating_add(other.xmit_wasted_bw);
        self.xmit_wait_data = self.xmit_wait_data.saturating_add(other.xmit_wait_data);
        self.rcv_bubble = self.rcv_bubble.saturating_add(other.rcv_bubble);
        self.mark_fecn = self.mark_fecn.saturating_add(other.mark_fecn);
        self.xmit_discards = self.xmit_discards.saturating_add(other.xmit_discards);
    }

    pub fn clear(&mut self, select: VlCounterSelect) {
        clear_selected!(self, select, {
            VlCounterSelect::XMIT_DATA => xmit_data,
            VlCounterSelect::RCV_DATA => rcv_data,
            VlCounterSelect::XMIT_PKTS => xmit_pkts,
            VlCounterSelect::RCV_PKTS => rcv_pkts,
            VlCounterSelect::XMIT_DISCARDS => xmit_discards,
            VlCounterSelect::CONGESTION => sw_port_vl_congestion,
            VlCounterSelect::XMIT_WAIT => xmit_wait,
            VlCounterSelect::RCV_FECN => rcv_fecn,
            VlCounterSelect::RCV_BECN => rcv_becn,
            VlCounterSelect::XMIT_TIME_CONG => xmit_time_cong,
            VlCounterSelect::XMIT_WASTED_BW => xmit_wasted_bw,
            VlCounterSelect::XMIT_WAIT_DATA => xmit_wait_data,
            VlCounterSelect::RCV_BUBBLE => rcv_bubble,
            VlCounterSelect::MARK_FECN => mark_fecn,
        });
    }
}

/// Running totals for one port, independent of the image ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortTotals {
    pub counters: PortCounters,
    pub vl: [VlCounters; STL_MAX_VLS],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_saturates() {
        let mut total = PortCounters {
            xmit_data: u64::MAX - 1,
            link_downed: u32::MAX,
            ..Default::default()
        };
        let delta = PortCounters {
            xmit_data: 10,
            link_downed: 1,
            link_quality_indicator: 4,
            ..Default::default()
        };
        total.accumulate(&delta);
        assert_eq!(total.xmit_data, u64::MAX);
        assert_eq!(total.link_downed, u32::MAX);
        assert_eq!(total.link_quality_indicator, 4);
    }

    #[test]
    fn test_clear_selected_only() {
        let mut counters = PortCounters {
            xmit_data: 5,
            rcv_data: 6,
            link_downed: 2,
            ..Default::default()
        };
        counters.clear(CounterSelect::XMIT_DATA | CounterSelect::LINK_DOWNED);
        assert_eq!(counters.xmit_data, 0);
        assert_eq!(counters.rcv_data, 6);
        assert_eq!(counters.link_downed, 0);
    }

    #[test]
    fn test_vl_clear_all() {
        let mut vl = VlCounters {
            xmit_data: 1,
            rcv_bubble: 2,
            ..Default::default()
        };
        vl.clear(VlCounterSelect::all());
        assert_eq!(vl, VlCounters::default());
    }
}

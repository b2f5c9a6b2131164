//! Virtual fabric queries.
//!
//! VF statistics are sums of per-VL counters over the VLs a virtual fabric
//! uses on each port, so every query here needs VL counter processing.

use super::group::{ErrStats, ErrSummary, PortConfig, RateRange, UtilStats};
use super::port_stats::{
    check_select, check_user_counters, query_status_flags, user_counters_image_id,
    PortStatsFlags, VfPortStats,
};
use super::{check_lid, check_name, lookup_vf, no_port, vf_membership};
use crate::counters::{VlCounterSelect, STL_MAX_VLS};
use crate::error::{PaError, PaStatusCode, Result};
use crate::image::{ImageData, PmPort, QueryStatus, HIDDEN_VL15_VF, HIDDEN_VL15_VL_MASK};
use crate::image_id::{ImageIdQuery, ReturnedImageId};
use crate::metrics::{self, VfSelector};
use crate::store::PmStore;
use fm_common::audit::AuditCategory;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VfInfo {
    pub name: String,
    pub num_ports: u32,
    pub util: UtilStats,
    pub err: ErrStats,
    pub min_rate: u32,
    pub max_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VfConfig {
    pub name: String,
    pub ports: Vec<PortConfig>,
}

/// Resolves a VF name, accepting the hidden VL15 fabric.
fn vf_selector(image: &ImageData, name: &str) -> Result<VfSelector> {
    if name == HIDDEN_VL15_VF {
        return Ok(VfSelector::Hidden);
    }
    lookup_vf(image, name).map(VfSelector::Index)
}

/// VLs `vf` uses on `port`.
fn vf_vl_mask(port: &PmPort, vf: VfSelector) -> u32 {
    match vf {
        VfSelector::Hidden => HIDDEN_VL15_VL_MASK,
        VfSelector::Index(idx) => port
            .vf_vl_map
            .iter()
            .filter(|m| m.vf == idx)
            .fold(0, |mask, m| mask | m.vl_mask),
    }
}

impl PmStore {
    /// Names of the active virtual fabrics in the image.
    pub fn get_vf_list(&self, query: &ImageIdQuery) -> Result<(Vec<String>, ReturnedImageId)> {
        self.require_vl_counters("VF list")?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let mut names = Vec::new();
        names.try_reserve(image.vfs.len())?;
        names.extend(
            image
                .vfs
                .iter()
                .filter(|vf| vf.active)
                .map(|vf| vf.name.clone()),
        );
        Ok((names, returned))
    }

    /// Utilization and error statistics of one virtual fabric.
    pub fn get_vf_info(
        &self,
        vf_name: &str,
        query: &ImageIdQuery,
    ) -> Result<(VfInfo, ReturnedImageId)> {
        check_name("VF", vf_name)?;
        self.require_vl_counters("VF info")?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let vf = lookup_vf(&image, vf_name)?;
        let ctx = self.metric_context(&image).with_vf(VfSelector::Index(vf));
        let thresholds = &self.config.thresholds;

        let mut info = VfInfo {
            name: vf_name.to_string(),
            ..VfInfo::default()
        };
        let mut rate = RateRange::default();
        for (_, port) in image.ports() {
            if vf_membership(&image, port, vf).is_none() {
                continue;
            }
            if port.query_status != QueryStatus::Ok {
                info.util.note_no_response();
            }
            info.num_ports += 1;
            info.util.add(
                metrics::vf_send_mbps(port, &ctx),
                metrics::vf_send_kpps(port, &ctx),
                metrics::vf_util_pct10(port, &ctx),
            );
            let errs = ErrSummary {
                congestion: metrics::vf_congestion(port, &ctx),
                bubble: metrics::vf_bubble(port, &ctx),
                ..ErrSummary::of_port(port, &ctx)
            };
            info.err.add(errs, thresholds);
            rate.add(port.rate_gbps());
            if port.neighbor.is_none() && port.port_num != 0 {
                info.util.note_topology_incomplete();
            }
        }
        info.util.finalize();
        info.min_rate = rate.min;
        info.max_rate = rate.max;
        debug!(vf = vf_name, ports = info.num_ports, "VF info computed");
        Ok((info, returned))
    }

    /// Ports that carry a virtual fabric.
    pub fn get_vf_config(
        &self,
        vf_name: &str,
        query: &ImageIdQuery,
    ) -> Result<(VfConfig, ReturnedImageId)> {
        check_name("VF", vf_name)?;
        self.require_vl_counters("VF config")?;
        let _busy = self.enter()?;
        let (image, returned) = self.read_image(query)?;
        let vf = lookup_vf(&image, vf_name)?;

        let mut ports = Vec::new();
        for (node, port) in image.ports() {
            if vf_membership(&image, port, vf).is_some() {
                ports.try_reserve(1)?;
                ports.push(PortConfig::new(node, port));
            }
        }
        Ok((
            VfConfig {
                name: vf_name.to_string(),
                ports,
            },
            returned,
        ))
    }

    /// Per-VL counters of one port summed over a virtual fabric's VLs.
    #[allow(clippy::too_many_arguments)]
    pub fn get_vf_port_stats(
        &self,
        lid: u32,
        port_num: u8,
        vf_name: &str,
        delta: bool,
        user_counters: bool,
        query: &ImageIdQuery,
    ) -> Result<(VfPortStats, ReturnedImageId)> {
        check_user_counters(user_counters, delta, query)?;
        check_name("VF", vf_name)?;
        check_lid(lid)?;
        self.require_vl_counters("VF port stats")?;
        let _busy = self.enter()?;
        let query = if user_counters {
            ImageIdQuery::live()
        } else {
            *query
        };
        let (image, returned) = self.read_image(&query)?;
        let vf = vf_selector(&image, vf_name)?;
        let node = image.node(lid).ok_or_else(|| no_port(lid, port_num))?;
        let port = node.port(port_num).ok_or_else(|| no_port(lid, port_num))?;
        let mut flags = query_status_flags(lid, port);

        let (sums, returned) = if user_counters {
            let vl = self
                .totals
                .read()
                .get(&(node.guid(), port_num))
                .map(|t| t.vl)
                .unwrap_or_default();
            flags |= PortStatsFlags::USER_COUNTERS;
            if self.unexpected_clear_user_counters.load(Ordering::Acquire) {
                flags |= PortStatsFlags::UNEXPECTED_CLEAR;
            }
            (metrics::vf_port_counters(port, vf, &vl), user_counters_image_id())
        } else {
            let source = if delta {
                flags |= PortStatsFlags::DELTA;
                &port.delta_vl
            } else {
                &port.vl_counters
            };
            if port.unexpected_clear {
                flags |= PortStatsFlags::UNEXPECTED_CLEAR;
            }
            (metrics::vf_port_counters(port, vf, source), returned)
        };
        let sums = sums.ok_or_else(|| {
            warn!(lid, port = port_num, vf = vf_name, "VF not present on port");
            PaError::not_found(
                PaStatusCode::NoVf,
                format!("VF {} on port {} of LID {:#06x}", vf_name, port_num, lid),
            )
        })?;
        if sums.shared_vl {
            flags |= PortStatsFlags::SHARED_VL;
        }
        Ok((
            VfPortStats {
                counters: sums.counters,
                flags,
            },
            returned,
        ))
    }

    /// Clears selected running per-VL counters on the VLs of a virtual
    /// fabric, for one port or every port of a switch.
    pub fn clear_vf_port_stats(
        &self,
        lid: u32,
        port_num: u8,
        vf_name: &str,
        select: VlCounterSelect,
    ) -> Result<()> {
        check_lid(lid)?;
        check_select(select.bits())?;
        check_name("VF", vf_name)?;
        self.require_vl_counters("Clear VF port stats")?;
        let _busy = self.enter()?;
        let result = self.clear_vf_running(lid, port_num, vf_name, select);
        self.audit(
            AuditCategory::CounterClear,
            "clear_vf_port_stats",
            format!("lid={:#06x} port={} vf={}", lid, port_num, vf_name),
            "port",
            result.as_ref().map(|_| ()),
        );
        result
    }

    fn clear_vf_running(
        &self,
        lid: u32,
        port_num: u8,
        vf_name: &str,
        select: VlCounterSelect,
    ) -> Result<()> {
        let vf = {
            let (image, _) = self.read_image(&ImageIdQuery::live())?;
            vf_selector(&image, vf_name)?
        };
        self.clear_running(lid, port_num, |port, totals| {
            let mask = vf_vl_mask(port, vf);
            for vl in (0..STL_MAX_VLS).filter(|vl| mask & (1 << vl) != 0) {
                totals.vl[vl].clear(select);
            }
        })
    }
}

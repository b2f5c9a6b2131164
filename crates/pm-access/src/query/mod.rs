//! Query and aggregation engine.
//!
//! Every entry point follows the same sequence: validate the caller's
//! parameters (no busy accounting yet), register with the busy counter,
//! resolve the image, hold its read lock, and scan. A scan never observes a
//! half-written sweep because the writer needs the slot's write lock.
//!
//! Group membership distinguishes *internal* ports (the link's other end is
//! in the same group) from *external* ones. The implicit `All` group treats
//! every port as internal.

mod focus;
mod group;
mod image_info;
mod port_stats;
mod vf;

pub use focus::{
    FocusComparator, FocusOperator, FocusPortDetail, FocusPorts, FocusSelect,
    FocusStatus, FocusTuple, MultiFocusCompletion, MultiFocusPortDetail, MultiFocusPorts,
    MAX_NUM_FOCUS_PORT_TUPLES,
};
pub use group::{
    ErrStats, ErrSummary, GroupConfig, GroupInfo, GroupLinkInfo, GroupNodeInfo, LinkInfo,
    NodeInfo, NodeInfoFilter, PortConfig, UtilStats, ERR_BUCKETS, UTIL_BUCKETS,
};
pub use image_info::{ImageInfo, SmSummary};
pub use port_stats::{PortStats, PortStatsFlags, VfPortStats, PM_ALL_PORT_SELECT};
pub use vf::{VfConfig, VfInfo};

use crate::error::{PaError, PaStatusCode, Result};
use crate::image::{GroupRef, ImageData, PmPort};
use crate::metrics::MetricContext;
use crate::store::PmStore;
use tracing::warn;

/// How a port relates to the group (or virtual fabric) being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    Internal,
    External,
}

impl Membership {
    pub fn is_internal(self) -> bool {
        self == Membership::Internal
    }
}

/// Classifies `port` against `group`, or `None` when it is not a member.
pub(crate) fn group_membership(
    image: &ImageData,
    port: &PmPort,
    group: GroupRef,
) -> Option<Membership> {
    match group {
        GroupRef::All => Some(Membership::Internal),
        GroupRef::Index(g) => {
            if !port.in_group(g) {
                return None;
            }
            let internal = image
                .neighbor(port)
                .is_some_and(|(_, peer)| peer.in_group(g));
            Some(if internal {
                Membership::Internal
            } else {
                Membership::External
            })
        }
    }
}

/// Classifies `port` against virtual fabric `vf`.
pub(crate) fn vf_membership(image: &ImageData, port: &PmPort, vf: usize) -> Option<Membership> {
    if !port.in_vf(vf) {
        return None;
    }
    let internal = image.neighbor(port).is_some_and(|(_, peer)| peer.in_vf(vf));
    Some(if internal {
        Membership::Internal
    } else {
        Membership::External
    })
}

pub(crate) fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        warn!(kind, "Illegal name parameter: empty string");
        return Err(PaError::invalid(format!("{} name is empty", kind)));
    }
    Ok(())
}

pub(crate) fn check_lid(lid: u32) -> Result<()> {
    if lid == 0 {
        warn!("Illegal LID parameter: must not be zero");
        return Err(PaError::invalid("LID must not be zero"));
    }
    Ok(())
}

pub(crate) fn lookup_group(image: &ImageData, name: &str) -> Result<GroupRef> {
    image.group_ref(name).ok_or_else(|| {
        warn!(group = name, "Group not found");
        PaError::not_found(PaStatusCode::NoGroup, format!("Group {}", name))
    })
}

pub(crate) fn lookup_vf(image: &ImageData, name: &str) -> Result<usize> {
    image
        .vf_index(name)
        .filter(|&idx| image.vfs[idx].active)
        .ok_or_else(|| {
            warn!(vf = name, "Virtual fabric not found");
            PaError::not_found(PaStatusCode::NoVf, format!("VF {}", name))
        })
}

pub(crate) fn no_port(lid: u32, port_num: u8) -> PaError {
    warn!(lid, port = port_num, "Port not found");
    PaError::not_found(
        PaStatusCode::NoPort,
        format!("Port {} of LID {:#06x}", port_num, lid),
    )
}

impl PmStore {
    pub(crate) fn metric_context(&self, image: &ImageData) -> MetricContext<'_> {
        MetricContext::new(
            image.image_interval,
            &self.config.integrity_weights,
            &self.config.congestion_weights,
        )
    }

    /// VF queries need per-VL counters.
    pub(crate) fn require_vl_counters(&self, what: &str) -> Result<()> {
        if !self.config.process_vl_counters {
            warn!(query = what, "Processing of VL counters is disabled");
            return Err(PaError::InvalidSetting {
                code: PaStatusCode::NoData,
                reason: format!("VL counter processing is disabled; {} unavailable", what),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_fabric;

    #[test]
    fn test_group_membership() {
        let image = small_fabric(1, 100);
        let sw_port = image.find_port(1, 1).unwrap();
        let hfi_port = image.find_port(2, 1).unwrap();

        assert_eq!(
            group_membership(&image, sw_port, GroupRef::Index(0)),
            Some(Membership::External)
        );
        assert_eq!(group_membership(&image, hfi_port, GroupRef::Index(0)), None);
        assert_eq!(
            group_membership(&image, hfi_port, GroupRef::All),
            Some(Membership::Internal)
        );
    }

    #[test]
    fn test_vf_membership() {
        let image = small_fabric(1, 100);
        let sw_port = image.find_port(1, 1).unwrap();
        let unlinked = image.find_port(1, 4).unwrap();
        assert_eq!(vf_membership(&image, sw_port, 1), Some(Membership::Internal));
        assert_eq!(vf_membership(&image, unlinked, 1), Some(Membership::External));
        assert_eq!(vf_membership(&image, sw_port, 5), None);
    }

    #[test]
    fn test_lookup_errors() {
        let image = small_fabric(1, 100);
        assert_eq!(
            lookup_group(&image, "Foo").unwrap_err().status_code(),
            PaStatusCode::NoGroup
        );
        assert_eq!(
            lookup_vf(&image, "Foo").unwrap_err().status_code(),
            PaStatusCode::NoVf
        );
        assert!(check_name("group", "").is_err());
        assert!(check_lid(0).is_err());
    }
}

//! Per-port counter queries and running-counter clears.

use super::{check_lid, no_port};
use crate::counters::{CounterSelect, PortCounters, PortTotals, VlCounters};
use crate::error::{PaError, PaStatusCode, Result};
use crate::image::{PmPort, QueryStatus};
use crate::image_id::{ImageIdQuery, ReturnedImageId, LIVE_IMAGE_ID};
use crate::store::PmStore;
use bitflags::bitflags;
use fm_common::audit::AuditCategory;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Port number selecting every port of a switch.
pub const PM_ALL_PORT_SELECT: u8 = 0xFF;

bitflags! {
    /// Qualifiers attached to a port counter response.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PortStatsFlags: u32 {
        /// Counters are the change over one sweep interval.
        const DELTA = 1 << 0;
        /// Counters were reset outside the PM's control.
        const UNEXPECTED_CLEAR = 1 << 1;
        /// A VF's counters include a VL it shares with another VF.
        const SHARED_VL = 1 << 2;
        /// Counters are the PM's running totals.
        const USER_COUNTERS = 1 << 3;
        /// The sweep failed to clear the port's hardware counters.
        const CLEAR_FAIL = 1 << 4;
        /// The port was skipped by the sweep; counters are stale.
        const NO_DATA = 1 << 5;
        /// The sweep's counter query failed; counters are stale.
        const BAD_DATA = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub counters: PortCounters,
    pub flags: PortStatsFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfPortStats {
    pub counters: VlCounters,
    pub flags: PortStatsFlags,
}

/// Flags describing data quality for a port whose query did not succeed.
pub(crate) fn query_status_flags(lid: u32, port: &PmPort) -> PortStatsFlags {
    let (flag, label) = match port.query_status {
        QueryStatus::Ok => return PortStatsFlags::empty(),
        QueryStatus::Skip => (PortStatsFlags::NO_DATA, "Skipped"),
        QueryStatus::FailQuery => (PortStatsFlags::BAD_DATA, "Failed Query"),
        QueryStatus::FailClear => (PortStatsFlags::CLEAR_FAIL, "Failed Clear"),
    };
    warn!(lid, port = port.port_num, status = label, "Port query status not OK");
    flag
}

/// Rejects user-counter requests that also ask for a delta or an offset.
pub(crate) fn check_user_counters(user_counters: bool, delta: bool, query: &ImageIdQuery) -> Result<()> {
    if user_counters && (delta || query.offset != 0) {
        warn!(
            offset = query.offset,
            delta, "Offset and delta must be zero when user counters are requested"
        );
        return Err(PaError::invalid(
            "offset and delta must be zero with user counters",
        ));
    }
    Ok(())
}

/// Image id reported for running-counter responses.
pub(crate) fn user_counters_image_id() -> ReturnedImageId {
    ReturnedImageId {
        image_number: LIVE_IMAGE_ID,
        image_time: 0,
    }
}

impl PmStore {
    /// Counters of one port: the image's raw or delta counters, or the
    /// running totals when `user_counters` is set (live image only).
    pub fn get_port_stats(
        &self,
        lid: u32,
        port_num: u8,
        delta: bool,
        user_counters: bool,
        query: &ImageIdQuery,
    ) -> Result<(PortStats, ReturnedImageId)> {
        check_lid(lid)?;
        check_user_counters(user_counters, delta, query)?;
        let _busy = self.enter()?;
        let query = if user_counters {
            ImageIdQuery::live()
        } else {
            *query
        };
        let (image, returned) = self.read_image(&query)?;
        let node = image.node(lid).ok_or_else(|| no_port(lid, port_num))?;
        let port = node.port(port_num).ok_or_else(|| no_port(lid, port_num))?;

        let mut flags = query_status_flags(lid, port);
        if user_counters {
            let counters = self
                .totals
                .read()
                .get(&(node.guid(), port_num))
                .map(|t| t.counters)
                .unwrap_or_default();
            flags |= PortStatsFlags::USER_COUNTERS;
            if self.unexpected_clear_user_counters.load(Ordering::Acquire) {
                flags |= PortStatsFlags::UNEXPECTED_CLEAR;
            }
            return Ok((PortStats { counters, flags }, user_counters_image_id()));
        }

        let counters = if delta {
            flags |= PortStatsFlags::DELTA;
            port.delta
        } else {
            port.counters
        };
        if port.unexpected_clear {
            flags |= PortStatsFlags::UNEXPECTED_CLEAR;
        }
        Ok((PortStats { counters, flags }, returned))
    }

    /// Clears selected running counters of one port, or of every port of a
    /// switch when `port_num` is [`PM_ALL_PORT_SELECT`].
    pub fn clear_port_stats(&self, lid: u32, port_num: u8, select: CounterSelect) -> Result<()> {
        check_lid(lid)?;
        check_select(select.bits())?;
        let _busy = self.enter()?;
        let result = self.clear_running(lid, port_num, |_, totals| totals.counters.clear(select));
        self.audit(
            AuditCategory::CounterClear,
            "clear_port_stats",
            format!("lid={:#06x} port={}", lid, port_num),
            "port",
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Clears selected running counters of every port in the live image.
    pub fn clear_all_port_stats(&self, select: CounterSelect) -> Result<()> {
        check_select(select.bits())?;
        let _busy = self.enter()?;
        let result = self.clear_all_running(select);
        self.audit(
            AuditCategory::CounterClear,
            "clear_all_port_stats",
            "all".to_string(),
            "fabric",
            result.as_ref().map(|_| ()),
        );
        result
    }

    fn clear_all_running(&self, select: CounterSelect) -> Result<()> {
        let (image, _) = self.read_image(&ImageIdQuery::live())?;
        let mut totals = self.totals.write();
        let mut cleared = 0u32;
        for (node, port) in image.ports() {
            if let Some(entry) = totals.get_mut(&(node.guid(), port.port_num)) {
                entry.counters.clear(select);
                cleared += 1;
            }
        }
        if select.is_all() {
            self.unexpected_clear_user_counters
                .store(false, Ordering::Release);
        }
        debug!(ports = cleared, "Running counters cleared");
        Ok(())
    }

    /// Applies `clear` to the running totals of the addressed port(s) of the
    /// live image.
    pub(crate) fn clear_running(
        &self,
        lid: u32,
        port_num: u8,
        mut clear: impl FnMut(&PmPort, &mut PortTotals),
    ) -> Result<()> {
        let (image, _) = self.read_image(&ImageIdQuery::live())?;
        let node = match (image.node(lid), port_num) {
            (Some(node), PM_ALL_PORT_SELECT) if node.is_switch() => node,
            (_, PM_ALL_PORT_SELECT) => {
                warn!(lid, "All-port select can only be used on switches");
                return Err(PaError::not_found(
                    PaStatusCode::NoPort,
                    format!("Switch at LID {:#06x}", lid),
                ));
            }
            (Some(node), _) if node.port(port_num).is_some() => node,
            (_, _) => return Err(no_port(lid, port_num)),
        };

        let mut totals = self.totals.write();
        for port in node.ports.values() {
            if port_num == PM_ALL_PORT_SELECT || port.port_num == port_num {
                clear(port, totals.entry((node.guid(), port.port_num)).or_default());
            }
        }
        Ok(())
    }
}

pub(crate) fn check_select(bits: u32) -> Result<()> {
    if bits == 0 {
        warn!("Illegal select parameter: must not be zero");
        return Err(PaError::invalid("counter select must not be zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_fabric, ManualClock};
    use fm_common::config::PmConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn store() -> PmStore {
        let clock = Arc::new(ManualClock::new(1_000));
        PmStore::with_clock(PmConfig::default(), clock).unwrap()
    }

    fn sweep(sweep_num: u32, xmit_delta: u64) -> crate::image::ImageData {
        let mut image = small_fabric(sweep_num, 100 + u64::from(sweep_num) * 10);
        let port = image.node_mut(2).unwrap().port_mut(1).unwrap();
        port.delta.xmit_pkts = xmit_delta;
        port.counters.xmit_pkts = xmit_delta * u64::from(sweep_num + 1);
        image
    }

    #[test]
    fn test_image_and_delta_counters() {
        let store = store();
        store.commit_sweep(sweep(0, 5)).unwrap();
        store.commit_sweep(sweep(1, 5)).unwrap();
        let q = ImageIdQuery::live();

        let (raw, returned) = store.get_port_stats(2, 1, false, false, &q).unwrap();
        assert_eq!(raw.counters.xmit_pkts, 10);
        assert_eq!(raw.flags, PortStatsFlags::empty());
        assert_eq!(returned.image_time, 110);

        let (delta, _) = store.get_port_stats(2, 1, true, false, &q).unwrap();
        assert_eq!(delta.counters.xmit_pkts, 5);
        assert_eq!(delta.flags, PortStatsFlags::DELTA);
    }

    #[test]
    fn test_user_counters_accumulate_and_clear() {
        let store = store();
        store.commit_sweep(sweep(0, 5)).unwrap();
        store.commit_sweep(sweep(1, 7)).unwrap();
        let q = ImageIdQuery::live();

        let (user, returned) = store.get_port_stats(2, 1, false, true, &q).unwrap();
        assert_eq!(user.counters.xmit_pkts, 12);
        assert!(user.flags.contains(PortStatsFlags::USER_COUNTERS));
        assert_eq!(returned.image_number, LIVE_IMAGE_ID);

        store.clear_port_stats(2, 1, CounterSelect::XMIT_PKTS).unwrap();
        let (user, _) = store.get_port_stats(2, 1, false, true, &q).unwrap();
        assert_eq!(user.counters.xmit_pkts, 0);
    }

    #[test]
    fn test_user_counters_reject_delta_and_offset() {
        let store = store();
        store.commit_sweep(sweep(0, 5)).unwrap();
        assert!(store
            .get_port_stats(2, 1, true, true, &ImageIdQuery::live())
            .is_err());
        assert!(store
            .get_port_stats(2, 1, false, true, &ImageIdQuery::with_offset(0, -1))
            .is_err());
        assert_eq!(store.busy_count(), 0);
    }

    #[test]
    fn test_query_status_becomes_flag() {
        let store = store();
        let mut image = sweep(0, 5);
        image.node_mut(3).unwrap().port_mut(1).unwrap().query_status = QueryStatus::FailQuery;
        image.node_mut(4).unwrap().port_mut(1).unwrap().query_status = QueryStatus::FailClear;
        store.commit_sweep(image).unwrap();
        let q = ImageIdQuery::live();

        let (stats, _) = store.get_port_stats(3, 1, false, false, &q).unwrap();
        assert_eq!(stats.flags, PortStatsFlags::BAD_DATA);
        let (stats, _) = store.get_port_stats(4, 1, false, false, &q).unwrap();
        assert_eq!(stats.flags, PortStatsFlags::CLEAR_FAIL);
    }

    #[test]
    fn test_missing_port() {
        let store = store();
        store.commit_sweep(sweep(0, 5)).unwrap();
        let err = store
            .get_port_stats(2, 9, false, false, &ImageIdQuery::live())
            .unwrap_err();
        assert_eq!(err.status_code(), PaStatusCode::NoPort);
        assert!(store
            .get_port_stats(0, 1, false, false, &ImageIdQuery::live())
            .is_err());
    }

    #[test]
    fn test_clear_all_ports_switch_only() {
        let store = store();
        store.commit_sweep(sweep(0, 5)).unwrap();
        store
            .clear_port_stats(1, PM_ALL_PORT_SELECT, CounterSelect::all())
            .unwrap();
        let err = store
            .clear_port_stats(2, PM_ALL_PORT_SELECT, CounterSelect::all())
            .unwrap_err();
        assert_eq!(err.status_code(), PaStatusCode::NoPort);
        assert!(store
            .clear_port_stats(1, 1, CounterSelect::empty())
            .is_err());
    }

    #[test]
    fn test_clear_all_port_stats() {
        let store = store();
        let mut image = sweep(0, 5);
        image.node_mut(3).unwrap().port_mut(1).unwrap().unexpected_clear = true;
        store.commit_sweep(image).unwrap();
        let q = ImageIdQuery::live();
        let (user, _) = store.get_port_stats(2, 1, false, true, &q).unwrap();
        assert!(user.flags.contains(PortStatsFlags::UNEXPECTED_CLEAR));

        store.clear_all_port_stats(CounterSelect::all()).unwrap();
        let (user, _) = store.get_port_stats(2, 1, false, true, &q).unwrap();
        assert_eq!(user.counters, PortCounters::default());
        assert!(!user.flags.contains(PortStatsFlags::UNEXPECTED_CLEAR));
    }
}

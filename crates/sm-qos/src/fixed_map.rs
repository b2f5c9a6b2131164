//! Fixed SC:VL mapping.
//!
//! Every port runs the same mandatory number of VLs and SC `n` always rides
//! VL `n % vls`, so the map never changes across sweeps or reconfiguration.
//! What is computed is the SL to SC assignment: each SL gets an SC on a VL
//! chosen by priority and preemption rank, using SC offsets that are
//! multiples of the VL count. Links that cannot run the mandatory VL count
//! (other than single-VL ports) are not supported.

use crate::allocator::{
    group_by_rank, log_qos, order_by_rank, round_vl_bandwidths, QosTable, ScVlMode,
};
use crate::error::{QosError, Result};
use crate::types::{
    BitSet32, Qos, ScSlMaps, SlBandwidth, VfPriority, VirtualFabrics, INVALID_SC, STL_MAX_SCS,
    STL_MAX_SLS, STL_MAX_VLS,
};
use crate::vlvf::setup_vlvf_map;
use fm_common::audit::{AuditCategory, AuditOutcome, AuditRecord};
use fm_common::audit_log;
use serde::Serialize;
use tracing::{debug, error, info};

/// Result of a fixed-map setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedMap {
    pub table: QosTable,
    pub maps: ScSlMaps,
}

struct SlAssigner<'a> {
    vfs: &'a VirtualFabrics,
    sl_bw: &'a SlBandwidth,
}

impl SlAssigner<'_> {
    fn map_sl(
        &self,
        qos: &mut Qos,
        maps: &mut ScSlMaps,
        sl: usize,
        sc: usize,
        vl: usize,
        priority: VfPriority,
    ) {
        maps.assign(sl, sc);
        qos.vl_bandwidth[vl] += self.sl_bw.get(sl);
        qos.priority_vls_mut(priority).insert(vl);
    }

    /// Gives each SL in `sls` an SC on VLs `start..end`.
    fn assign(
        &self,
        qos: &mut Qos,
        maps: &mut ScSlMaps,
        start: usize,
        end: usize,
        sls: BitSet32,
        priority: VfPriority,
    ) {
        if end <= start || sls.is_empty() {
            return;
        }
        let num_vls = end - start;
        let stride = qos.num_vls as usize;
        let skip_invalid = |vl: usize, offset: usize| {
            if vl + offset == INVALID_SC as usize {
                offset + stride
            } else {
                offset
            }
        };

        if num_vls >= sls.len() || num_vls == 1 {
            let mut vl = start;
            let mut offset = 0;
            for sl in sls.iter() {
                let sc = vl + offset;
                if vl >= STL_MAX_VLS || sl >= STL_MAX_SLS || sc >= STL_MAX_SCS {
                    error!(vl, sl, sc, "1:1 indices out of range");
                    break;
                }
                self.map_sl(qos, maps, sl, sc, vl, priority);
                if num_vls == 1 {
                    offset += stride;
                } else {
                    vl += 1;
                }
                offset = skip_invalid(vl, offset);
            }
            return;
        }

        // Standby fabrics keep a stable SC, so their rank counts too.
        let (ordered, zero) = order_by_rank(sls, |sl| {
            self.vfs.any_for_sl(sl as u8).map(|vf| vf.preempt_rank)
        });
        for (i, group) in group_by_rank(&ordered, zero, num_vls).into_iter().enumerate() {
            let vl = start + i;
            let mut offset = 0;
            for &sl in group {
                offset = skip_invalid(vl, offset);
                let sc = vl + offset;
                if vl >= STL_MAX_VLS || sl >= STL_MAX_SLS || sc >= STL_MAX_SCS {
                    error!(vl, sl, sc, "Preempt indices out of range");
                    break;
                }
                self.map_sl(qos, maps, sl, sc, vl, priority);
                offset += stride;
            }
        }
    }
}

/// Assigns SCs to every fabric's SL on the fixed map in `qos`.
fn allocate_scs(
    qos: &mut Qos,
    vfs: &VirtualFabrics,
    sl_bw: &SlBandwidth,
    maps: &mut ScSlMaps,
) -> Result<()> {
    let n = qos.num_vls as usize;
    let mut used = BitSet32::default();
    let mut high = BitSet32::default();
    let mut low = BitSet32::default();
    for vf in vfs.all() {
        if vf.routing_scs != 1 {
            return Err(QosError::RoutingScs {
                vf: vf.name.clone(),
                scs: vf.routing_scs,
            });
        }
        let sl = vf.base_sl as usize;
        used.insert(sl);
        if vf.is_high_priority() {
            high.insert(sl);
        } else {
            low.insert(sl);
        }
    }
    debug!(num_vls = n, sls = ?used, high = ?high, low = ?low, "Allocating fixed SCs");

    // With SC n on VL n % vls, each VL owns only 31 / vls SCs.
    if !high.is_empty() && !low.is_empty() && n != 1 {
        let lp_vls = if low.len() < n { low.len() } else { n - 1 };
        let hp_vls = n - lp_vls;
        if high.len() / hp_vls > (STL_MAX_SCS - 1) / n {
            return Err(QosError::Oversubscribed {
                high: high.len(),
                low: low.len(),
                vls: qos.num_vls,
            });
        }
    }

    let assigner = SlAssigner { vfs, sl_bw };
    if n == 1 {
        assigner.assign(qos, maps, 0, 1, used, VfPriority::Low);
    } else if high.is_empty() {
        assigner.assign(qos, maps, 0, n, low, VfPriority::Low);
    } else if low.is_empty() {
        assigner.assign(qos, maps, 0, n, high, VfPriority::High);
    } else {
        assigner.assign(qos, maps, 0, n - 1, low, VfPriority::Low);
        let start = qos.low_priority_vls.next_zero_from(1).unwrap_or(n);
        assigner.assign(qos, maps, start, n, high, VfPriority::High);
    }

    round_vl_bandwidths(qos);
    log_qos(qos);
    Ok(())
}

/// QoS for single-VL ports: every SC on VL 0, carrying the bandwidth of
/// every active fabric.
fn single_vl_qos(vfs: &VirtualFabrics, sl_bw: &SlBandwidth) -> Qos {
    let mut qos = Qos::new(1);
    for (sc, vl) in qos.sc_to_vl.iter_mut().enumerate() {
        if sc != INVALID_SC as usize {
            *vl = 0;
        }
    }
    qos.low_priority_vls.insert(0);

    let mut used = BitSet32::default();
    for vf in vfs.all() {
        let sl = vf.base_sl as usize;
        if !used.contains(sl) {
            used.insert(sl);
            if !vf.standby {
                qos.vl_bandwidth[0] += sl_bw.get(sl);
            }
        }
    }
    round_vl_bandwidths(&mut qos);
    log_qos(&qos);
    qos
}

fn build(num_vls: u8, vfs: &mut VirtualFabrics, sl_bw: &SlBandwidth) -> Result<FixedMap> {
    let n = num_vls as usize;
    let mut entries: Vec<Qos> = (1..STL_MAX_VLS as u8).map(Qos::new).collect();
    let mut maps = ScSlMaps::identity();

    let mut qos = Qos::new(num_vls);
    for (sc, vl) in qos.sc_to_vl.iter_mut().enumerate() {
        if sc != INVALID_SC as usize {
            *vl = (sc % n) as u8;
        }
    }
    allocate_scs(&mut qos, vfs, sl_bw, &mut maps)?;

    // Fabrics route on the SC their SL was given.
    for vf in vfs.vfs.iter_mut() {
        if let Some(&sc) = maps.sl_to_sc.get(vf.base_sl as usize) {
            vf.base_sc = Some(sc);
        }
    }
    qos.vl_vf = setup_vlvf_map(&qos, vfs);

    // Single-VL ports are always supported.
    let mut single = single_vl_qos(vfs, sl_bw);
    single.vl_vf = setup_vlvf_map(&single, vfs);

    entries[n - 1] = qos;
    entries[0] = single;
    Ok(FixedMap {
        table: QosTable::new(
            ScVlMode::Fixed {
                mandatory_vls: num_vls,
            },
            entries,
        ),
        maps,
    })
}

/// Builds the fixed SC:VL table for `num_mandatory_vls` and the SL to SC
/// assignment, and rewrites each fabric's base SC to match.
///
/// Configurations that oversubscribe the fixed SC space are rejected
/// rather than degraded.
pub fn setup_sc2vl_fixed_map(
    num_mandatory_vls: u8,
    vfs: &mut VirtualFabrics,
    sl_bw: &SlBandwidth,
) -> Result<FixedMap> {
    if num_mandatory_vls == 0 || num_mandatory_vls as usize >= STL_MAX_VLS {
        return Err(QosError::InvalidVlCount(num_mandatory_vls));
    }

    let result = build(num_mandatory_vls, vfs, sl_bw);
    let record = AuditRecord::new(AuditCategory::QosConfiguration, "SmQos", "fixed_map")
        .with_object_type("scvl_map")
        .with_object_id(format!("{}vl", num_mandatory_vls))
        .with_details(serde_json::json!({
            "num_vfs": vfs.len(),
            "mandatory_vls": num_mandatory_vls,
        }));
    match &result {
        Ok(_) => {
            info!(num_vls = num_mandatory_vls, vfs = vfs.len(), "Fixed SC:VL map configured");
            audit_log!(record.with_outcome(AuditOutcome::Success));
        }
        Err(e) => {
            error!(num_vls = num_mandatory_vls, error = %e, "Fixed SC:VL map rejected");
            audit_log!(record
                .with_outcome(AuditOutcome::Failure)
                .with_error(e.to_string()));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VirtualFabric, INVALID_VL};
    use pretty_assertions::assert_eq;

    fn vf(name: &str, sl: u8, bandwidth: u8, rank: u8, priority: VfPriority) -> VirtualFabric {
        let mut vf = VirtualFabric::new(name, sl);
        vf.bandwidth = bandwidth;
        vf.preempt_rank = rank;
        vf.priority = priority;
        vf
    }

    fn setup(num_vls: u8, vfs: &mut VirtualFabrics) -> Result<FixedMap> {
        let bw = SlBandwidth::from_vfs(vfs);
        setup_sc2vl_fixed_map(num_vls, vfs, &bw)
    }

    #[test]
    fn test_standard_table_skips_sc15() {
        let mut vfs = VirtualFabrics::new(vec![vf("Default", 0, 100, 0, VfPriority::Low)]);
        let fixed = setup(4, &mut vfs).unwrap();
        let qos = fixed.table.get(4);
        assert_eq!(&qos.sc_to_vl[12..18], &[0, 1, 2, INVALID_VL, 0, 1]);
        assert_eq!(qos.sc_to_vl[31], 3);
        assert_eq!(fixed.table.mode(), ScVlMode::Fixed { mandatory_vls: 4 });
    }

    #[test]
    fn test_mixed_priorities_one_to_one() {
        let mut vfs = VirtualFabrics::new(vec![
            vf("Default", 0, 60, 0, VfPriority::Low),
            vf("Storage", 3, 40, 0, VfPriority::Low),
            vf("Mgmt", 5, 0, 0, VfPriority::High),
        ]);
        let fixed = setup(4, &mut vfs).unwrap();
        // Low SLs 0 and 3 take VLs 0 and 1; high SL 5 starts at VL 2.
        assert_eq!(fixed.maps.sl_to_sc[0], 0);
        assert_eq!(fixed.maps.sl_to_sc[3], 1);
        assert_eq!(fixed.maps.sl_to_sc[5], 2);
        assert_eq!(fixed.maps.sc_to_sl[1], 3);

        let qos = fixed.table.get(4);
        assert_eq!(qos.low_priority_vls.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(qos.high_priority_vls.iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(&qos.vl_bandwidth[..3], &[60, 40, 0]);

        // Base SCs follow the SL assignment and feed the VL to VF map.
        assert_eq!(vfs.vfs[1].base_sc, Some(1));
        assert_eq!(qos.vl_vf.vfs_on(1), &[1]);
        assert_eq!(qos.vl_vf.vfs_on(2), &[2]);
    }

    #[test]
    fn test_oversubscribed_sls_share_vls_with_sc_offsets() {
        // Five low SLs on two VLs: rank 0 SLs 0 and 2 on VL0, the rest on VL1.
        let mut vfs = VirtualFabrics::new(vec![
            vf("A", 0, 20, 0, VfPriority::Low),
            vf("B", 1, 20, 4, VfPriority::Low),
            vf("C", 2, 20, 0, VfPriority::Low),
            vf("D", 3, 20, 2, VfPriority::Low),
            vf("E", 4, 20, 3, VfPriority::Low),
        ]);
        let fixed = setup(2, &mut vfs).unwrap();
        assert_eq!(fixed.maps.sl_to_sc[0], 0);
        assert_eq!(fixed.maps.sl_to_sc[2], 2);
        assert_eq!(fixed.maps.sl_to_sc[3], 1);
        assert_eq!(fixed.maps.sl_to_sc[4], 3);
        assert_eq!(fixed.maps.sl_to_sc[1], 5);
        let qos = fixed.table.get(2);
        assert_eq!(&qos.vl_bandwidth[..2], &[40, 60]);
    }

    #[test]
    fn test_single_vl_table_carries_all_bandwidth() {
        let mut vfs = VirtualFabrics::new(
            (0..4).map(|sl| vf(&format!("vf{}", sl), sl, 25, 0, VfPriority::Low)).collect(),
        );
        let fixed = setup(5, &mut vfs).unwrap();
        let single = fixed.table.get(1);
        assert_eq!(single.num_vls, 1);
        assert_eq!(single.vl_bandwidth[0], 100);
        assert_eq!(single.sc_to_vl[15], INVALID_VL);
        assert!(single.sc_to_vl.iter().enumerate().all(|(sc, &vl)| sc == 15 || vl == 0));
        assert_eq!(single.vl_vf.vfs_on(0), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_one_mandatory_vl() {
        let mut vfs = VirtualFabrics::new(
            (0..4).map(|sl| vf(&format!("vf{}", sl), sl, 25, 0, VfPriority::Low)).collect(),
        );
        let mut bw = SlBandwidth::from_vfs(&vfs);
        bw.0[2] = 0;
        let mut qos = Qos::new(5);
        let mut maps = ScSlMaps::identity();
        let assigner = SlAssigner { vfs: &vfs, sl_bw: &bw };
        let sls: BitSet32 = (0..4).collect();
        assigner.assign(&mut qos, &mut maps, 0, 1, sls, VfPriority::Low);
        // All four SLs on VL0 with SCs 0, 5, 10 and 20 (15 skipped).
        assert_eq!(&maps.sl_to_sc[..4], &[0, 5, 10, 20]);
        assert_eq!(qos.vl_bandwidth[0], 75);

        let fixed = setup(1, &mut vfs).unwrap();
        assert_eq!(fixed.table.get(1).vl_bandwidth[0], 100);
        assert_eq!(fixed.table.get(8).num_vls, 1);
    }

    #[test]
    fn test_oversubscription_is_rejected() {
        // Eight VLs leave 31 / 8 = 3 SCs per VL. Seven low SLs take seven
        // VLs, so four high SLs on the last VL do not fit.
        let mut list: Vec<_> = (0..7)
            .map(|sl| vf(&format!("lo{}", sl), sl, 10, 0, VfPriority::Low))
            .collect();
        list.extend((7..11).map(|sl| vf(&format!("hi{}", sl), sl, 0, 0, VfPriority::High)));
        let mut vfs = VirtualFabrics::new(list);
        assert_eq!(
            setup(8, &mut vfs).unwrap_err(),
            QosError::Oversubscribed {
                high: 4,
                low: 7,
                vls: 8
            }
        );

        vfs.vfs.truncate(10);
        let fixed = setup(8, &mut vfs).unwrap();
        // Three high SLs on VL7: SCs 7, 23 (15 is skipped) and 31.
        assert_eq!(&fixed.maps.sl_to_sc[7..10], &[7, 23, 31]);
    }

    #[test]
    fn test_multiple_routing_scs_rejected() {
        let mut dor = VirtualFabric::new("Dor", 0);
        dor.routing_scs = 2;
        let mut vfs = VirtualFabrics::new(vec![dor]);
        assert!(matches!(
            setup(4, &mut vfs),
            Err(QosError::RoutingScs { ref vf, scs: 2 }) if vf == "Dor"
        ));
        assert_eq!(setup(0, &mut vfs).unwrap_err(), QosError::InvalidVlCount(0));
    }
}

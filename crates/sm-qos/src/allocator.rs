//! SC to VL allocation for every supported VL count.
//!
//! Ports negotiate anywhere from 1 to 31 data VLs, so a [`Qos`] is computed
//! for each count up front and looked up per port through [`QosTable::get`].
//!
//! High- and low-priority SCs are kept on separate VLs whenever the VL
//! count allows it. When SCs outnumber VLs they are grouped by preemption
//! rank: non-preemptible (rank 0) SCs share a proportional number of VLs
//! and the remaining SCs are packed in rank order, so SCs with similar
//! preemption urgency share a lane.

use crate::error::{QosError, Result};
use crate::types::{
    BitSet32, Qos, ScSlMaps, SlBandwidth, VfPriority, VirtualFabrics, STL_MAX_SCS, STL_MAX_VLS,
};
use crate::vlvf::setup_vlvf_map;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, error, warn};

/// How the SC to VL tables were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ScVlMode {
    /// One allocation per VL count.
    Dynamic,
    /// A single static table for `mandatory_vls`, plus the 1-VL table.
    Fixed { mandatory_vls: u8 },
}

/// QoS descriptions indexed by data VL count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QosTable {
    mode: ScVlMode,
    /// `entries[n - 1]` describes ports with `n` data VLs.
    entries: Vec<Qos>,
}

impl QosTable {
    pub(crate) fn new(mode: ScVlMode, entries: Vec<Qos>) -> Self {
        debug_assert_eq!(entries.len(), STL_MAX_VLS - 1);
        Self { mode, entries }
    }

    pub fn mode(&self) -> ScVlMode {
        self.mode
    }

    /// QoS for a port running `num_vls` data VLs.
    ///
    /// Counts outside 1..=31 fall back to the 1-VL entry. With fixed maps
    /// every port other than a 1-VL port gets the mandatory table.
    pub fn get(&self, num_vls: u8) -> &Qos {
        let idx = match self.mode {
            ScVlMode::Fixed { .. } if num_vls == 1 => 1,
            ScVlMode::Fixed { mandatory_vls } => {
                if num_vls != mandatory_vls {
                    error!(num_vls, mandatory_vls, "Unexpected number of VLs");
                }
                mandatory_vls
            }
            ScVlMode::Dynamic if (1..STL_MAX_VLS as u8).contains(&num_vls) => num_vls,
            ScVlMode::Dynamic => 1,
        };
        &self.entries[idx as usize - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Qos> {
        self.entries.iter()
    }
}

/// Orders `members` by ascending preemption rank, keeping index order among
/// equal ranks. Members with no owning fabric are left out. Returns the
/// ordered members and how many have rank 0.
pub(crate) fn order_by_rank(
    members: BitSet32,
    rank_of: impl Fn(usize) -> Option<u8>,
) -> (Vec<usize>, usize) {
    let ranked: Vec<(usize, u8)> = members
        .iter()
        .filter_map(|idx| match rank_of(idx) {
            Some(rank) => Some((idx, rank)),
            None => {
                warn!(idx, "No virtual fabric owns this index, leaving it unassigned");
                None
            }
        })
        .sorted_by_key(|&(_, rank)| rank)
        .collect();
    let zero = ranked.iter().filter(|&&(_, rank)| rank == 0).count();
    (ranked.into_iter().map(|(idx, _)| idx).collect(), zero)
}

/// Splits `ordered` across `num_vls` lanes. The first `num_zero` entries
/// (rank 0) get a share of lanes proportional to their count, at least one;
/// the rest share the remaining lanes. Within each share, earlier lanes
/// absorb the remainder.
pub(crate) fn group_by_rank(ordered: &[usize], num_zero: usize, num_vls: usize) -> Vec<&[usize]> {
    let total = ordered.len();
    let mut zero_vls = if total == 0 { 0 } else { num_zero * num_vls / total };
    if zero_vls == 0 && num_zero > 0 {
        zero_vls = 1;
    }
    let zero_vls = zero_vls.min(num_vls);

    let mut groups = Vec::with_capacity(num_vls);
    let mut rest = ordered;
    split_evenly(&mut groups, &mut rest, num_zero, zero_vls);
    split_evenly(&mut groups, &mut rest, total - num_zero, num_vls - zero_vls);
    groups
}

fn split_evenly<'a>(
    groups: &mut Vec<&'a [usize]>,
    rest: &mut &'a [usize],
    count: usize,
    vls: usize,
) {
    if vls == 0 {
        return;
    }
    let per_vl = count / vls;
    let mut extra = count % vls;
    for _ in 0..vls {
        if rest.is_empty() {
            break;
        }
        let mut take = per_vl;
        if extra > 0 {
            take += 1;
            extra -= 1;
        }
        let (head, tail) = rest.split_at(take.min(rest.len()));
        groups.push(head);
        *rest = tail;
    }
}

/// Rounds every VL's bandwidth to a multiple of 5 (never down to zero)
/// and derives the arbitration weight multiplier.
pub(crate) fn round_vl_bandwidths(qos: &mut Qos) {
    let num_vls = qos.num_vls as usize;
    for bw in qos.vl_bandwidth.iter_mut().take(num_vls) {
        let rem = *bw % 5;
        if *bw == 0 || rem == 0 {
            continue;
        }
        if rem > 2 {
            *bw += 5 - rem;
        } else {
            *bw -= rem;
            if *bw == 0 {
                *bw = 5;
            }
        }
    }
    set_weight_multiplier(qos);
}

/// Picks the bandwidth one arbitration slice stands for.
///
/// Tables hold 16 entries, so 10% slices fit cleanly and 5% slices need
/// doubling up later. A single low-priority VL keeps the default of 100.
fn set_weight_multiplier(qos: &mut Qos) {
    qos.weight_multiplier = 100;
    if qos.low_priority_vls.len() <= 1 {
        return;
    }

    let in_use: Vec<u16> = qos
        .low_priority_vls
        .iter()
        .map(|vl| qos.vl_bandwidth[vl])
        .filter(|&bw| bw > 0)
        .collect();
    let Some(&min) = in_use.iter().min() else {
        return;
    };
    let base_ten = in_use.iter().all(|&bw| bw % 10 <= 2);
    let divides_all = in_use.iter().all(|&bw| bw % min == 0);

    qos.weight_multiplier = if base_ten {
        if min == 100 || min == 50 || divides_all {
            min
        } else {
            10
        }
    } else if min > 5 && divides_all {
        min
    } else {
        5
    };
}

/// Per-VL dump of a computed QoS.
pub(crate) fn log_qos(qos: &Qos) {
    debug!(
        num_vls = qos.num_vls,
        sc_to_vl = ?qos.sc_to_vl,
        high = ?qos.high_priority_vls,
        low = ?qos.low_priority_vls,
        weight_multiplier = qos.weight_multiplier,
        "QoS computed"
    );
    for (label, set) in [("low", qos.low_priority_vls), ("high", qos.high_priority_vls)] {
        let total: u32 = set.iter().map(|vl| u32::from(qos.vl_bandwidth[vl])).sum();
        for vl in set.iter() {
            debug!(priority = label, vl, bandwidth = qos.vl_bandwidth[vl], "VL bandwidth");
        }
        debug!(priority = label, total, "Priority class bandwidth");
    }
}

struct ScAssigner<'a> {
    vfs: &'a VirtualFabrics,
    maps: &'a ScSlMaps,
    sl_bw: &'a SlBandwidth,
}

impl ScAssigner<'_> {
    fn map_sc(&self, qos: &mut Qos, sc: usize, vl: usize, priority: VfPriority) {
        let sl = self.maps.sc_to_sl[sc] as usize;
        qos.sc_to_vl[sc] = vl as u8;
        qos.vl_bandwidth[vl] += self.sl_bw.get(sl);
        qos.priority_vls_mut(priority).insert(vl);
    }

    /// Maps `scs` onto VLs `start..end`.
    fn assign(
        &self,
        qos: &mut Qos,
        start: usize,
        end: usize,
        scs: BitSet32,
        priority: VfPriority,
    ) {
        if end <= start || scs.is_empty() {
            return;
        }
        let num_vls = end - start;

        if num_vls >= scs.len() || num_vls == 1 {
            // One SC per VL, or every SC on the single VL.
            let mut vl = start;
            for sc in scs.iter() {
                if vl >= STL_MAX_VLS {
                    error!(vl, sc, "VL index out of range");
                    break;
                }
                self.map_sc(qos, sc, vl, priority);
                if num_vls != 1 {
                    vl += 1;
                }
            }
            return;
        }

        let (ordered, zero) = order_by_rank(scs, |sc| {
            self.vfs
                .active_for_sl(self.maps.sc_to_sl[sc])
                .map(|vf| vf.preempt_rank)
        });
        for (i, group) in group_by_rank(&ordered, zero, num_vls).into_iter().enumerate() {
            let vl = start + i;
            if vl >= STL_MAX_VLS {
                error!(vl, "VL index out of range while oversubscribing");
                break;
            }
            for &sc in group {
                if sc >= STL_MAX_SCS {
                    error!(sc, vl, "SC index out of range while oversubscribing");
                    break;
                }
                self.map_sc(qos, sc, vl, priority);
            }
        }
    }
}

/// Computes the SC to VL map and VL bandwidth for ports with `num_vls`
/// data VLs. Only active fabrics take part.
pub fn allocate_vl(
    num_vls: u8,
    vfs: &VirtualFabrics,
    maps: &ScSlMaps,
    sl_bw: &SlBandwidth,
) -> Result<Qos> {
    if num_vls == 0 || num_vls as usize >= STL_MAX_VLS {
        return Err(QosError::InvalidVlCount(num_vls));
    }
    let mut qos = Qos::new(num_vls);

    let mut in_use = BitSet32::default();
    let mut high = BitSet32::default();
    let mut low = BitSet32::default();
    for vf in vfs.active() {
        for sc in vf.routing_sc_list() {
            in_use.insert(sc);
            if vf.is_high_priority() {
                high.insert(sc);
            } else {
                low.insert(sc);
            }
        }
    }
    debug!(num_vls, scs = ?in_use, high = ?high, low = ?low, "Allocating VLs");

    let assigner = ScAssigner { vfs, maps, sl_bw };
    let n = num_vls as usize;
    // Each priority class needs a VL of its own.
    let min_vls = if !high.is_empty() && !low.is_empty() { 2 } else { 1 };

    if n < min_vls {
        // Too few VLs to separate the classes: everything rides as low.
        assigner.assign(&mut qos, 0, n, in_use, VfPriority::Low);
    } else if high.is_empty() {
        assigner.assign(&mut qos, 0, n, low, VfPriority::Low);
    } else if low.is_empty() {
        assigner.assign(&mut qos, 0, n, high, VfPriority::High);
    } else {
        assigner.assign(&mut qos, 0, n - min_vls / 2, low, VfPriority::Low);
        let start = qos.low_priority_vls.next_zero_from(1).unwrap_or(n);
        assigner.assign(&mut qos, start, n, high, VfPriority::High);
    }

    round_vl_bandwidths(&mut qos);
    log_qos(&qos);
    Ok(qos)
}

/// Allocates every VL count from 1 to 31 and attaches each one's VL to VF
/// map.
pub fn setup_sc2vl(
    vfs: &VirtualFabrics,
    maps: &ScSlMaps,
    sl_bw: &SlBandwidth,
) -> Result<QosTable> {
    let entries = (1..STL_MAX_VLS as u8)
        .map(|num_vls| {
            let mut qos = allocate_vl(num_vls, vfs, maps, sl_bw)?;
            qos.vl_vf = setup_vlvf_map(&qos, vfs);
            Ok(qos)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(QosTable::new(ScVlMode::Dynamic, entries))
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

    fn allocate(num_vls: u8, vfs: &VirtualFabrics) -> Qos {
        allocate_vl(num_vls, vfs, &ScSlMaps::identity(), &SlBandwidth::from_vfs(vfs)).unwrap()
    }

    #[test]
    fn test_one_to_one_when_vls_suffice() {
        let vfs = VirtualFabrics::new(vec![
            vf("Default", 0, 40, 0, VfPriority::Low),
            vf("Storage", 1, 40, 0, VfPriority::Low),
            vf("Admin", 2, 20, 0, VfPriority::Low),
        ]);
        let qos = allocate(4, &vfs);
        assert_eq!(&qos.sc_to_vl[..4], &[0, 1, 2, INVALID_VL]);
        assert_eq!(&qos.vl_bandwidth[..3], &[40, 40, 20]);
        assert_eq!(qos.low_priority_vls.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(qos.high_priority_vls.is_empty());
        assert_eq!(qos.weight_multiplier, 20);
    }

    #[test]
    fn test_single_vl_collapses_everything() {
        let vfs = VirtualFabrics::new(vec![
            vf("Default", 0, 50, 0, VfPriority::Low),
            vf("Mgmt", 1, 0, 0, VfPriority::High),
            vf("Storage", 2, 50, 3, VfPriority::Low),
        ]);
        let qos = allocate(1, &vfs);
        assert_eq!(&qos.sc_to_vl[..3], &[0, 0, 0]);
        assert_eq!(qos.vl_bandwidth[0], 100);
        assert!(qos.high_priority_vls.is_empty());
        assert_eq!(qos.weight_multiplier, 100);
    }

    #[test]
    fn test_mixed_priorities_reserve_a_high_vl() {
        let vfs = VirtualFabrics::new(vec![
            vf("Default", 0, 50, 0, VfPriority::Low),
            vf("Storage", 1, 50, 0, VfPriority::Low),
            vf("Mgmt", 2, 0, 0, VfPriority::High),
        ]);
        let qos = allocate(2, &vfs);
        assert_eq!(&qos.sc_to_vl[..3], &[0, 0, 1]);
        assert_eq!(qos.low_priority_vls.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(qos.high_priority_vls.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(qos.vl_bandwidth[0], 100);
    }

    #[test]
    fn test_only_high_priority_fabrics() {
        let vfs = VirtualFabrics::new(vec![
            vf("Mgmt", 0, 0, 0, VfPriority::High),
            vf("Control", 1, 0, 0, VfPriority::High),
        ]);
        let qos = allocate(4, &vfs);
        assert_eq!(&qos.sc_to_vl[..2], &[0, 1]);
        assert_eq!(qos.high_priority_vls.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(qos.low_priority_vls.is_empty());
    }

    #[test]
    fn test_oversubscription_groups_by_rank() {
        // Ranks by SC: 0 -> 2, 1 -> 0, 2 -> 1, 3 -> 0, 4 -> 1, 5 -> 2.
        let vfs = VirtualFabrics::new(vec![
            vf("A", 0, 10, 2, VfPriority::Low),
            vf("B", 1, 20, 0, VfPriority::Low),
            vf("C", 2, 10, 1, VfPriority::Low),
            vf("D", 3, 20, 0, VfPriority::Low),
            vf("E", 4, 20, 1, VfPriority::Low),
            vf("F", 5, 20, 2, VfPriority::Low),
        ]);
        let qos = allocate(3, &vfs);
        // Two of six SCs are rank 0, so one of three VLs is rank 0; the four
        // ranked SCs split 2/2 in rank order: [2, 4] then [0, 5].
        assert_eq!(&qos.sc_to_vl[..6], &[2, 0, 1, 0, 1, 2]);
        assert_eq!(&qos.vl_bandwidth[..3], &[40, 30, 30]);
        assert_eq!(qos.weight_multiplier, 10);
    }

    #[test]
    fn test_group_by_rank_remainder_goes_first() {
        let ordered = [1, 3, 5, 0, 2, 4, 6];
        let groups = group_by_rank(&ordered, 3, 3);
        // 3 * 3 / 7 = 1 zero VL; four ranked SCs over two VLs.
        assert_eq!(groups, vec![&[1, 3, 5][..], &[0, 2][..], &[4, 6][..]]);

        let groups = group_by_rank(&[7, 8, 9], 0, 2);
        assert_eq!(groups, vec![&[7, 8][..], &[9][..]]);
    }

    #[test]
    fn test_rounding_to_fives() {
        let mut qos = Qos::new(4);
        qos.vl_bandwidth[..4].copy_from_slice(&[33, 32, 1, 0]);
        round_vl_bandwidths(&mut qos);
        assert_eq!(&qos.vl_bandwidth[..4], &[35, 30, 5, 0]);
    }

    #[test]
    fn test_weight_multiplier() {
        let cases: &[(&[u16], u16)] = &[
            (&[50, 50], 50),
            (&[20, 40, 40], 20),
            (&[30, 70], 10),
            (&[15, 45, 40], 5),
            (&[5, 95], 5),
            (&[25, 75], 25),
            (&[100], 100),
        ];
        for &(bws, expected) in cases {
            let mut qos = Qos::new(bws.len() as u8);
            for (vl, &bw) in bws.iter().enumerate() {
                qos.vl_bandwidth[vl] = bw;
                qos.low_priority_vls.insert(vl);
            }
            set_weight_multiplier(&mut qos);
            assert_eq!(qos.weight_multiplier, expected, "bandwidths {:?}", bws);
        }
    }

    #[test]
    fn test_bandwidth_conservation_across_vl_counts() {
        let mut vfs = vec![
            vf("Default", 0, 12, 0, VfPriority::Low),
            vf("Storage", 1, 23, 1, VfPriority::Low),
            vf("Compute", 2, 31, 2, VfPriority::Low),
            vf("Admin", 3, 7, 0, VfPriority::Low),
            vf("Mgmt", 4, 0, 0, VfPriority::High),
            vf("Backup", 5, 27, 3, VfPriority::Low),
        ];
        let mut standby = vf("Spare", 6, 40, 1, VfPriority::Low);
        standby.standby = true;
        vfs.push(standby);
        let vfs = VirtualFabrics::new(vfs);
        let expected: i64 = vfs.active().map(|vf| i64::from(vf.bandwidth)).sum();

        for num_vls in 1..STL_MAX_VLS as u8 {
            let qos = allocate(num_vls, &vfs);
            let used = qos.vl_bandwidth.iter().filter(|&&bw| bw > 0).count() as i64;
            let total = i64::from(qos.total_bandwidth());
            assert!(
                (total - expected).abs() <= 5 * used,
                "{} VLs: {} vs {}",
                num_vls,
                total,
                expected
            );
            // Standby SC 6 never gets a VL.
            assert_eq!(qos.sc_to_vl[6], INVALID_VL);
        }
    }

    #[test]
    fn test_invalid_vl_count() {
        let vfs = VirtualFabrics::default();
        let bw = SlBandwidth::from_vfs(&vfs);
        assert_eq!(
            allocate_vl(0, &vfs, &ScSlMaps::identity(), &bw),
            Err(QosError::InvalidVlCount(0))
        );
        assert!(allocate_vl(32, &vfs, &ScSlMaps::identity(), &bw).is_err());
    }

    #[test]
    fn test_table_lookup() {
        let vfs = VirtualFabrics::new(vec![vf("Default", 0, 100, 0, VfPriority::Low)]);
        let table = setup_sc2vl(&vfs, &ScSlMaps::identity(), &SlBandwidth::from_vfs(&vfs)).unwrap();
        assert_eq!(table.iter().count(), 31);
        assert_eq!(table.get(8).num_vls, 8);
        assert_eq!(table.get(0).num_vls, 1);
        assert_eq!(table.get(40).num_vls, 1);
        assert_eq!(table.get(4).vl_vf.vfs_on(0), &[0]);
    }
}

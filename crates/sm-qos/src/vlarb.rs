//! VL arbitration tables.
//!
//! High-priority VLs are served strictly, one entry each. Low-priority VLs
//! share a weighted round robin whose entries are proportional to VL
//! bandwidth. Many small equal entries arbitrate more evenly than one large
//! entry per VL, so the busiest VLs are interleaved with the rest rather
//! than bunched at the end of the table.

use crate::types::{BitSet32, Qos, INVALID_VL, STL_MAX_VLS};
use fm_common::config::QosConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Entries in the low and high arbitration tables.
pub const STL_MAX_LOW_CAP: usize = 128;
/// Entries in the preemption table.
pub const STL_MAX_PREEMPT_CAP: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VlArbElement {
    pub vl: u8,
    pub weight: u8,
}

impl VlArbElement {
    /// Entry that arbitrates nothing.
    pub const UNUSED: VlArbElement = VlArbElement {
        vl: INVALID_VL,
        weight: 0,
    };
}

/// The arbitration attributes the SM programs on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlArbTables {
    pub low: Vec<VlArbElement>,
    pub high: Vec<VlArbElement>,
    pub preempt: Vec<VlArbElement>,
    pub matrix: [u32; STL_MAX_VLS],
}

impl Default for VlArbTables {
    fn default() -> Self {
        Self {
            low: vec![VlArbElement::default(); STL_MAX_LOW_CAP],
            high: vec![VlArbElement::default(); STL_MAX_LOW_CAP],
            preempt: vec![VlArbElement::default(); STL_MAX_PREEMPT_CAP],
            matrix: [0; STL_MAX_VLS],
        }
    }
}

/// Arbitration-related attributes of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortArbInfo {
    /// Active MTU in bytes.
    pub mtu_active: u16,
    /// Table entries the hardware implements; 0 when not reported.
    pub arbitration_high_cap: u8,
    pub arbitration_low_cap: u8,
    pub num_data_vls: u8,
    /// The port transmits nested preemption, so the matrix is in use.
    pub preemption_enabled: bool,
}

impl Default for PortArbInfo {
    fn default() -> Self {
        Self {
            mtu_active: 2048,
            arbitration_high_cap: 16,
            arbitration_low_cap: 16,
            num_data_vls: 8,
            preemption_enabled: false,
        }
    }
}

impl PortArbInfo {
    /// Entries the table builder may fill.
    fn table_cap(&self, fallback: u8) -> usize {
        let cap = match self.arbitration_high_cap {
            0 => fallback,
            cap => cap,
        };
        (cap as usize).min(STL_MAX_LOW_CAP)
    }

    /// Entry weight: one MTU in 64-byte credits.
    fn entry_weight(&self) -> u8 {
        (self.mtu_active / 64).min(u16::from(u8::MAX)) as u8
    }
}

/// How low-priority slices become table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceMode {
    /// One entry per slice.
    Single,
    /// Slices exceed the table: two slices per entry at double weight.
    Double,
    /// Even doubled slices do not fit: one equal-weight entry per VL.
    Flat,
}

struct LowRoundRobin {
    mode: SliceMode,
    weight: u8,
    slices: [u16; STL_MAX_VLS],
    /// Entries still owed to each VL.
    slots: [u16; STL_MAX_VLS],
    total_slots: u16,
}

impl LowRoundRobin {
    fn emit(&mut self, out: &mut Vec<VlArbElement>, vl: usize) {
        let weight = match self.mode {
            SliceMode::Double if self.slices[vl] > 1 => {
                self.slices[vl] -= 2;
                self.take_slot(vl);
                self.weight.saturating_mul(2)
            }
            SliceMode::Single | SliceMode::Double => {
                self.slices[vl] = self.slices[vl].saturating_sub(1);
                self.take_slot(vl);
                self.weight
            }
            SliceMode::Flat => {
                self.slices[vl] = 0;
                self.total_slots = self.total_slots.saturating_sub(self.slots[vl]);
                self.slots[vl] = 0;
                self.weight
            }
        };
        out.push(VlArbElement {
            vl: vl as u8,
            weight,
        });
    }

    fn take_slot(&mut self, vl: usize) {
        self.slots[vl] = self.slots[vl].saturating_sub(1);
        self.total_slots = self.total_slots.saturating_sub(1);
    }
}

/// Builds the weighted low-priority table of at most `cap` entries.
///
/// Each VL gets `bandwidth / weight_multiplier` slices, rounded to nearest
/// and at least one. Every entry written consumes a slot, and the fill
/// stops as soon as a round writes nothing, so it terminates for any
/// bandwidth configuration.
pub fn fill_low_rr(qos: &Qos, cap: usize, weight: u8) -> Vec<VlArbElement> {
    let cap = cap.min(STL_MAX_LOW_CAP);
    let multiplier = qos.weight_multiplier.max(1);
    let mut rr = LowRoundRobin {
        mode: SliceMode::Single,
        weight,
        slices: [0; STL_MAX_VLS],
        slots: [0; STL_MAX_VLS],
        total_slots: 0,
    };

    let mut in_use = qos.low_priority_vls;
    let mut high_bw = BitSet32::default();
    let mut highest: Option<u16> = None;
    let mut total_slices = 0usize;
    for vl in in_use.iter() {
        let bw = qos.vl_bandwidth[vl];
        let mut slices = bw / multiplier;
        if bw - slices * multiplier >= multiplier / 2 {
            slices += 1;
        }
        rr.slices[vl] = slices.max(1);
        total_slices += rr.slices[vl] as usize;

        match highest {
            Some(h) if bw < h => {}
            Some(h) if bw == h => high_bw.insert(vl),
            _ => {
                high_bw.clear();
                high_bw.insert(vl);
                highest = Some(bw);
            }
        }
    }

    let doubled = |slices: u16| (slices + 1) / 2;
    let doubled_total: usize = in_use.iter().map(|vl| doubled(rr.slices[vl]) as usize).sum();
    rr.mode = if total_slices <= cap {
        SliceMode::Single
    } else if doubled_total <= cap {
        SliceMode::Double
    } else {
        warn!(
            vls = in_use.len(),
            total_slices,
            cap,
            "VLArb table is too small for this bandwidth configuration, using equal weights"
        );
        SliceMode::Flat
    };
    for vl in in_use.iter() {
        rr.slots[vl] = match rr.mode {
            SliceMode::Single => rr.slices[vl],
            SliceMode::Double => doubled(rr.slices[vl]),
            SliceMode::Flat => 1,
        };
        rr.total_slots += rr.slots[vl];
    }

    for vl in high_bw.iter() {
        in_use.remove(vl);
    }
    let mut next = in_use.first();
    let mut out = Vec::with_capacity(cap);

    while out.len() < cap {
        let written = out.len();
        // Entries of the other VLs to place after each high-bandwidth round.
        let interleave = match high_bw.first() {
            Some(vl) => {
                let slots = rr.slots[vl].max(1) as usize;
                (rr.total_slots as usize).saturating_sub(high_bw.len() * slots) / slots
            }
            None => rr.total_slots as usize,
        };

        let round = high_bw;
        for vl in round.iter() {
            if out.len() >= cap {
                break;
            }
            rr.emit(&mut out, vl);
            if rr.slices[vl] == 0 {
                high_bw.remove(vl);
            }
        }

        for _ in 0..interleave {
            let Some(vl) = next else {
                break;
            };
            if out.len() >= cap {
                break;
            }
            rr.emit(&mut out, vl);
            if rr.slices[vl] == 0 {
                in_use.remove(vl);
            }
            next = in_use.next_from(vl + 1).or_else(|| in_use.first());
        }

        if out.len() == written {
            break;
        }
    }
    out
}

/// Builds the arbitration tables for a port running `qos`.
///
/// Both tables are bounded by the port's high-table capacity, falling back
/// to `vlarb_cap` when the port reports none. The preemption table and
/// matrix are left empty.
pub fn fill_vlarb_table(qos: &Qos, port: &PortArbInfo, config: &QosConfig) -> VlArbTables {
    let mut tables = VlArbTables::default();
    let cap = port.table_cap(config.vlarb_cap);
    let weight = port.entry_weight();

    for (entry, vl) in tables.high.iter_mut().take(cap).zip(qos.high_priority_vls.iter()) {
        *entry = VlArbElement {
            vl: vl as u8,
            weight,
        };
    }

    if !qos.low_priority_vls.is_empty() {
        for (entry, element) in tables.low.iter_mut().zip(fill_low_rr(qos, cap, weight)) {
            *entry = element;
        }
    }
    tables
}

/// Tables used when no QoS applies: one weight-1 entry per data VL
/// (skipping VL15) and every other entry unused.
pub fn fill_vlarb_table_default(num_vls: u8) -> VlArbTables {
    let mut tables = VlArbTables {
        low: vec![VlArbElement::UNUSED; STL_MAX_LOW_CAP],
        high: vec![VlArbElement::UNUSED; STL_MAX_LOW_CAP],
        preempt: vec![VlArbElement::UNUSED; STL_MAX_PREEMPT_CAP],
        matrix: [0; STL_MAX_VLS],
    };
    let data_vls = (0..STL_MAX_LOW_CAP).filter(|&vl| vl != INVALID_VL as usize);
    for (entry, vl) in tables.low.iter_mut().take(num_vls as usize).zip(data_vls) {
        *entry = VlArbElement {
            vl: vl as u8,
            weight: 1,
        };
    }
    tables
}

/// Which arbitration attributes must be written to the port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VlArbUpdate {
    pub high: bool,
    pub low: bool,
    pub matrix: bool,
}

impl VlArbUpdate {
    pub fn any(&self) -> bool {
        self.high || self.low || self.matrix
    }
}

impl VlArbTables {
    /// Compares against the tables last read from or written to the port.
    ///
    /// Only the entries the hardware implements are compared. `current` is
    /// `None` when the port's tables are not known. The matrix only matters
    /// on ports with preemption enabled.
    pub fn needs_update(
        &self,
        current: Option<&VlArbTables>,
        port: &PortArbInfo,
        force: bool,
    ) -> VlArbUpdate {
        let high_cap = (port.arbitration_high_cap as usize).min(STL_MAX_LOW_CAP);
        let low_cap = (port.arbitration_low_cap as usize).min(STL_MAX_LOW_CAP);
        let differs = |cur: &[VlArbElement], new: &[VlArbElement], cap: usize| {
            !cur.iter().take(cap).eq(new.iter().take(cap))
        };

        match current {
            None => VlArbUpdate {
                high: true,
                low: true,
                matrix: port.preemption_enabled,
            },
            Some(cur) => VlArbUpdate {
                high: force || differs(&cur.high, &self.high, high_cap),
                low: force || differs(&cur.low, &self.low, low_cap),
                matrix: port.preemption_enabled && (force || cur.matrix != self.matrix),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn low_qos(bandwidths: &[(usize, u16)], multiplier: u16) -> Qos {
        let mut qos = Qos::new(bandwidths.len() as u8);
        for &(vl, bw) in bandwidths {
            qos.vl_bandwidth[vl] = bw;
            qos.low_priority_vls.insert(vl);
        }
        qos.weight_multiplier = multiplier;
        qos
    }

    fn vls(entries: &[VlArbElement]) -> Vec<u8> {
        entries.iter().map(|e| e.vl).collect()
    }

    fn weight_of(entries: &[VlArbElement], vl: u8) -> u32 {
        entries
            .iter()
            .filter(|e| e.vl == vl)
            .map(|e| u32::from(e.weight))
            .sum()
    }

    #[test]
    fn test_high_bandwidth_vl_is_interleaved() {
        let qos = low_qos(&[(0, 50), (1, 30), (2, 20)], 10);
        let entries = fill_low_rr(&qos, 16, 32);
        assert_eq!(vls(&entries), vec![0, 1, 0, 2, 0, 1, 0, 2, 0, 1]);
        assert!(entries.iter().all(|e| e.weight == 32));
    }

    #[test]
    fn test_five_percent_slices_are_doubled() {
        let qos = low_qos(&[(0, 40), (1, 35), (2, 25)], 5);
        let entries = fill_low_rr(&qos, 16, 32);
        assert_eq!(entries.len(), 11);
        // Weight stays proportional to 8:7:5 slices.
        assert_eq!(weight_of(&entries, 0), 8 * 32);
        assert_eq!(weight_of(&entries, 1), 7 * 32);
        assert_eq!(weight_of(&entries, 2), 5 * 32);
    }

    #[test]
    fn test_overflow_falls_back_to_equal_weights() {
        let lanes: Vec<(usize, u16)> = (0..21).filter(|&vl| vl != 15).map(|vl| (vl, 5)).collect();
        assert_eq!(lanes.len(), 20);
        let qos = low_qos(&lanes, 5);
        let entries = fill_low_rr(&qos, 16, 32);
        assert_eq!(entries.len(), 16);
        assert!(entries.iter().all(|e| e.weight == 32));
        let mut seen = vls(&entries);
        seen.dedup();
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_zero_bandwidth_vls_still_get_a_slice() {
        let qos = low_qos(&[(0, 100), (1, 0)], 100);
        let entries = fill_low_rr(&qos, 16, 8);
        assert_eq!(vls(&entries), vec![0, 1]);
    }

    #[test]
    fn test_fill_vlarb_table_high_and_low() {
        let mut qos = low_qos(&[(0, 60), (1, 40)], 20);
        qos.high_priority_vls.insert(2);
        qos.high_priority_vls.insert(3);
        let port = PortArbInfo {
            mtu_active: 4096,
            ..PortArbInfo::default()
        };
        let tables = fill_vlarb_table(&qos, &port, &QosConfig::default());
        assert_eq!(
            &tables.high[..3],
            &[
                VlArbElement { vl: 2, weight: 64 },
                VlArbElement { vl: 3, weight: 64 },
                VlArbElement::default(),
            ]
        );
        assert_eq!(vls(&tables.low[..5]), vec![0, 0, 1, 0, 1]);
        assert_eq!(tables.low[5], VlArbElement::default());
        assert_eq!(tables.preempt.len(), STL_MAX_PREEMPT_CAP);
    }

    #[test]
    fn test_unreported_cap_uses_configured_cap() {
        let lanes: Vec<(usize, u16)> = (0..10).map(|vl| (vl, 10)).collect();
        let qos = low_qos(&lanes, 10);
        let port = PortArbInfo {
            arbitration_high_cap: 0,
            ..PortArbInfo::default()
        };
        let config = QosConfig {
            vlarb_cap: 8,
            ..QosConfig::default()
        };
        let tables = fill_vlarb_table(&qos, &port, &config);
        assert_eq!(tables.low.iter().filter(|e| e.weight > 0).count(), 8);
    }

    #[test]
    fn test_default_table_skips_vl15() {
        let tables = fill_vlarb_table_default(17);
        assert_eq!(tables.low[14], VlArbElement { vl: 14, weight: 1 });
        assert_eq!(tables.low[15], VlArbElement { vl: 16, weight: 1 });
        assert_eq!(tables.low[16], VlArbElement { vl: 17, weight: 1 });
        assert_eq!(tables.low[17], VlArbElement::UNUSED);
        assert!(tables.high.iter().all(|e| *e == VlArbElement::UNUSED));
        assert!(tables.preempt.iter().all(|e| *e == VlArbElement::UNUSED));
    }

    #[test]
    fn test_needs_update_compares_hardware_prefix() {
        let port = PortArbInfo::default();
        let current = fill_vlarb_table_default(4);
        let mut new = current.clone();
        assert!(!new.needs_update(Some(&current), &port, false).any());

        // Beyond the 16 implemented entries nothing is compared.
        new.low[20] = VlArbElement { vl: 3, weight: 9 };
        assert!(!new.needs_update(Some(&current), &port, false).any());

        new.low[2].weight = 7;
        assert_eq!(
            new.needs_update(Some(&current), &port, false),
            VlArbUpdate {
                high: false,
                low: true,
                matrix: false
            }
        );

        let forced = new.needs_update(Some(&current), &port, true);
        assert!(forced.high && forced.low && !forced.matrix);

        let preempting = PortArbInfo {
            preemption_enabled: true,
            ..port
        };
        assert!(new.needs_update(None, &preempting, false).matrix);
    }
}

//! Virtual fabric inputs and the per-VL-count QoS description.

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Virtual lanes per port, including VL15.
pub const STL_MAX_VLS: usize = 32;
/// Service classes per port.
pub const STL_MAX_SCS: usize = 32;
/// Service levels.
pub const STL_MAX_SLS: usize = 32;
/// SC 15 is never assigned to data traffic; VL 15 is the management lane.
pub const INVALID_SC: u8 = 15;
pub const INVALID_VL: u8 = 15;
/// Width of the VL to VF reverse map.
pub const MAX_VFABRICS: usize = 1000;

/// Set of SC, SL or VL indices below 32.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BitSet32(u32);

impl BitSet32 {
    pub fn insert(&mut self, idx: usize) {
        if idx < 32 {
            self.0 |= 1 << idx;
        }
    }

    pub fn remove(&mut self, idx: usize) {
        if idx < 32 {
            self.0 &= !(1 << idx);
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        idx < 32 && self.0 & (1 << idx) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn first(&self) -> Option<usize> {
        self.next_from(0)
    }

    /// Lowest member at or above `idx`.
    pub fn next_from(&self, idx: usize) -> Option<usize> {
        if idx >= 32 {
            return None;
        }
        let masked = self.0 & (u32::MAX << idx);
        (masked != 0).then(|| masked.trailing_zeros() as usize)
    }

    /// Lowest index at or above `idx` that is not a member.
    pub fn next_zero_from(&self, idx: usize) -> Option<usize> {
        (idx..32).find(|&i| !self.contains(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..32).filter(move |&i| self.contains(i))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl FromIterator<usize> for BitSet32 {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet32::default();
        for idx in iter {
            set.insert(idx);
        }
        set
    }
}

impl fmt::Debug for BitSet32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for BitSet32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for idx in self.iter() {
            seq.serialize_element(&idx)?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfPriority {
    #[default]
    Low,
    High,
}

fn default_routing_scs() -> u8 {
    1
}

fn default_max_mtu() -> u16 {
    2048
}

/// One configured virtual fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFabric {
    pub name: String,
    #[serde(default)]
    pub base_sl: u8,
    /// Unset means the SC numbered like the SL. The fixed-map setup
    /// rewrites it.
    #[serde(default)]
    pub base_sc: Option<u8>,
    #[serde(default = "default_routing_scs")]
    pub routing_scs: u8,
    #[serde(default)]
    pub priority: VfPriority,
    /// 0 is non-preemptible; larger ranks preempt smaller ones.
    #[serde(default)]
    pub preempt_rank: u8,
    /// Bandwidth share in percent.
    #[serde(default)]
    pub bandwidth: u8,
    /// Largest MTU in bytes.
    #[serde(default = "default_max_mtu")]
    pub max_mtu: u16,
    /// Standby fabrics keep their SC/SL but carry no bandwidth.
    #[serde(default)]
    pub standby: bool,
}

impl VirtualFabric {
    pub fn new(name: impl Into<String>, base_sl: u8) -> Self {
        Self {
            name: name.into(),
            base_sl,
            base_sc: None,
            routing_scs: default_routing_scs(),
            priority: VfPriority::Low,
            preempt_rank: 0,
            bandwidth: 0,
            max_mtu: default_max_mtu(),
            standby: false,
        }
    }

    pub fn base_sc(&self) -> u8 {
        self.base_sc.unwrap_or(self.base_sl)
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == VfPriority::High
    }

    /// SCs this fabric routes on, skipping SC 15. SCs past the end of the
    /// SC space are dropped.
    pub fn routing_sc_list(&self) -> Vec<usize> {
        let mut scs = Vec::with_capacity(self.routing_scs as usize);
        let mut sc = self.base_sc() as usize;
        for _ in 0..self.routing_scs {
            if sc == INVALID_SC as usize {
                sc += 1;
            }
            if sc >= STL_MAX_SCS {
                break;
            }
            scs.push(sc);
            sc += 1;
        }
        scs
    }
}

/// The configured virtual fabrics; standby entries stay in place so VF
/// indices are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualFabrics {
    pub vfs: Vec<VirtualFabric>,
}

impl VirtualFabrics {
    pub fn new(vfs: Vec<VirtualFabric>) -> Self {
        Self { vfs }
    }

    pub fn all(&self) -> impl Iterator<Item = &VirtualFabric> {
        self.vfs.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &VirtualFabric> {
        self.vfs.iter().filter(|vf| !vf.standby)
    }

    pub fn len(&self) -> usize {
        self.vfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vfs.is_empty()
    }

    /// First active fabric on `sl`.
    pub fn active_for_sl(&self, sl: u8) -> Option<&VirtualFabric> {
        self.active().find(|vf| vf.base_sl == sl)
    }

    /// First fabric on `sl`, standby included.
    pub fn any_for_sl(&self, sl: u8) -> Option<&VirtualFabric> {
        self.all().find(|vf| vf.base_sl == sl)
    }
}

/// Bandwidth allocated to each SL: the sum over active fabrics on that SL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlBandwidth(pub [u16; STL_MAX_SLS]);

impl SlBandwidth {
    pub fn from_vfs(vfs: &VirtualFabrics) -> Self {
        let mut bw = [0u16; STL_MAX_SLS];
        for vf in vfs.active() {
            if let Some(slot) = bw.get_mut(vf.base_sl as usize) {
                *slot += u16::from(vf.bandwidth);
            }
        }
        Self(bw)
    }

    pub fn get(&self, sl: usize) -> u16 {
        self.0.get(sl).copied().unwrap_or(0)
    }

    /// Total over every SL.
    pub fn total(&self) -> u32 {
        self.0.iter().map(|&bw| u32::from(bw)).sum()
    }
}

/// SL to SC and SC to SL tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScSlMaps {
    pub sl_to_sc: [u8; STL_MAX_SLS],
    pub sc_to_sl: [u8; STL_MAX_SCS],
}

impl ScSlMaps {
    /// SL n rides SC n.
    pub fn identity() -> Self {
        let mut maps = Self {
            sl_to_sc: [0; STL_MAX_SLS],
            sc_to_sl: [0; STL_MAX_SCS],
        };
        for i in 0..STL_MAX_SLS {
            maps.sl_to_sc[i] = i as u8;
            maps.sc_to_sl[i] = i as u8;
        }
        maps
    }

    pub fn assign(&mut self, sl: usize, sc: usize) {
        self.sl_to_sc[sl] = sc as u8;
        self.sc_to_sl[sc] = sl as u8;
    }
}

impl Default for ScSlMaps {
    fn default() -> Self {
        Self::identity()
    }
}

/// QoS description for ports running a given number of data VLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Qos {
    pub num_vls: u8,
    /// VL for each SC; [`INVALID_VL`] for SCs not in use.
    pub sc_to_vl: [u8; STL_MAX_SCS],
    /// Bandwidth percentage per VL, rounded to multiples of 5.
    pub vl_bandwidth: [u16; STL_MAX_VLS],
    pub high_priority_vls: BitSet32,
    pub low_priority_vls: BitSet32,
    /// Bandwidth represented by one arbitration slice.
    pub weight_multiplier: u16,
    pub vl_vf: crate::vlvf::VlVfMap,
}

impl Qos {
    pub fn new(num_vls: u8) -> Self {
        Self {
            num_vls,
            sc_to_vl: [INVALID_VL; STL_MAX_SCS],
            vl_bandwidth: [0; STL_MAX_VLS],
            high_priority_vls: BitSet32::default(),
            low_priority_vls: BitSet32::default(),
            weight_multiplier: 100,
            vl_vf: Default::default(),
        }
    }

    pub fn priority_vls_mut(&mut self, priority: VfPriority) -> &mut BitSet32 {
        match priority {
            VfPriority::High => &mut self.high_priority_vls,
            VfPriority::Low => &mut self.low_priority_vls,
        }
    }

    /// Sum of VL bandwidth over the data VLs.
    pub fn total_bandwidth(&self) -> u32 {
        self.vl_bandwidth.iter().map(|&bw| u32::from(bw)).sum()
    }
}

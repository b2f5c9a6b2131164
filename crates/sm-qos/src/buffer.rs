//! Per-port transmit buffer control.
//!
//! A port's transmit limits are sized against its neighbor's receive
//! buffer. Every data VL in use, and VL15, needs at least one packet of
//! dedicated memory plus the link's wire depth to make progress without
//! credit starvation. The allocation tries three rules in order:
//!
//! * Rule A: every VL gets a packet plus wire depth.
//! * Rule B: only the higher-bandwidth VLs get the wire depth on top of a
//!   packet.
//! * Rule C: lower-bandwidth VLs get no dedicated memory and live off the
//!   shared pool.
//!
//! All sizes are in allocation units (AUs) of the neighbor's buffer.

use crate::error::{QosError, Result};
use crate::types::{Qos, VirtualFabrics, INVALID_VL, STL_MAX_VLS};
use fm_common::config::QosConfig;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Bytes in one link transfer packet.
pub const BYTES_PER_LTP: u32 = 128;

const PROTOCOL_HEADER_SIZE: i64 = 128;
const VL15_MTU: i64 = 2048;
const VL15: usize = INVALID_VL as usize;

/// Buffer-related attributes of one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBufferInfo {
    pub name: String,
    pub mtu_active: u16,
    /// Round trip wire depth in LTPs.
    pub wire_depth: u8,
    /// Replay buffer depth in LTPs.
    pub buffer_depth: u8,
    /// Receive allocation unit exponent: an AU is `8 << buffer_alloc` bytes.
    pub buffer_alloc: u8,
    pub shared_space_supported: bool,
    /// Receive buffer size in AUs.
    pub overall_buffer_space: u32,
}

impl Default for PortBufferInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            mtu_active: 2048,
            wire_depth: 0,
            buffer_depth: 0,
            buffer_alloc: 3,
            shared_space_supported: true,
            overall_buffer_space: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VlBufferLimits {
    pub dedicated: u32,
    pub shared: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferControlTable {
    pub overall_shared_limit: u32,
    pub vl: [VlBufferLimits; STL_MAX_VLS],
}

impl BufferControlTable {
    /// AUs handed out, dedicated and shared.
    pub fn total(&self) -> u64 {
        self.vl
            .iter()
            .map(|limits| u64::from(limits.dedicated))
            .sum::<u64>()
            + u64::from(self.overall_shared_limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferRule {
    A,
    B,
    C,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferAllocation {
    pub table: BufferControlTable,
    pub rule: BufferRule,
}

impl BufferAllocation {
    /// Fails with [`QosError::BufferRuleC`] when some data VLs were left
    /// without dedicated memory. The table is still usable.
    pub fn check(&self) -> Result<()> {
        match self.rule {
            BufferRule::C => Err(QosError::BufferRuleC),
            BufferRule::A | BufferRule::B => Ok(()),
        }
    }
}

/// Wire depth in bytes after applying the configured overrides.
///
/// Each override replaces its port term when set and drops the term when
/// set to 0. The result is the smaller of the remaining terms.
pub fn wire_depth_bytes(port: &PortBufferInfo, config: &QosConfig) -> u32 {
    let term = |ltps: u8, over: Option<u32>| match over {
        None => Some(u32::from(ltps) * BYTES_PER_LTP),
        Some(0) => None,
        Some(bytes) => Some(bytes),
    };
    let wire = term(port.wire_depth, config.wire_depth_override);
    let replay = term(port.buffer_depth, config.replay_depth_override);
    wire.into_iter().chain(replay).min().unwrap_or(0)
}

fn to_au(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Computes buffer limits for `mem_size` AUs of receive memory.
///
/// `bandwidth` and `mtu` (bytes) are per VL; VLs with no bandwidth get no
/// memory except VL15, which always gets two management packets.
/// `wire_depth` is in AUs. Fails when the memory cannot hold VL15's
/// dedicated allocation.
pub fn setup_buffer_control(
    mem_size: u32,
    bandwidth: &[u16; STL_MAX_VLS],
    mtu: &[u16; STL_MAX_VLS],
    wire_depth: u32,
    au: u32,
    shared_mem: bool,
    config: &QosConfig,
) -> Result<BufferAllocation> {
    if au == 0 {
        return Err(QosError::invalid_port("allocation unit is zero"));
    }
    let mem = i64::from(mem_size);
    let wd = i64::from(wire_depth);
    let au = i64::from(au);
    let round_up = |bytes: i64| (bytes + au - 1) / au;

    let mut mult = i64::from(config.dedicated_vl_mem_multi);
    if !shared_mem && mult == 0 {
        mult = 1;
    }
    let mut min_shared = if shared_mem {
        i64::from(config.min_shared_vl_mem) * mem / 100
    } else {
        0
    };

    let mut packet = [0i64; STL_MAX_VLS];
    for (vl, size) in packet.iter_mut().enumerate() {
        if vl == VL15 {
            *size = round_up((VL15_MTU + PROTOCOL_HEADER_SIZE) * 2);
        } else if bandwidth[vl] > 0 {
            *size = round_up((i64::from(mtu[vl]) + PROTOCOL_HEADER_SIZE) * mult);
        }
    }
    // The shared reserve gives way before VL15 does.
    let vl15 = packet[VL15] + wd;
    if mem - min_shared - vl15 < 0 {
        min_shared = if min_shared > vl15 { min_shared - vl15 } else { 0 };
    }

    let mut dedicated = [0i64; STL_MAX_VLS];
    let mut rule = BufferRule::A;
    let mut remaining = mem - min_shared;
    let mut interval = 1;
    for (vl, &size) in packet.iter().enumerate() {
        if size > 0 {
            remaining -= size + wd;
            if remaining < 0 {
                break;
            }
            interval += size;
            dedicated[vl] = size + wd;
        }
    }
    // Without shared memory the leftover is dealt out in whole packets.
    let rounds = remaining / interval;
    if !shared_mem && rounds > 0 {
        for (ded, &size) in dedicated.iter_mut().zip(packet.iter()) {
            if size > 0 {
                *ded += size * rounds;
            }
        }
    }

    let mut ranks = bandwidth.map(i64::from);
    ranks.sort_unstable();
    let favored = |vl: usize, rank: i64| i64::from(bandwidth[vl]) > rank || vl == VL15;
    // Distinct bandwidths, lowest first.
    let thresholds: Vec<i64> = ranks.iter().copied().dedup().collect();

    if remaining < 0 && wd > 0 {
        rule = BufferRule::B;
        for &rank in &thresholds {
            remaining = mem - min_shared;
            for (vl, ded) in dedicated.iter_mut().enumerate() {
                *ded = if favored(vl, rank) {
                    packet[vl] + wd
                } else {
                    packet[vl]
                };
                remaining -= *ded;
                if remaining < 0 {
                    break;
                }
            }
            if remaining >= 0 {
                break;
            }
        }
    }

    if remaining < 0 {
        rule = BufferRule::C;
        for &rank in &thresholds {
            let mut max_undedicated = 0;
            remaining = mem - min_shared;
            for (vl, ded) in dedicated.iter_mut().enumerate() {
                if favored(vl, rank) {
                    remaining -= packet[vl] + wd;
                    if remaining < 0 {
                        break;
                    }
                    *ded = packet[vl] + wd;
                } else {
                    max_undedicated = max_undedicated.max(packet[vl] + wd);
                    *ded = 0;
                }
            }
            // With a shared pool, the VLs left without dedicated memory
            // must still fit a packet in it.
            if remaining >= 0 && (!shared_mem || remaining + min_shared >= max_undedicated) {
                break;
            }
        }
        if remaining < 0 {
            return Err(QosError::invalid_port(format!(
                "{mem_size} AUs cannot hold the VL15 dedicated allocation"
            )));
        }
    }

    let shared = if shared_mem { remaining + min_shared } else { 0 };
    let mut table = BufferControlTable {
        overall_shared_limit: to_au(shared),
        ..BufferControlTable::default()
    };
    for (vl, limits) in table.vl.iter_mut().enumerate() {
        limits.dedicated = to_au(dedicated[vl]);
        let in_use = vl == VL15 || bandwidth[vl] > 0;
        // Under rule C only VLs without dedicated memory may use the pool.
        if in_use && (rule != BufferRule::C || dedicated[vl] == 0) {
            limits.shared = to_au(shared);
        }
    }
    Ok(BufferAllocation { table, rule })
}

/// Per-VL bandwidth and MTU demanded by the active fabrics on each VL.
///
/// A VL carrying only fabrics without a bandwidth share still needs
/// buffer, so it counts as 1%.
fn vl_demand(
    qos: &Qos,
    vfs: &VirtualFabrics,
    mtu_active: u16,
) -> ([u16; STL_MAX_VLS], [u16; STL_MAX_VLS]) {
    let mut bandwidth = [0u16; STL_MAX_VLS];
    let mut mtu = [0u16; STL_MAX_VLS];
    for (vl, (bw, vl_mtu)) in bandwidth.iter_mut().zip(mtu.iter_mut()).enumerate() {
        let mut carried = false;
        let on_vl = qos.vl_vf.vfs_on(vl).iter().filter_map(|&idx| vfs.vfs.get(idx));
        for vf in on_vl.filter(|vf| !vf.standby) {
            carried = true;
            *bw = bw.saturating_add(u16::from(vf.bandwidth));
            *vl_mtu = (*vl_mtu).max(vf.max_mtu);
        }
        if carried {
            *bw = (*bw).max(1);
            *vl_mtu = (*vl_mtu).min(mtu_active);
        }
    }
    (bandwidth, mtu)
}

/// Buffer control for `port`, sized against its neighbor's receive buffer.
///
/// Applying rule C is logged and still returns the allocation; callers
/// that must know use [`BufferAllocation::check`].
pub fn initialize_port_buffer_control(
    port: &PortBufferInfo,
    neighbor: Option<&PortBufferInfo>,
    qos: &Qos,
    vfs: &VirtualFabrics,
    config: &QosConfig,
) -> Result<BufferAllocation> {
    let Some(neighbor) = neighbor else {
        error!(port = %port.name, "Unable to find neighbor port");
        return Err(QosError::invalid_port(format!("{} has no neighbor", port.name)));
    };
    if neighbor.buffer_alloc > 7 {
        return Err(QosError::invalid_port(format!(
            "{} reports buffer allocation exponent {}",
            neighbor.name, neighbor.buffer_alloc
        )));
    }
    if neighbor.overall_buffer_space == 0 {
        error!(neighbor = %neighbor.name, "Overall Rx buffer size is zero");
        return Err(QosError::invalid_port(format!(
            "{} has no receive buffer",
            neighbor.name
        )));
    }

    let au = 8u32 << neighbor.buffer_alloc;
    let wd = wire_depth_bytes(port, config).div_ceil(au);
    let (bandwidth, mtu) = vl_demand(qos, vfs, port.mtu_active);

    let allocation = setup_buffer_control(
        neighbor.overall_buffer_space,
        &bandwidth,
        &mtu,
        wd,
        au,
        neighbor.shared_space_supported,
        config,
    )?;
    if let Err(e) = allocation.check() {
        error!(port = %port.name, error = %e, "Errors encountered setting up buffer control");
    }
    debug!(
        port = %port.name,
        au,
        wire_depth = wd,
        mem = neighbor.overall_buffer_space,
        rule = ?allocation.rule,
        shared = allocation.table.overall_shared_limit,
        "Buffer control computed"
    );
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VirtualFabric;
    use crate::vlvf::setup_vlvf_map;
    use pretty_assertions::assert_eq;

    fn two_vls() -> ([u16; STL_MAX_VLS], [u16; STL_MAX_VLS]) {
        let mut bw = [0u16; STL_MAX_VLS];
        let mut mtu = [0u16; STL_MAX_VLS];
        bw[0] = 60;
        bw[1] = 40;
        mtu[0] = 2048;
        mtu[1] = 2048;
        (bw, mtu)
    }

    fn dedicated(alloc: &BufferAllocation) -> Vec<(usize, u32)> {
        alloc
            .table
            .vl
            .iter()
            .enumerate()
            .filter(|(_, l)| l.dedicated > 0)
            .map(|(vl, l)| (vl, l.dedicated))
            .collect()
    }

    // With 64-byte AUs every packet below is 68 AUs: (2048 + 128) * 2 / 64.

    #[test]
    fn test_rule_a_with_shared_pool() {
        let (bw, mtu) = two_vls();
        let alloc =
            setup_buffer_control(1000, &bw, &mtu, 2, 64, true, &QosConfig::default()).unwrap();
        assert_eq!(alloc.rule, BufferRule::A);
        assert_eq!(dedicated(&alloc), vec![(0, 70), (1, 70), (15, 70)]);
        assert_eq!(alloc.table.overall_shared_limit, 790);
        assert_eq!(alloc.table.vl[0].shared, 790);
        assert_eq!(alloc.table.vl[15].shared, 790);
        assert_eq!(alloc.table.vl[2].shared, 0);
        assert_eq!(alloc.table.total(), 1000);
        assert!(alloc.check().is_ok());
    }

    #[test]
    fn test_rule_a_without_shared_pool_spreads_whole_packets() {
        let (bw, mtu) = two_vls();
        let alloc =
            setup_buffer_control(1000, &bw, &mtu, 2, 64, false, &QosConfig::default()).unwrap();
        assert_eq!(alloc.rule, BufferRule::A);
        // 790 AUs left over 205-AU rounds: three more packets each.
        assert_eq!(dedicated(&alloc), vec![(0, 274), (1, 274), (15, 274)]);
        assert_eq!(alloc.table.overall_shared_limit, 0);
        assert!(alloc.table.vl.iter().all(|l| l.shared == 0));
    }

    #[test]
    fn test_rule_b_drops_wire_depth_from_low_bandwidth_vls() {
        let (bw, mtu) = two_vls();
        let alloc =
            setup_buffer_control(250, &bw, &mtu, 20, 64, true, &QosConfig::default()).unwrap();
        assert_eq!(alloc.rule, BufferRule::B);
        assert_eq!(dedicated(&alloc), vec![(0, 88), (1, 68), (15, 88)]);
        assert_eq!(alloc.table.overall_shared_limit, 6);
        assert_eq!(alloc.table.total(), 250);
    }

    #[test]
    fn test_rule_c_leaves_data_vls_on_the_shared_pool() {
        let (bw, mtu) = two_vls();
        let alloc =
            setup_buffer_control(200, &bw, &mtu, 20, 64, true, &QosConfig::default()).unwrap();
        assert_eq!(alloc.rule, BufferRule::C);
        assert_eq!(dedicated(&alloc), vec![(15, 88)]);
        assert_eq!(alloc.table.overall_shared_limit, 112);
        assert_eq!(alloc.table.vl[0].shared, 112);
        assert_eq!(alloc.table.vl[1].shared, 112);
        assert_eq!(alloc.table.vl[15].shared, 0);
        assert_eq!(alloc.check(), Err(QosError::BufferRuleC));
    }

    #[test]
    fn test_memory_too_small_for_vl15() {
        let (bw, mtu) = two_vls();
        let err =
            setup_buffer_control(50, &bw, &mtu, 20, 64, true, &QosConfig::default()).unwrap_err();
        assert!(matches!(err, QosError::InvalidPort { .. }));
    }

    #[test]
    fn test_minimum_shared_reserve() {
        let (bw, mtu) = two_vls();
        let config = QosConfig {
            min_shared_vl_mem: 50,
            ..QosConfig::default()
        };
        // Half of 700 AUs is reserved, leaving dedicated room for VL15 only.
        let alloc = setup_buffer_control(700, &bw, &mtu, 200, 64, true, &config).unwrap();
        assert_eq!(alloc.rule, BufferRule::C);
        let alloc = setup_buffer_control(1000, &bw, &mtu, 2, 64, true, &config).unwrap();
        assert_eq!(alloc.rule, BufferRule::A);
        assert_eq!(alloc.table.overall_shared_limit, 790);
    }

    #[test]
    fn test_wire_depth_overrides() {
        let port = PortBufferInfo {
            wire_depth: 10,
            buffer_depth: 4,
            ..PortBufferInfo::default()
        };
        let depth = |wire, replay| {
            let config = QosConfig {
                wire_depth_override: wire,
                replay_depth_override: replay,
                ..QosConfig::default()
            };
            wire_depth_bytes(&port, &config)
        };
        assert_eq!(depth(None, None), 512);
        assert_eq!(depth(None, Some(0)), 1280);
        assert_eq!(depth(None, Some(300)), 300);
        assert_eq!(depth(Some(0), None), 512);
        assert_eq!(depth(Some(0), Some(0)), 0);
        assert_eq!(depth(Some(0), Some(900)), 900);
        assert_eq!(depth(Some(256), None), 256);
        assert_eq!(depth(Some(2000), Some(0)), 2000);
        assert_eq!(depth(Some(2000), Some(700)), 700);
    }

    #[test]
    fn test_port_buffer_control_from_fabrics() {
        let mut qos = Qos::new(2);
        qos.sc_to_vl[0] = 0;
        qos.sc_to_vl[1] = 1;
        let mut compute = VirtualFabric::new("Compute", 0);
        compute.bandwidth = 70;
        compute.max_mtu = 8192;
        let mut admin = VirtualFabric::new("Admin", 1);
        admin.bandwidth = 30;
        let vfs = VirtualFabrics::new(vec![compute, admin]);
        qos.vl_vf = setup_vlvf_map(&qos, &vfs);

        let port = PortBufferInfo {
            name: "sw1:1".into(),
            mtu_active: 4096,
            wire_depth: 4,
            buffer_depth: 8,
            ..PortBufferInfo::default()
        };
        let neighbor = PortBufferInfo {
            name: "hfi1:1".into(),
            overall_buffer_space: 2000,
            ..PortBufferInfo::default()
        };
        let config = QosConfig::default();
        let alloc =
            initialize_port_buffer_control(&port, Some(&neighbor), &qos, &vfs, &config).unwrap();
        // 64-byte AUs; wire depth 512 bytes is 8 AUs. VL0 is capped at the
        // active MTU: (4096 + 128) * 2 / 64 = 132.
        assert_eq!(alloc.rule, BufferRule::A);
        assert_eq!(dedicated(&alloc), vec![(0, 140), (1, 76), (15, 76)]);
        assert_eq!(alloc.table.total(), 2000);

        assert!(initialize_port_buffer_control(&port, None, &qos, &vfs, &config).is_err());
        let empty = PortBufferInfo {
            overall_buffer_space: 0,
            ..neighbor
        };
        assert!(initialize_port_buffer_control(&port, Some(&empty), &qos, &vfs, &config).is_err());
    }
}

//! VL to virtual fabric reverse map.
//!
//! Buffer control and SA VF queries need to know which fabrics share a VL.
//! VF indices refer to positions in [`VirtualFabrics::vfs`], standby fabrics
//! included.

use crate::types::{Qos, VirtualFabrics, INVALID_VL, MAX_VFABRICS, STL_MAX_VLS};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VlVfMap(Vec<Vec<usize>>);

impl Default for VlVfMap {
    fn default() -> Self {
        Self(vec![Vec::new(); STL_MAX_VLS])
    }
}

impl VlVfMap {
    /// Fabrics carried on `vl`, in configuration order.
    pub fn vfs_on(&self, vl: usize) -> &[usize] {
        self.0.get(vl).map(Vec::as_slice).unwrap_or(&[])
    }

    fn add(&mut self, vl: usize, vf: usize) {
        let on_vl = &mut self.0[vl];
        if !on_vl.contains(&vf) {
            on_vl.push(vf);
        }
    }
}

/// Builds the reverse map from each fabric's routing SCs and the SC to VL
/// table of `qos`.
pub fn setup_vlvf_map(qos: &Qos, vfs: &VirtualFabrics) -> VlVfMap {
    let mut map = VlVfMap::default();
    if vfs.len() >= MAX_VFABRICS {
        error!(count = vfs.len(), "Unexpected number of VFs");
        return map;
    }

    for (idx, vf) in vfs.all().enumerate() {
        for sc in vf.routing_sc_list() {
            let vl = qos.sc_to_vl[sc];
            if vl == INVALID_VL || vl as usize >= STL_MAX_VLS {
                warn!(vf = %vf.name, sc, vl, num_vls = qos.num_vls, "Unexpected SC:VL mapping");
                continue;
            }
            map.add(vl as usize, idx);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VirtualFabric;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_vfs_sharing_a_vl() {
        let mut qos = Qos::new(2);
        qos.sc_to_vl[0] = 0;
        qos.sc_to_vl[1] = 1;
        qos.sc_to_vl[2] = 1;
        let mut storage = VirtualFabric::new("Storage", 1);
        storage.routing_scs = 2;
        let vfs = VirtualFabrics::new(vec![
            VirtualFabric::new("Default", 0),
            storage,
            VirtualFabric::new("Admin", 2),
        ]);

        let map = setup_vlvf_map(&qos, &vfs);
        assert_eq!(map.vfs_on(0), &[0]);
        // Storage reaches VL1 through both of its SCs but is listed once.
        assert_eq!(map.vfs_on(1), &[1, 2]);
        assert!(map.vfs_on(2).is_empty());
        assert!(map.vfs_on(40).is_empty());
    }

    #[test]
    fn test_unmapped_sc_is_skipped() {
        let qos = Qos::new(1);
        let vfs = VirtualFabrics::new(vec![VirtualFabric::new("Default", 0)]);
        let map = setup_vlvf_map(&qos, &vfs);
        assert!((0..STL_MAX_VLS).all(|vl| map.vfs_on(vl).is_empty()));
    }
}

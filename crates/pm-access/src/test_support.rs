//! Fixtures shared by the unit tests.

use crate::image::{
    ImageData, NodeIdentity, NodeType, PmNode, PmPort, PortRef, VfDescriptor, VfVlMap,
};
use crate::store::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Clock advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn node(lid: u32, guid: u64, desc: &str, node_type: NodeType, ports: &[u8], group: u8) -> PmNode {
    let identity = Arc::new(NodeIdentity {
        guid,
        node_desc: desc.to_string(),
        node_type,
    });
    let mut n = PmNode::new(identity, lid, ports.len() as u8);
    for &p in ports {
        let mut port = PmPort::new(p, guid + u64::from(p));
        port.groups = vec![group];
        if p != 0 {
            port.vf_vl_map = vec![
                VfVlMap { vf: 0, vl_mask: 0b01 },
                VfVlMap { vf: 1, vl_mask: 0b10 },
            ];
        }
        n.ports.insert(p, port);
    }
    n
}

/// One switch (LID 1, ports 0-4) and three FIs (LIDs 2-4) cabled to switch
/// ports 1-3. Groups: `SWs` (index 0) and `HFIs` (index 1).
pub fn small_fabric(sweep_num: u32, sweep_start: u64) -> ImageData {
    let mut image = ImageData::new(sweep_num, sweep_start, 10);
    image.groups = vec!["SWs".to_string(), "HFIs".to_string()];
    image.vfs = vec![
        VfDescriptor {
            name: "Default".to_string(),
            active: true,
        },
        VfDescriptor {
            name: "Storage".to_string(),
            active: true,
        },
    ];
    image.insert_node(node(1, 0x1000, "sw1", NodeType::Switch, &[0, 1, 2, 3, 4], 0));
    for lid in 2..=4u32 {
        let desc = format!("hfi{} hfi1_0", lid);
        image.insert_node(node(lid, 0x2000 + u64::from(lid) * 0x10, &desc, NodeType::Fi, &[1], 1));
        image.link(
            PortRef {
                lid: 1,
                port_num: (lid - 1) as u8,
            },
            PortRef { lid, port_num: 1 },
        );
    }
    image
}

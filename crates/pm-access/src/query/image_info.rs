//! Image summary.

use crate::error::Result;
use crate::image::{ImageData, PmNode, PmPort, SmInfo, SweepCounts};
use crate::image_id::{ImageIdQuery, ReturnedImageId};
use crate::store::PmStore;
use serde::Serialize;

/// Subnet manager seen by the sweep, resolved against the image's LID map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmSummary {
    pub lid: u32,
    /// Port the SM's LID is assigned to; 0 when the LID is not in the image.
    pub port_num: u8,
    pub port_guid: u64,
    pub priority: u8,
    pub state: u8,
    pub node_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub sweep_start: u64,
    pub sweep_duration: u32,
    pub image_interval: u32,
    pub counts: SweepCounts,
    pub num_switch_nodes: u32,
    pub num_switch_ports: u32,
    pub num_fi_nodes: u32,
    pub num_fi_ports: u32,
    pub num_links: u32,
    pub num_sms: u32,
    pub sms: [SmSummary; 2],
    /// Ring freeze-frame slots still available.
    pub free_freeze_frames: u32,
    /// Composite cache slots still available.
    pub free_composite_frames: u32,
}

/// The port a node's LID is assigned to: port 0 on switches, the first
/// port otherwise.
fn lided_port(node: &PmNode) -> Option<&PmPort> {
    if node.is_switch() {
        node.port(0)
    } else {
        node.ports.values().next()
    }
}

fn sm_summary(image: &ImageData, sm: &SmInfo) -> SmSummary {
    let mut summary = SmSummary {
        lid: sm.lid,
        priority: sm.priority,
        state: sm.state,
        ..SmSummary::default()
    };
    if let Some(node) = image.node(sm.lid) {
        if let Some(port) = lided_port(node) {
            summary.port_num = port.port_num;
            summary.port_guid = port.guid;
        }
        summary.node_desc = node.node_desc().to_string();
    }
    summary
}

/// Links counted once, from the end with the lower (LID, port).
fn count_links(image: &ImageData) -> u32 {
    let mut links = 0u32;
    for (node, port) in image.ports() {
        if let Some((peer_node, peer)) = image.neighbor(port) {
            if (node.lid, port.port_num) < (peer_node.lid, peer.port_num) {
                links += 1;
            }
        }
    }
    links
}

impl PmStore {
    /// Summary of one image: sweep timing, node and port counts, the SMs
    /// and the freeze-frame capacity left.
    pub fn get_image_info(&self, query: &ImageIdQuery) -> Result<(ImageInfo, ReturnedImageId)> {
        let _busy = self.enter()?;
        let (free_freeze_frames, free_composite_frames) = {
            let state = self.state.read();
            let ring = state.freeze_frames.iter().filter(|f| f.is_none()).count();
            (ring as u32, state.composites.free_slots() as u32)
        };
        let (image, returned) = self.read_image(query)?;

        let info = ImageInfo {
            sweep_start: image.sweep_start,
            sweep_duration: image.sweep_duration,
            image_interval: image.image_interval,
            counts: image.counts,
            num_switch_nodes: image.num_switch_nodes(),
            num_switch_ports: image.num_switch_ports(),
            num_fi_nodes: image.num_fi_nodes(),
            num_fi_ports: image.num_fi_ports(),
            num_links: count_links(&image),
            num_sms: image.sm_info.iter().filter(|sm| sm.lid != 0).count() as u32,
            sms: [
                sm_summary(&image, &image.sm_info[0]),
                sm_summary(&image, &image.sm_info[1]),
            ],
            free_freeze_frames,
            free_composite_frames,
        };
        Ok((info, returned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_fabric, ManualClock};
    use fm_common::config::PmConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_image_info() {
        let mut image = small_fabric(3, 500);
        image.sweep_duration = 7;
        image.counts.no_resp_ports = 2;
        image.sm_info[0] = SmInfo {
            lid: 1,
            port_guid: 0x1000,
            priority: 8,
            state: 3,
        };
        let config = PmConfig::default();
        let ff = config.freeze_frame_images as u32;
        let store = PmStore::with_clock(config, Arc::new(ManualClock::new(1_000))).unwrap();
        store.commit_sweep(image).unwrap();

        let (info, returned) = store.get_image_info(&ImageIdQuery::live()).unwrap();
        assert_eq!(returned.image_time, 500);
        assert_eq!(info.sweep_duration, 7);
        assert_eq!(info.counts.no_resp_ports, 2);
        assert_eq!(info.num_switch_nodes, 1);
        assert_eq!(info.num_fi_nodes, 3);
        assert_eq!(info.num_links, 3);
        assert_eq!(info.num_sms, 1);
        assert_eq!(info.sms[0].node_desc, "sw1");
        assert_eq!(info.sms[0].port_num, 0);
        assert_eq!(info.sms[1], SmSummary::default());
        assert_eq!(info.free_freeze_frames, ff);
    }

    #[test]
    fn test_image_info_without_image() {
        let store =
            PmStore::with_clock(PmConfig::default(), Arc::new(ManualClock::new(1_000))).unwrap();
        assert!(store.get_image_info(&ImageIdQuery::live()).is_err());
        assert_eq!(store.busy_count(), 0);
    }
}

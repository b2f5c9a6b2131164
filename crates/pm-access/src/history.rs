//! Short-term history: composite images and their reconstitution.
//!
//! A composite buffer is a fixed header followed by one or more divisions:
//!
//! ```text
//! +------+---------+------------+-----------+-----+-------+-----+--------+-----------+
//! | tag  | version | compressed | flat size | ids | id... | div | size.. | payload.. |
//! | u8   | u32     | u8         | u64       | u8  | u64   | u16 | u64    |           |
//! +------+---------+------------+-----------+-----+-------+-----+--------+-----------+
//! ```
//!
//! The tag selects the byte order of every following header field. The
//! payload is the JSON encoding of a [`CompositeImage`], split into
//! divisions which are zlib-compressed independently when the compressed
//! flag is set. `flat size` is the length of the reassembled payload.

use crate::counters::{PortCounters, VlCounters, STL_MAX_VLS};
use crate::error::{PaError, PaStatusCode, Result};
use crate::image::{
    ImageData, NodeIdentity, NodeType, PmNode, PmPort, PortRef, QueryStatus, SmInfo, SweepCounts,
    VfDescriptor, VfVlMap, PM_MAX_GROUPS_PER_PORT,
};
use crate::image_id::{ImageId, HISTORY_INDEX_CURRENT, HISTORY_INDEX_RECORD};
use crate::store::{log_integrated, PmStore, StoreState};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use fm_common::audit::AuditCategory;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// History format version; any other value is rejected.
pub const PM_HISTORY_VERSION: u32 = (3 << 24) | 2;

const TAG_LITTLE_ENDIAN: u8 = b'L';
const TAG_BIG_ENDIAN: u8 = b'B';

/// Upper bound on divisions in one buffer.
pub const MAX_DIVISIONS: u16 = 64;

/// Byte order of a composite header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryByteOrder {
    #[default]
    Little,
    Big,
}

impl HistoryByteOrder {
    fn tag(self) -> u8 {
        match self {
            HistoryByteOrder::Little => TAG_LITTLE_ENDIAN,
            HistoryByteOrder::Big => TAG_BIG_ENDIAN,
        }
    }
}

/// Loads and stores composite buffers (history files, master sync).
pub trait HistorySource: Send + Sync {
    /// Returns the composite buffer recorded under `id`.
    fn load(&self, id: ImageId) -> Option<Vec<u8>>;

    /// Records a completed composite.
    fn store(&self, _id: ImageId, _bytes: Vec<u8>) {}
}

/// [`HistorySource`] that keeps composites in memory.
#[derive(Debug, Default)]
pub struct MemoryHistorySource {
    records: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryHistorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ImageId, bytes: Vec<u8>) {
        self.records.lock().insert(id.to_raw(), bytes);
    }

    /// Ids of every stored record, in ascending order.
    pub fn ids(&self) -> Vec<ImageId> {
        let mut raw: Vec<u64> = self.records.lock().keys().copied().collect();
        raw.sort_unstable();
        raw.into_iter().filter_map(|r| ImageId::from_raw(r).ok()).collect()
    }
}

impl HistorySource for MemoryHistorySource {
    fn load(&self, id: ImageId) -> Option<Vec<u8>> {
        self.records.lock().get(&id.to_raw()).cloned()
    }

    fn store(&self, id: ImageId, bytes: Vec<u8>) {
        self.insert(id, bytes);
    }
}

/// Flattened fabric snapshot carried in a composite payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeImage {
    pub sweep_num: u32,
    pub sweep_start: u64,
    pub sweep_duration: u32,
    pub image_interval: u32,
    pub counts: SweepCounts,
    pub sm_info: [SmInfo; 2],
    pub groups: Vec<String>,
    pub vfs: Vec<VfDescriptor>,
    pub max_lid: u32,
    pub nodes: Vec<CompositeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeNode {
    pub guid: u64,
    pub node_desc: String,
    pub node_type: NodeType,
    pub lid: u32,
    pub num_ports: u8,
    pub ports: Vec<CompositePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositePort {
    pub port_num: u8,
    pub guid: u64,
    pub lane_speed_gbps: u32,
    pub active_width: u8,
    pub mtu: u16,
    pub neighbor_lid: u32,
    pub neighbor_port_num: u8,
    pub initialized: bool,
    pub query_status: QueryStatus,
    pub unexpected_clear: bool,
    /// Group names, resolved against the image's group table on rebuild.
    pub groups: Vec<String>,
    pub vf_vl_map: Vec<VfVlMap>,
    pub counters: PortCounters,
    pub delta: PortCounters,
    pub vl_counters: [VlCounters; STL_MAX_VLS],
    pub delta_vl: [VlCounters; STL_MAX_VLS],
}

impl CompositeImage {
    pub fn from_image(image: &ImageData) -> Self {
        let nodes = image
            .nodes()
            .map(|node| CompositeNode {
                guid: node.guid(),
                node_desc: node.node_desc().to_string(),
                node_type: node.identity.node_type,
                lid: node.lid,
                num_ports: node.num_ports,
                ports: node
                    .ports
                    .values()
                    .map(|port| CompositePort {
                        port_num: port.port_num,
                        guid: port.guid,
                        lane_speed_gbps: port.lane_speed_gbps,
                        active_width: port.active_width,
                        mtu: port.mtu,
                        neighbor_lid: port.neighbor_lid,
                        neighbor_port_num: port.neighbor_port_num,
                        initialized: port.initialized,
                        query_status: port.query_status,
                        unexpected_clear: port.unexpected_clear,
                        groups: port
                            .groups
                            .iter()
                            .filter_map(|&g| image.groups.get(usize::from(g)).cloned())
                            .collect(),
                        vf_vl_map: port.vf_vl_map.clone(),
                        counters: port.counters,
                        delta: port.delta,
                        vl_counters: port.vl_counters,
                        delta_vl: port.delta_vl,
                    })
                    .collect(),
            })
            .collect();
        Self {
            sweep_num: image.sweep_num,
            sweep_start: image.sweep_start,
            sweep_duration: image.sweep_duration,
            image_interval: image.image_interval,
            counts: image.counts,
            sm_info: image.sm_info.clone(),
            groups: image.groups.clone(),
            vfs: image.vfs.clone(),
            max_lid: image.max_lid,
            nodes,
        }
    }

    /// Rebuilds an [`ImageData`]: a copy pass installing every node, then a
    /// link pass resolving each initialized port's declared neighbor
    /// against the new LID map.
    pub fn into_image(self) -> Result<ImageData> {
        let mut image = ImageData::new(self.sweep_num, self.sweep_start, self.image_interval);
        image.sweep_duration = self.sweep_duration;
        image.counts = self.counts;
        image.sm_info = self.sm_info;
        image.vfs = self.vfs;

        let group_index: HashMap<&str, u8> = self
            .groups
            .iter()
            .enumerate()
            .filter_map(|(i, name)| u8::try_from(i).ok().map(|i| (name.as_str(), i)))
            .collect();

        let max_lid = self.nodes.iter().map(|n| n.lid).max().unwrap_or(0).max(self.max_lid);
        image
            .lid_map
            .try_reserve(max_lid as usize + 1)?;

        let mut guids = HashSet::new();
        for node in &self.nodes {
            if node.lid == 0 {
                return Err(PaError::corrupt(format!(
                    "node {:#018x} has LID 0",
                    node.guid
                )));
            }
            if !guids.insert(node.guid) {
                return Err(PaError::corrupt(format!("duplicate node GUID {:#018x}", node.guid)));
            }
            if image.node(node.lid).is_some() {
                return Err(PaError::corrupt(format!("duplicate LID {:#x}", node.lid)));
            }
            let identity = Arc::new(NodeIdentity {
                guid: node.guid,
                node_desc: node.node_desc.clone(),
                node_type: node.node_type,
            });
            let mut pm_node = PmNode::new(identity, node.lid, node.num_ports);
            for port in &node.ports {
                let mut groups = Vec::with_capacity(port.groups.len());
                for name in &port.groups {
                    match group_index.get(name.as_str()) {
                        Some(&idx) if groups.len() < PM_MAX_GROUPS_PER_PORT => groups.push(idx),
                        Some(_) => {
                            warn!(lid = node.lid, port = port.port_num, group = %name, "Port group list full, dropping group");
                        }
                        None => {
                            error!(lid = node.lid, port = port.port_num, group = %name, "Unknown group in composite, dropping");
                        }
                    }
                }
                let mut pm_port = PmPort::new(port.port_num, port.guid);
                pm_port.lane_speed_gbps = port.lane_speed_gbps;
                pm_port.active_width = port.active_width;
                pm_port.mtu = port.mtu;
                pm_port.neighbor_lid = port.neighbor_lid;
                pm_port.neighbor_port_num = port.neighbor_port_num;
                pm_port.initialized = port.initialized;
                pm_port.query_status = port.query_status;
                pm_port.unexpected_clear = port.unexpected_clear;
                pm_port.groups = groups;
                pm_port.vf_vl_map = port.vf_vl_map.clone();
                pm_port.counters = port.counters;
                pm_port.delta = port.delta;
                pm_port.vl_counters = port.vl_counters;
                pm_port.delta_vl = port.delta_vl;
                pm_node.ports.insert(port.port_num, pm_port);
            }
            image.insert_node(pm_node);
        }
        image.groups = self.groups;
        image.max_lid = max_lid;

        let mut links = Vec::new();
        for (node, port) in image.ports() {
            if !port.initialized || port.neighbor_lid == 0 {
                continue;
            }
            let target = PortRef {
                lid: port.neighbor_lid,
                port_num: port.neighbor_port_num,
            };
            if image.find_port(target.lid, target.port_num).is_none() {
                error!(
                    lid = node.lid,
                    port = port.port_num,
                    neighbor_lid = target.lid,
                    neighbor_port = target.port_num,
                    "Unable to resolve neighbor"
                );
                return Err(PaError::corrupt(format!(
                    "neighbor {}:{} of port {}:{} is not in the image",
                    target.lid, target.port_num, node.lid, port.port_num
                )));
            }
            links.push((node.lid, port.port_num, target));
        }
        for (lid, port_num, target) in links {
            if let Some(port) = image.node_mut(lid).and_then(|n| n.port_mut(port_num)) {
                port.neighbor = Some(target);
            }
        }
        Ok(image)
    }
}

/// Header and payload of a decoded composite buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedComposite {
    pub image_ids: Vec<ImageId>,
    pub composite: CompositeImage,
}

/// Encodes `image` as a composite buffer.
pub fn encode_composite(
    image: &ImageData,
    image_ids: &[ImageId],
    compress: bool,
    divisions: u16,
    order: HistoryByteOrder,
) -> Result<Vec<u8>> {
    match order {
        HistoryByteOrder::Little => {
            encode_with::<LittleEndian>(image, image_ids, compress, divisions, order)
        }
        HistoryByteOrder::Big => encode_with::<BigEndian>(image, image_ids, compress, divisions, order),
    }
}

fn encode_with<B: ByteOrder>(
    image: &ImageData,
    image_ids: &[ImageId],
    compress: bool,
    divisions: u16,
    order: HistoryByteOrder,
) -> Result<Vec<u8>> {
    let num_ids = u8::try_from(image_ids.len())
        .map_err(|_| PaError::invalid(format!("{} image ids exceed 255", image_ids.len())))?;
    let payload = serde_json::to_vec(&CompositeImage::from_image(image))
        .map_err(|e| PaError::corrupt(format!("composite encoding failed: {}", e)))?;

    let divisions = divisions.clamp(1, MAX_DIVISIONS);
    let chunk = payload.len().div_ceil(usize::from(divisions)).max(1);
    let mut segments = Vec::with_capacity(usize::from(divisions));
    for part in payload.chunks(chunk) {
        if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(part).map_err(io_corrupt)?;
            segments.push(encoder.finish().map_err(io_corrupt)?);
        } else {
            segments.push(part.to_vec());
        }
    }

    let mut out = Vec::new();
    out.write_u8(order.tag()).map_err(io_corrupt)?;
    out.write_u32::<B>(PM_HISTORY_VERSION).map_err(io_corrupt)?;
    out.write_u8(u8::from(compress)).map_err(io_corrupt)?;
    out.write_u64::<B>(payload.len() as u64).map_err(io_corrupt)?;
    out.write_u8(num_ids).map_err(io_corrupt)?;
    for id in image_ids {
        out.write_u64::<B>(id.to_raw()).map_err(io_corrupt)?;
    }
    out.write_u16::<B>(segments.len() as u16).map_err(io_corrupt)?;
    for segment in &segments {
        out.write_u64::<B>(segment.len() as u64).map_err(io_corrupt)?;
    }
    for segment in segments {
        out.extend_from_slice(&segment);
    }
    Ok(out)
}

fn io_corrupt(e: std::io::Error) -> PaError {
    PaError::corrupt(format!("composite header: {}", e))
}

/// Decodes a composite buffer.
///
/// The version is checked before anything else is read, so a mismatched
/// buffer is never decompressed.
pub fn decode_composite(buf: &[u8]) -> Result<DecodedComposite> {
    if buf.is_empty() {
        return Err(PaError::invalid("empty composite buffer"));
    }
    match buf[0] {
        TAG_LITTLE_ENDIAN => decode_with::<LittleEndian>(buf),
        TAG_BIG_ENDIAN => decode_with::<BigEndian>(buf),
        tag => {
            error!(tag, "Unknown composite byte order tag");
            Err(PaError::corrupt(format!("unknown byte order tag {:#04x}", tag)))
        }
    }
}

fn decode_with<B: ByteOrder>(buf: &[u8]) -> Result<DecodedComposite> {
    let mut cursor = Cursor::new(buf);
    cursor.set_position(1);
    let version = cursor.read_u32::<B>().map_err(io_corrupt)?;
    if version != PM_HISTORY_VERSION {
        info!(
            found_major = version >> 24,
            found_minor = version & 0x00FF_FFFF,
            expected_major = PM_HISTORY_VERSION >> 24,
            expected_minor = PM_HISTORY_VERSION & 0x00FF_FFFF,
            "Composite version does not match"
        );
        return Err(PaError::VersionMismatch {
            found: version,
            expected: PM_HISTORY_VERSION,
        });
    }
    let compressed = cursor.read_u8().map_err(io_corrupt)? != 0;
    let flat_size = cursor.read_u64::<B>().map_err(io_corrupt)?;
    let num_ids = cursor.read_u8().map_err(io_corrupt)?;
    let mut image_ids = Vec::with_capacity(usize::from(num_ids));
    for _ in 0..num_ids {
        let raw = cursor.read_u64::<B>().map_err(io_corrupt)?;
        let id = ImageId::from_raw(raw)
            .map_err(|_| PaError::corrupt(format!("bad image id {:#018x} in header", raw)))?;
        image_ids.push(id);
    }
    if image_ids.is_empty() {
        return Err(PaError::corrupt("composite header carries no image id"));
    }
    let num_divisions = cursor.read_u16::<B>().map_err(io_corrupt)?;
    if num_divisions == 0 || num_divisions > MAX_DIVISIONS {
        return Err(PaError::corrupt(format!("{} divisions", num_divisions)));
    }
    let mut sizes = Vec::with_capacity(usize::from(num_divisions));
    for _ in 0..num_divisions {
        sizes.push(cursor.read_u64::<B>().map_err(io_corrupt)?);
    }

    let body = &buf[cursor.position() as usize..];
    let declared = sizes
        .iter()
        .try_fold(0u64, |acc, &s| acc.checked_add(s))
        .ok_or_else(|| PaError::corrupt("division sizes overflow"))?;
    if declared != body.len() as u64 {
        error!(declared, actual = body.len(), "Composite division sizes do not match buffer");
        return Err(PaError::corrupt(format!(
            "divisions declare {} bytes, buffer holds {}",
            declared,
            body.len()
        )));
    }
    let flat_len = usize::try_from(flat_size)
        .map_err(|_| PaError::corrupt(format!("flat size {} too large", flat_size)))?;
    let mut flat = Vec::new();
    flat.try_reserve(flat_len)?;

    let mut offset = 0usize;
    for size in sizes {
        let size = size as usize;
        let segment = &body[offset..offset + size];
        offset += size;
        if compressed {
            let mut decoder = ZlibDecoder::new(segment).take(flat_size - flat.len() as u64 + 1);
            decoder
                .read_to_end(&mut flat)
                .map_err(|e| PaError::corrupt(format!("decompression failed: {}", e)))?;
        } else {
            flat.extend_from_slice(segment);
        }
        if flat.len() > flat_len {
            break;
        }
    }
    if flat.len() != flat_len {
        error!(expected = flat_len, actual = flat.len(), "Reassembled composite has wrong size");
        return Err(PaError::corrupt(format!(
            "reassembled {} bytes, header declares {}",
            flat.len(),
            flat_len
        )));
    }
    let composite: CompositeImage = serde_json::from_slice(&flat)
        .map_err(|e| PaError::corrupt(format!("composite payload: {}", e)))?;
    Ok(DecodedComposite {
        image_ids,
        composite,
    })
}

/// Whether a received composite was spliced into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstituteOutcome {
    Integrated,
    /// Stale or duplicate; the ring is unchanged.
    Skipped,
}

/// A composite pinned in the freeze-frame cache.
#[derive(Debug)]
pub(crate) struct CachedComposite {
    /// Id handed to clients (index = cache slot).
    pub id: ImageId,
    /// Id the composite was frozen from (current or record).
    pub source: ImageId,
    pub image: Arc<ImageData>,
    last_used: AtomicU64,
}

impl CachedComposite {
    pub fn touch(&self, now: u64) {
        self.last_used.store(now, Ordering::Relaxed);
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

/// Fixed-size cache of frozen composites. Entries leave only through
/// release or move.
#[derive(Debug)]
pub(crate) struct CompositeCache {
    entries: Vec<Option<CachedComposite>>,
}

impl CompositeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Cached entry named by a client id.
    pub fn lookup(&self, id: ImageId) -> Option<(usize, &CachedComposite)> {
        let slot = usize::from(id.index);
        self.entries
            .get(slot)?
            .as_ref()
            .filter(|e| e.id == id)
            .map(|e| (slot, e))
    }

    /// Cached entry frozen from `source`.
    pub fn find_source(&self, source: ImageId) -> Option<(usize, &CachedComposite)> {
        self.entries
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.as_ref().filter(|e| e.source == source).map(|e| (i, e)))
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    /// Installs a composite at `slot`; returns its client-facing id.
    pub fn insert(
        &mut self,
        slot: usize,
        source: ImageId,
        image: Arc<ImageData>,
        instance_id: u8,
        now: u64,
    ) -> ImageId {
        let id = ImageId::history(source.sweep_num, slot as u8, instance_id);
        self.entries[slot] = Some(CachedComposite {
            id,
            source,
            image,
            last_used: AtomicU64::new(now),
        });
        id
    }

    pub fn evict(&mut self, slot: usize) -> Option<CachedComposite> {
        self.entries.get_mut(slot).and_then(Option::take)
    }

    pub fn ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.entries.iter().flatten().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn free_slots(&self) -> usize {
        self.entries.len() - self.len()
    }
}

/// Composite currently being compounded from sweep images.
#[derive(Debug, Clone)]
pub(crate) struct CurrentComposite {
    pub id: ImageId,
    pub image: Arc<ImageData>,
    pub images_folded: u32,
}

/// Reconstitution session state and the composite in progress.
#[derive(Debug)]
pub(crate) struct HistoryTracker {
    pub is_first_img: bool,
    pub first_image_sweep_start: u64,
    pub processed_sweep_num: u32,
    /// Instance id of the master that produced the last integrated image.
    pub current_instance_id: Option<u8>,
    pub current: Option<CurrentComposite>,
}

impl Default for HistoryTracker {
    fn default() -> Self {
        Self {
            is_first_img: true,
            first_image_sweep_start: 0,
            processed_sweep_num: 0,
            current_instance_id: None,
            current: None,
        }
    }
}

impl HistoryTracker {
    /// Applies the staleness rule; returns whether the image is integrated.
    fn admit(&mut self, sweep_num: u32, sweep_start: u64) -> bool {
        if self.is_first_img {
            info!(sweep = sweep_num, "First sweep image received");
            self.is_first_img = false;
            self.first_image_sweep_start = sweep_start;
            self.processed_sweep_num = sweep_num;
            return true;
        }
        if sweep_start < self.first_image_sweep_start {
            info!(
                sweep = sweep_num,
                delta = self.first_image_sweep_start - sweep_start,
                "Older sweep image received, skipping"
            );
            return false;
        }
        if sweep_num > self.processed_sweep_num
            || sweep_num == self.processed_sweep_num.wrapping_add(1)
        {
            self.processed_sweep_num = sweep_num;
            return true;
        }
        info!(
            sweep = sweep_num,
            processed = self.processed_sweep_num,
            "Same or older sweep image received, skipping"
        );
        false
    }

    /// The in-progress composite, if `id` names it.
    pub fn current_image(&self, id: ImageId) -> Option<Arc<ImageData>> {
        self.current
            .as_ref()
            .filter(|c| c.id == id)
            .map(|c| Arc::clone(&c.image))
    }
}

/// Folds `newer` into `composite`: topology and raw counters come from the
/// newer image, deltas and interval accumulate.
fn fold_image(composite: &mut ImageData, mut newer: ImageData) {
    let previous: HashMap<(u64, u8), (&PortCounters, &[VlCounters; STL_MAX_VLS])> = composite
        .ports()
        .map(|(n, p)| ((n.guid(), p.port_num), (&p.delta, &p.delta_vl)))
        .collect();
    for node in newer.lid_map.iter_mut().flatten() {
        let guid = node.guid();
        for port in node.ports.values_mut() {
            if let Some((delta, delta_vl)) = previous.get(&(guid, port.port_num)) {
                let mut total = **delta;
                total.accumulate(&port.delta);
                port.delta = total;
                for (vl, prev) in port.delta_vl.iter_mut().zip(delta_vl.iter()) {
                    let mut sum = *prev;
                    sum.accumulate(vl);
                    *vl = sum;
                }
            }
        }
    }
    newer.sweep_start = composite.sweep_start;
    newer.image_interval = composite.image_interval.saturating_add(newer.image_interval);
    *composite = newer;
}

impl PmStore {
    /// Splices a composite received from the master into the ring at the
    /// current write slot.
    pub fn put_sweep_image_data(&self, buf: &[u8]) -> Result<ReconstituteOutcome> {
        if buf.is_empty() {
            return Err(PaError::invalid("empty composite buffer"));
        }
        let _busy = self.enter()?;
        let result = self.reconstitute(buf);
        let outcome = match &result {
            Ok(ReconstituteOutcome::Skipped) => return result,
            Ok(ReconstituteOutcome::Integrated) => Ok(()),
            Err(e) => Err(e),
        };
        self.audit(
            AuditCategory::HistoryIntegration,
            "put_sweep_image_data",
            format!("{} bytes", buf.len()),
            "composite",
            outcome,
        );
        result
    }

    fn reconstitute(&self, buf: &[u8]) -> Result<ReconstituteOutcome> {
        let decoded = decode_composite(buf)?;
        let first = decoded.image_ids[0];
        let sweep_num = first.sweep_num;
        let mut image = decoded.composite.into_image().map_err(|e| {
            error!(sweep = sweep_num, error = %e, "Error rebuilding composite image");
            e
        })?;
        // The ring slot carries the sweep number of the id, not the payload.
        image.sweep_num = sweep_num;

        let now = self.now();
        let mut state = self.state.write();
        let idx = self.write_slot(&mut state, now)?;
        let was_first = state.sth.is_first_img;
        if !state.sth.admit(sweep_num, image.sweep_start) {
            return Ok(ReconstituteOutcome::Skipped);
        }

        self.intern_identities(&mut image);
        let sweep_start = image.sweep_start;
        let interval = image.image_interval;
        let snapshot = (self.config.short_term_history.enable && !was_first).then(|| image.clone());
        *self.images[idx].write() = image;
        // Freeze frames and sweep ids keep naming this engine's instance.
        state.sth.current_instance_id = Some(first.instance_id);
        self.finish_image(&mut state, idx, sweep_num, sweep_start, interval, now);
        if let Some(snapshot) = snapshot {
            self.compound_current(&mut state, snapshot);
        }
        log_integrated(idx, sweep_num);
        Ok(ReconstituteOutcome::Integrated)
    }

    /// Folds a newly completed image into the current composite, writing
    /// the composite out once it spans `images_per_composite` sweeps.
    pub(crate) fn compound_current(&self, state: &mut StoreState, image: ImageData) {
        let sth = &self.config.short_term_history;
        let instance_id = state.sth.current_instance_id.unwrap_or(state.instance_id);
        if let Some(current) = state.sth.current.as_mut() {
            fold_image(Arc::make_mut(&mut current.image), image);
            current.images_folded += 1;
        } else {
            state.sth.current = Some(CurrentComposite {
                id: ImageId::history(image.sweep_num, HISTORY_INDEX_CURRENT, instance_id),
                image: Arc::new(image),
                images_folded: 1,
            });
        }
        let folded = state.sth.current.as_ref().map_or(0, |c| c.images_folded);
        if folded < sth.images_per_composite {
            return;
        }
        let Some(done) = state.sth.current.take() else {
            return;
        };
        let record_id = ImageId::history(done.id.sweep_num, HISTORY_INDEX_RECORD, instance_id);
        let Some(source) = &self.history_source else {
            debug!(id = %record_id, "No history source, discarding composite");
            return;
        };
        match encode_composite(
            &done.image,
            &[record_id],
            sth.compress,
            sth.divisions,
            HistoryByteOrder::default(),
        ) {
            Ok(bytes) => {
                debug!(id = %record_id, bytes = bytes.len(), "Composite recorded");
                source.store(record_id, bytes);
            }
            Err(e) => warn!(id = %record_id, error = %e, "Error while encoding composite"),
        }
    }

    /// Loads and decodes a history record through the history source.
    pub(crate) fn load_history_record(&self, id: ImageId) -> Result<Arc<ImageData>> {
        let source = self
            .history_source
            .as_ref()
            .ok_or_else(|| PaError::not_found(PaStatusCode::NoImage, format!("history record {}", id)))?;
        let bytes = source
            .load(id)
            .ok_or_else(|| PaError::not_found(PaStatusCode::NoImage, format!("history record {}", id)))?;
        let decoded = decode_composite(&bytes)?;
        if decoded.image_ids[0].sweep_num != id.sweep_num {
            warn!(id = %id, found = %decoded.image_ids[0], "History record id does not match request");
        }
        let mut image = decoded.composite.into_image()?;
        self.intern_identities(&mut image);
        Ok(Arc::new(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_id::ImageIdQuery;
    use crate::test_support::{small_fabric, ManualClock};
    use fm_common::config::PmConfig;
    use pretty_assertions::assert_eq;

    fn ids(sweep: u32) -> Vec<ImageId> {
        vec![ImageId::sweep(sweep, 0, 9)]
    }

    #[test]
    fn test_encode_decode_preserves_links() {
        let image = small_fabric(7, 5000);
        for (compress, order) in [
            (true, HistoryByteOrder::Little),
            (false, HistoryByteOrder::Big),
        ] {
            let buf = encode_composite(&image, &ids(7), compress, 3, order).unwrap();
            let decoded = decode_composite(&buf).unwrap();
            assert_eq!(decoded.image_ids, ids(7));
            let rebuilt = decoded.composite.into_image().unwrap();
            assert_eq!(rebuilt.num_switch_ports(), image.num_switch_ports());
            let port = rebuilt.find_port(2, 1).unwrap();
            assert_eq!(port.neighbor, Some(PortRef { lid: 1, port_num: 1 }));
        }
    }

    #[test]
    fn test_version_checked_before_decompression() {
        let image = small_fabric(1, 100);
        let mut buf = encode_composite(&image, &ids(1), true, 2, HistoryByteOrder::Little).unwrap();
        LittleEndian::write_u32(&mut buf[1..5], PM_HISTORY_VERSION + 1);
        // Corrupt the compressed payload; the version error must win.
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&[0xFF; 4]);
        let err = decode_composite(&buf).unwrap_err();
        assert_eq!(
            err,
            PaError::VersionMismatch {
                found: PM_HISTORY_VERSION + 1,
                expected: PM_HISTORY_VERSION
            }
        );
    }

    #[test]
    fn test_truncated_buffer_is_corrupt() {
        let image = small_fabric(1, 100);
        let buf = encode_composite(&image, &ids(1), true, 2, HistoryByteOrder::Little).unwrap();
        let err = decode_composite(&buf[..buf.len() - 3]).unwrap_err();
        assert!(matches!(err, PaError::Corrupt { .. }));
    }

    #[test]
    fn test_unresolvable_neighbor_is_corrupt() {
        let mut composite = CompositeImage::from_image(&small_fabric(1, 100));
        composite.nodes[0].ports[1].neighbor_lid = 0x99;
        assert!(matches!(composite.into_image(), Err(PaError::Corrupt { .. })));
    }

    #[test]
    fn test_unknown_group_dropped() {
        let mut composite = CompositeImage::from_image(&small_fabric(1, 100));
        composite.nodes[0].ports[1].groups.push("Missing".to_string());
        let image = composite.into_image().unwrap();
        let port = image.find_port(1, 1).unwrap();
        assert!(port.groups.iter().all(|&g| usize::from(g) < image.groups.len()));
    }

    #[test]
    fn test_duplicate_guid_is_corrupt() {
        let mut composite = CompositeImage::from_image(&small_fabric(1, 100));
        let mut dup = composite.nodes[0].clone();
        dup.lid = 0x40;
        dup.ports.clear();
        composite.nodes.push(dup);
        assert!(matches!(composite.into_image(), Err(PaError::Corrupt { .. })));
    }

    #[test]
    fn test_staleness_rule() {
        let mut tracker = HistoryTracker::default();
        assert!(tracker.admit(10, 1000));
        assert!(!tracker.admit(10, 1010));
        assert!(!tracker.admit(9, 1010));
        assert!(!tracker.admit(11, 900));
        assert!(tracker.admit(11, 1020));
        assert!(tracker.admit(15, 1060));
    }

    #[test]
    fn test_staleness_wraparound() {
        let mut tracker = HistoryTracker {
            is_first_img: false,
            processed_sweep_num: u32::MAX,
            ..HistoryTracker::default()
        };
        assert!(!tracker.admit(u32::MAX, 10));
        assert!(tracker.admit(0, 10));
        assert_eq!(tracker.processed_sweep_num, 0);
    }

    #[test]
    fn test_integration_keeps_engine_instance() {
        let config = PmConfig {
            total_images: 4,
            freeze_frame_images: 2,
            ..PmConfig::default()
        };
        let store = PmStore::with_clock(config, Arc::new(ManualClock::new(1_000))).unwrap();
        store.commit_sweep(small_fabric(0, 1_000)).unwrap();
        let frozen = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let instance = store.instance_id();

        let master = instance.wrapping_add(5);
        let buf = encode_composite(
            &small_fabric(1, 1_010),
            &[ImageId::sweep(1, 0, master)],
            true,
            2,
            HistoryByteOrder::default(),
        )
        .unwrap();
        assert_eq!(
            store.put_sweep_image_data(&buf).unwrap(),
            ReconstituteOutcome::Integrated
        );
        assert_eq!(store.instance_id(), instance);
        assert_eq!(store.state.read().sth.current_instance_id, Some(master));

        let live = store.live_image_id().unwrap();
        assert_eq!(live.instance_id, instance);
        assert_eq!(live.sweep_num, 1);

        store.freeze_frame_renew(frozen.image_number).unwrap();
        store.freeze_frame_release(frozen.image_number).unwrap();
        assert_eq!(store.freeze_ref_count(0), 0);
    }

    #[test]
    fn test_fold_accumulates_deltas() {
        let mut first = small_fabric(1, 100);
        first.node_mut(1).unwrap().port_mut(1).unwrap().delta.xmit_data = 10;
        let mut second = small_fabric(2, 110);
        second.node_mut(1).unwrap().port_mut(1).unwrap().delta.xmit_data = 5;
        fold_image(&mut first, second);
        assert_eq!(first.sweep_start, 100);
        assert_eq!(first.image_interval, 20);
        assert_eq!(first.find_port(1, 1).unwrap().delta.xmit_data, 15);
    }
}

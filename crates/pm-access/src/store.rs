//! Image store and resolver.
//!
//! The store owns a fixed ring of `total_images` sweep image slots. Each slot
//! is split into infrastructure (its `RwLock`, never replaced) and data
//! ([`ImageData`], replaced wholesale by the sweep writer or by history
//! reconstitution). Slot bookkeeping (validity, sweep number, freeze-frame
//! reference bitmap, last use) lives in [`StoreState`] behind the store-wide
//! state lock.
//!
//! # Lock order
//!
//! `state` → `images[i]` → `totals`. The state lock is released as soon as
//! the image lock is held so a long scan never blocks the sweep writer's
//! slot advance.
//!
//! # Busy accounting
//!
//! Every public entry point holds a [`BusyGuard`] for its whole duration
//! (after parameter validation). The shutdown sequencer calls
//! [`PmStore::stop`] and waits for [`PmStore::busy_count`] to reach zero.

use crate::counters::PortTotals;
use crate::error::{PaError, PaStatusCode, Result};
use crate::history::{CompositeCache, HistorySource, HistoryTracker};
use crate::image::{ImageData, NodeIdentity};
use crate::image_id::{
    ImageId, ImageIdQuery, ImageKind, ReturnedImageId, HISTORY_INDEX_CURRENT,
    HISTORY_INDEX_RECORD, LIVE_IMAGE_ID,
};
use fm_common::audit::{AuditCategory, AuditOutcome, AuditRecord};
use fm_common::audit_log;
use fm_common::config::PmConfig;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Wall clock used for freeze-frame leases and image timestamps.
pub trait Clock: Send + Sync {
    /// Seconds since the epoch.
    fn now_secs(&self) -> u64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Invalid,
    InProgress,
    Valid,
}

/// Bookkeeping for one ring slot.
#[derive(Debug)]
pub(crate) struct SlotMeta {
    pub state: ImageState,
    pub sweep_num: u32,
    pub sweep_start: u64,
    pub image_interval: u32,
    /// Position of this slot in the history ring while it holds a sweep.
    pub history_index: Option<usize>,
    /// One bit per freeze-frame client id.
    pub ff_ref_count: u64,
    pub next_client_id: u8,
    pub last_used: AtomicU64,
}

impl SlotMeta {
    fn new() -> Self {
        Self {
            state: ImageState::Invalid,
            sweep_num: 0,
            sweep_start: 0,
            image_interval: 0,
            history_index: None,
            ff_ref_count: 0,
            next_client_id: 0,
            last_used: AtomicU64::new(0),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.ff_ref_count != 0
    }

    pub fn touch(&self, now: u64) {
        self.last_used.store(now, Ordering::Relaxed);
    }

    /// Clears the reference bitmap when its lease has run out.
    pub fn expire_lease(&mut self, now: u64, lease_secs: u64) -> bool {
        let last_used = self.last_used.load(Ordering::Relaxed);
        if self.ff_ref_count != 0 && now.saturating_sub(last_used) > lease_secs {
            self.ff_ref_count = 0;
            return true;
        }
        false
    }
}

/// Store-wide state guarded by the state lock.
#[derive(Debug)]
pub(crate) struct StoreState {
    pub slots: Vec<SlotMeta>,
    /// Freeze-frame slot → pinned ring index.
    pub freeze_frames: Vec<Option<usize>>,
    /// Ring indices in sweep order; `last_history_index` is the newest.
    pub history: Vec<Option<usize>>,
    pub last_history_index: usize,
    /// Next slot the writer fills.
    pub sweep_index: usize,
    /// Most recently completed slot (the live image).
    pub last_sweep_index: Option<usize>,
    pub num_sweeps: u32,
    pub instance_id: u8,
    pub composites: CompositeCache,
    pub sth: HistoryTracker,
}

/// Whether a resolution may land on any image or only on a frozen one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveIntent {
    Any,
    FreezeFrame,
}

/// Where a resolved composite lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompositeOrigin {
    Cached(usize),
    Current,
    Record,
}

#[derive(Debug, Clone)]
pub(crate) enum Target {
    Ring(usize),
    Composite {
        origin: CompositeOrigin,
        id: ImageId,
        image: Arc<ImageData>,
    },
}

/// A freeze-frame pin named by the resolved id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreezeRef {
    pub slot: usize,
    pub client_id: u8,
}

#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub target: Target,
    pub returned: ReturnedImageId,
    /// False when the image cannot change under the reader (frozen ring
    /// image or composite).
    pub requires_lock: bool,
    pub freeze: Option<FreezeRef>,
}

/// Read access to a resolved image.
pub enum ImageView<'a> {
    Ring(RwLockReadGuard<'a, ImageData>),
    Composite(Arc<ImageData>),
}

impl Deref for ImageView<'_> {
    type Target = ImageData;

    fn deref(&self) -> &ImageData {
        match self {
            ImageView::Ring(guard) => guard,
            ImageView::Composite(image) => image,
        }
    }
}

/// Decrements the busy counter when dropped.
pub(crate) struct BusyGuard<'a> {
    busy: &'a AtomicU32,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Running counter totals keyed by (node GUID, port number).
pub(crate) type TotalsTable = HashMap<(u64, u8), PortTotals>;

/// The PM image store.
pub struct PmStore {
    pub(crate) config: PmConfig,
    pub(crate) clock: Arc<dyn Clock>,
    running: AtomicBool,
    busy: AtomicU32,
    pub(crate) state: RwLock<StoreState>,
    pub(crate) images: Vec<RwLock<ImageData>>,
    pub(crate) totals: RwLock<TotalsTable>,
    /// Node identities by GUID, shared across images.
    registry: Mutex<HashMap<u64, Arc<NodeIdentity>>>,
    pub(crate) history_source: Option<Arc<dyn HistorySource>>,
    pub(crate) unexpected_clear_user_counters: AtomicBool,
}

impl PmStore {
    pub fn new(config: PmConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds the store; rejects configurations the ring cannot honor.
    pub fn with_clock(config: PmConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(|e| PaError::InvalidSetting {
            code: PaStatusCode::InvalidSetting,
            reason: e.to_string(),
        })?;
        let total = config.total_images;
        let instance_id = (clock.now_secs() & 0xFF) as u8;
        let mut slots: Vec<SlotMeta> = (0..total).map(|_| SlotMeta::new()).collect();
        if let Some(first) = slots.first_mut() {
            first.state = ImageState::InProgress;
        }
        let state = StoreState {
            slots,
            freeze_frames: vec![None; config.freeze_frame_images],
            history: vec![None; total],
            last_history_index: total.saturating_sub(1),
            sweep_index: 0,
            last_sweep_index: None,
            num_sweeps: 0,
            instance_id,
            composites: CompositeCache::new(config.freeze_frame_images),
            sth: HistoryTracker::default(),
        };
        Ok(Self {
            images: (0..total).map(|_| RwLock::new(ImageData::default())).collect(),
            config,
            clock,
            running: AtomicBool::new(true),
            busy: AtomicU32::new(0),
            state: RwLock::new(state),
            totals: RwLock::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
            history_source: None,
            unexpected_clear_user_counters: AtomicBool::new(false),
        })
    }

    /// Attaches the collaborator that loads and stores history records.
    pub fn with_history_source(mut self, source: Arc<dyn HistorySource>) -> Self {
        self.history_source = Some(source);
        self
    }

    pub fn config(&self) -> &PmConfig {
        &self.config
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "PmStore", "start")
                .with_outcome(AuditOutcome::Success)
        );
    }

    /// Refuses new requests; in-flight requests run to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "PmStore", "stop")
                .with_outcome(AuditOutcome::Success)
                .with_details(serde_json::json!({ "busy": self.busy_count() }))
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of entry points currently executing.
    pub fn busy_count(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    /// Registers an in-flight request; fails when the engine is stopping.
    pub(crate) fn enter(&self) -> Result<BusyGuard<'_>> {
        self.busy.fetch_add(1, Ordering::AcqRel);
        let guard = BusyGuard { busy: &self.busy };
        if !self.is_running() {
            return Err(PaError::Unavailable);
        }
        Ok(guard)
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Engine instance id embedded in every image id.
    pub fn instance_id(&self) -> u8 {
        self.state.read().instance_id
    }

    /// Ring slot the writer fills next.
    pub fn sweep_index(&self) -> usize {
        self.state.read().sweep_index
    }

    /// Sweep number the writer should use for its next image.
    pub fn next_sweep_num(&self) -> u32 {
        self.state.read().num_sweeps
    }

    /// Freeze-frame reference bitmap of a ring slot.
    pub fn freeze_ref_count(&self, ring_index: usize) -> u64 {
        self.state
            .read()
            .slots
            .get(ring_index)
            .map(|m| m.ff_ref_count)
            .unwrap_or(0)
    }

    /// Id of the live image, if any sweep has completed.
    pub fn live_image_id(&self) -> Option<ImageId> {
        let state = self.state.read();
        let idx = state.last_sweep_index?;
        Some(ImageId::sweep(
            state.slots[idx].sweep_num,
            idx as u8,
            state.instance_id,
        ))
    }

    /// Replaces node identities with the registry's shared copies.
    pub(crate) fn intern_identities(&self, image: &mut ImageData) {
        let mut registry = self.registry.lock();
        for node in image.lid_map.iter_mut().flatten() {
            let shared = registry
                .entry(node.identity.guid)
                .or_insert_with(|| Arc::clone(&node.identity));
            if **shared != *node.identity {
                *shared = Arc::clone(&node.identity);
            }
            node.identity = Arc::clone(shared);
        }
    }

    /// Installs a completed sweep image at the current write slot.
    ///
    /// Returns the new live image id.
    pub fn commit_sweep(&self, mut image: ImageData) -> Result<ImageId> {
        self.intern_identities(&mut image);
        let now = self.now();
        let mut state = self.state.write();
        let idx = self.write_slot(&mut state, now)?;

        {
            let mut totals = self.totals.write();
            for (node, port) in image.ports() {
                let entry = totals.entry((node.guid(), port.port_num)).or_default();
                entry.counters.accumulate(&port.delta);
                for (total, delta) in entry.vl.iter_mut().zip(port.delta_vl.iter()) {
                    total.accumulate(delta);
                }
                if port.unexpected_clear {
                    self.unexpected_clear_user_counters
                        .store(true, Ordering::Release);
                }
            }
        }

        let sweep_num = image.sweep_num;
        let sweep_start = image.sweep_start;
        let interval = image.image_interval;
        let snapshot = self.config.short_term_history.enable.then(|| image.clone());
        *self.images[idx].write() = image;

        let instance_id = state.instance_id;
        self.finish_image(&mut state, idx, sweep_num, sweep_start, interval, now);
        if let Some(snapshot) = snapshot {
            self.compound_current(&mut state, snapshot);
        }
        debug!(slot = idx, sweep = sweep_num, "Sweep image committed");
        Ok(ImageId::sweep(sweep_num, idx as u8, instance_id))
    }

    /// Bookkeeping shared by sweep commit and history reconstitution: the
    /// slot at `idx` now holds a valid image; record it in the history ring
    /// and advance the write index.
    pub(crate) fn finish_image(
        &self,
        state: &mut StoreState,
        idx: usize,
        sweep_num: u32,
        sweep_start: u64,
        image_interval: u32,
        now: u64,
    ) {
        let total = state.slots.len();
        state.last_sweep_index = Some(idx);

        if let Some(prev) = state.slots[idx].history_index.take() {
            state.history[prev] = None;
        }
        let h = (state.last_history_index + 1) % total;
        if let Some(evicted) = state.history[h] {
            if state.slots[evicted].history_index == Some(h) {
                state.slots[evicted].history_index = None;
            }
        }
        state.history[h] = Some(idx);
        state.last_history_index = h;

        let meta = &mut state.slots[idx];
        meta.history_index = Some(h);
        meta.sweep_num = sweep_num;
        meta.sweep_start = sweep_start;
        meta.image_interval = image_interval;
        meta.state = ImageState::Valid;
        meta.touch(now);

        self.advance_sweep_index(state, idx, now);
        state.num_sweeps = sweep_num.wrapping_add(1);
    }

    /// Slot the next image may be written to.
    ///
    /// The write index normally already names an unfrozen in-progress slot;
    /// when the last advance found none, retry past the live image.
    pub(crate) fn write_slot(&self, state: &mut StoreState, now: u64) -> Result<usize> {
        let idx = state.sweep_index;
        let meta = &state.slots[idx];
        if meta.state == ImageState::InProgress && !meta.is_frozen() {
            return Ok(idx);
        }
        let live = state.last_sweep_index.unwrap_or(idx);
        if self.advance_sweep_index(state, live, now) {
            Ok(state.sweep_index)
        } else {
            Err(PaError::no_memory(
                PaStatusCode::NoImage,
                "no unfrozen image slot for the next sweep",
            ))
        }
    }

    /// Moves the write index past `written` and every frozen slot.
    ///
    /// Returns false, leaving the index alone, when every other slot is
    /// frozen.
    fn advance_sweep_index(&self, state: &mut StoreState, written: usize, now: u64) -> bool {
        let total = state.slots.len();
        let lease = self.config.freeze_frame_lease_secs;
        let mut next = (written + 1) % total;
        let mut found = false;
        for _ in 0..total {
            if next != written {
                let meta = &mut state.slots[next];
                if meta.expire_lease(now, lease) {
                    warn!(slot = next, sweep = meta.sweep_num, "Freeze frame lease expired");
                }
                if !meta.is_frozen() {
                    found = true;
                    break;
                }
            }
            next = (next + 1) % total;
        }
        if !found {
            error!(written, "No unfrozen image slot available for the next sweep");
            return false;
        }
        state.sweep_index = next;
        state.slots[next].state = ImageState::InProgress;
        true
    }

    /// Resolves `query` while the caller holds the state lock.
    pub(crate) fn resolve(
        &self,
        state: &StoreState,
        query: &ImageIdQuery,
        intent: ResolveIntent,
    ) -> Result<Resolved> {
        if query.offset > 0 {
            return Err(PaError::invalid(format!(
                "positive image offset {} is not supported",
                query.offset
            )));
        }
        if query.image_number == LIVE_IMAGE_ID {
            if intent == ResolveIntent::FreezeFrame {
                return Err(no_image("live image is not a freeze frame"));
            }
            let base = if query.image_time != 0 {
                self.find_by_time(state, query.image_time)?
            } else {
                state
                    .last_sweep_index
                    .ok_or_else(|| no_image("no sweep has completed"))?
            };
            let idx = walk_history(state, base, query.offset)?;
            return Ok(self.ring_resolution(state, idx, None));
        }

        let id = ImageId::from_raw(query.image_number)
            .map_err(|_| no_image(format!("image id {:#018x}", query.image_number)))?;
        match id.kind {
            ImageKind::Sweep => {
                if intent == ResolveIntent::FreezeFrame {
                    return Err(no_image(format!("image {} is not a freeze frame", id)));
                }
                let idx = usize::from(id.index);
                let valid = id.instance_id == state.instance_id
                    && state.slots.get(idx).is_some_and(|m| {
                        m.state == ImageState::Valid && m.sweep_num == id.sweep_num
                    });
                if !valid {
                    return Err(no_image(format!("sweep image {}", id)));
                }
                let idx = walk_history(state, idx, query.offset)?;
                Ok(self.ring_resolution(state, idx, None))
            }
            ImageKind::FreezeFrame => {
                let slot = usize::from(id.index);
                let idx = state
                    .freeze_frames
                    .get(slot)
                    .copied()
                    .flatten()
                    .filter(|_| id.instance_id == state.instance_id)
                    .ok_or_else(|| no_image(format!("freeze frame {}", id)))?;
                let meta = &state.slots[idx];
                if meta.ff_ref_count & (1u64 << id.client_id) == 0 || meta.sweep_num != id.sweep_num
                {
                    return Err(no_image(format!("freeze frame {}", id)));
                }
                if query.offset == 0 {
                    let freeze = FreezeRef {
                        slot,
                        client_id: id.client_id,
                    };
                    let mut resolved = self.ring_resolution(state, idx, Some(freeze));
                    resolved.returned.image_number = id.to_raw();
                    return Ok(resolved);
                }
                if intent == ResolveIntent::FreezeFrame {
                    return Err(no_image("offset from a freeze frame is not a freeze frame"));
                }
                let idx = walk_history(state, idx, query.offset)?;
                Ok(self.ring_resolution(state, idx, None))
            }
            ImageKind::History => {
                if query.offset != 0 {
                    return Err(no_image("offsets are not supported for history images"));
                }
                self.resolve_history(state, id, intent)
            }
        }
    }

    fn resolve_history(
        &self,
        state: &StoreState,
        id: ImageId,
        intent: ResolveIntent,
    ) -> Result<Resolved> {
        let cached = state.composites.lookup(id);
        let (origin, image) = match (cached, id.index) {
            (Some((slot, entry)), _) => {
                entry.touch(self.now());
                (CompositeOrigin::Cached(slot), Arc::clone(&entry.image))
            }
            (None, _) if intent == ResolveIntent::FreezeFrame => {
                return Err(no_image(format!("history image {} is not frozen", id)));
            }
            (None, HISTORY_INDEX_CURRENT) => {
                let image = state
                    .sth
                    .current_image(id)
                    .ok_or_else(|| no_image(format!("current composite {}", id)))?;
                (CompositeOrigin::Current, image)
            }
            (None, HISTORY_INDEX_RECORD) => {
                (CompositeOrigin::Record, self.load_history_record(id)?)
            }
            (None, _) => return Err(no_image(format!("history image {}", id))),
        };
        let returned = ReturnedImageId {
            image_number: id.to_raw(),
            image_time: image.sweep_start,
        };
        Ok(Resolved {
            target: Target::Composite { origin, id, image },
            returned,
            requires_lock: false,
            freeze: None,
        })
    }

    fn find_by_time(&self, state: &StoreState, time: u64) -> Result<usize> {
        state
            .slots
            .iter()
            .position(|m| {
                m.state == ImageState::Valid
                    && m.sweep_start <= time
                    && time < m.sweep_start + u64::from(m.image_interval.max(1))
            })
            .ok_or_else(|| no_image(format!("no image covers time {}", time)))
    }

    fn ring_resolution(&self, state: &StoreState, idx: usize, freeze: Option<FreezeRef>) -> Resolved {
        let meta = &state.slots[idx];
        Resolved {
            target: Target::Ring(idx),
            returned: ReturnedImageId {
                image_number: ImageId::sweep(meta.sweep_num, idx as u8, state.instance_id)
                    .to_raw(),
                image_time: meta.sweep_start,
            },
            requires_lock: !meta.is_frozen(),
            freeze,
        }
    }

    /// Resolves `query` and returns read access to the image.
    ///
    /// The image lock is taken before the state lock is released so the
    /// writer can never replace the slot between resolution and read.
    pub(crate) fn read_image(&self, query: &ImageIdQuery) -> Result<(ImageView<'_>, ReturnedImageId)> {
        let state = self.state.read();
        let resolved = self.resolve(&state, query, ResolveIntent::Any).map_err(|e| {
            warn!(image = query.image_number, offset = query.offset, error = %e, "Unable to resolve image");
            e
        })?;
        let view = match resolved.target {
            Target::Ring(idx) => {
                let guard = self.images[idx].read();
                drop(state);
                debug!(slot = idx, requires_lock = resolved.requires_lock, "Reading ring image");
                ImageView::Ring(guard)
            }
            Target::Composite { image, .. } => {
                drop(state);
                ImageView::Composite(image)
            }
        };
        Ok((view, resolved.returned))
    }

    /// Audits a freeze-frame or clear action.
    pub(crate) fn audit(
        &self,
        category: AuditCategory,
        action: &str,
        object_id: String,
        object_type: &str,
        outcome: std::result::Result<(), &PaError>,
    ) {
        let record = AuditRecord::new(category, "PaAccess", action)
            .with_object_id(object_id)
            .with_object_type(object_type);
        let record = match outcome {
            Ok(()) => record.with_outcome(AuditOutcome::Success),
            Err(e) => record.with_error(e.to_string()),
        };
        audit_log!(record);
    }
}

pub(crate) fn no_image(what: impl Into<String>) -> PaError {
    PaError::not_found(PaStatusCode::NoImage, what)
}

/// Walks `offset` (≤ 0) sweeps back through the history ring from `base`.
fn walk_history(state: &StoreState, base: usize, offset: i32) -> Result<usize> {
    if offset == 0 {
        return Ok(base);
    }
    let total = state.history.len();
    let steps = offset.unsigned_abs() as usize;
    if steps >= total {
        return Err(no_image(format!("offset {} exceeds history", offset)));
    }
    let pos = state.slots[base]
        .history_index
        .ok_or_else(|| no_image("image is not in history"))?;
    let target = (pos + total - steps) % total;
    let base_sweep = state.slots[base].sweep_num;
    state.history[target]
        .filter(|&idx| {
            let meta = &state.slots[idx];
            // Older in sequence-number order, across wraparound.
            let age = base_sweep.wrapping_sub(meta.sweep_num);
            meta.state == ImageState::Valid && age != 0 && age <= u32::MAX / 2
        })
        .ok_or_else(|| no_image(format!("no image at offset {}", offset)))
}

impl std::fmt::Debug for PmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmStore")
            .field("total_images", &self.images.len())
            .field("running", &self.is_running())
            .field("busy", &self.busy_count())
            .finish()
    }
}

/// Logs and reports an image integration.
pub(crate) fn log_integrated(slot: usize, sweep_num: u32) {
    info!(slot, sweep = sweep_num, "Composite integrated into image ring");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_fabric, ManualClock};

    fn store(clock: &Arc<ManualClock>) -> PmStore {
        let config = PmConfig {
            total_images: 4,
            freeze_frame_images: 2,
            ..PmConfig::default()
        };
        PmStore::with_clock(config, clock.clone()).unwrap()
    }

    #[test]
    fn test_live_resolution_requires_sweep() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        let err = store.read_image(&ImageIdQuery::live()).err().unwrap();
        assert_eq!(err.status_code(), PaStatusCode::NoImage);
    }

    #[test]
    fn test_commit_advances_ring() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        for sweep in 0..6 {
            let id = store.commit_sweep(small_fabric(sweep, 1000 + u64::from(sweep) * 10)).unwrap();
            assert_eq!(usize::from(id.index), sweep as usize % 4);
            assert_eq!(store.sweep_index(), (sweep as usize + 1) % 4);
        }
        assert_eq!(store.next_sweep_num(), 6);
        let (view, returned) = store.read_image(&ImageIdQuery::live()).unwrap();
        assert_eq!(view.sweep_num, 5);
        assert_eq!(returned.image_time, 1050);
    }

    #[test]
    fn test_history_offsets() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        for sweep in 0..3 {
            store.commit_sweep(small_fabric(sweep, 1000 + u64::from(sweep) * 10)).unwrap();
        }
        let (view, _) = store.read_image(&ImageIdQuery::with_offset(0, -2)).unwrap();
        assert_eq!(view.sweep_num, 0);
        drop(view);
        assert!(store.read_image(&ImageIdQuery::with_offset(0, -3)).is_err());
        assert!(store.read_image(&ImageIdQuery::with_offset(0, 1)).is_err());
    }

    #[test]
    fn test_history_offsets_across_wraparound() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        for (i, sweep) in [u32::MAX - 1, u32::MAX, 0].into_iter().enumerate() {
            store.commit_sweep(small_fabric(sweep, 1000 + i as u64 * 10)).unwrap();
        }
        for (offset, expected) in [(0, 0), (-1, u32::MAX), (-2, u32::MAX - 1)] {
            let (_, returned) = store.read_image(&ImageIdQuery::with_offset(0, offset)).unwrap();
            let id = ImageId::from_raw(returned.image_number).unwrap();
            assert_eq!(id.sweep_num, expected, "offset {offset}");
        }
    }

    #[test]
    fn test_invalid_ring_config_rejected() {
        let clock = Arc::new(ManualClock::new(1000));
        for (total, freeze) in [(0, 0), (4, 3), (4, 4)] {
            let config = PmConfig {
                total_images: total,
                freeze_frame_images: freeze,
                ..PmConfig::default()
            };
            let err = PmStore::with_clock(config, clock.clone()).unwrap_err();
            assert_eq!(err.status_code(), PaStatusCode::InvalidSetting);
        }
    }

    #[test]
    fn test_commit_refuses_when_every_slot_frozen() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        store.commit_sweep(small_fabric(0, 1000)).unwrap();
        {
            let mut state = store.state.write();
            for meta in &mut state.slots[1..] {
                meta.ff_ref_count = 1;
                meta.touch(1000);
            }
        }
        let err = store.commit_sweep(small_fabric(1, 1010)).unwrap_err();
        assert_eq!(err.status_code(), PaStatusCode::NoImage);
        assert_eq!(store.live_image_id().unwrap().sweep_num, 0);
        assert_eq!(store.sweep_index(), 1);

        store.state.write().slots[2].ff_ref_count = 0;
        let id = store.commit_sweep(small_fabric(1, 1010)).unwrap();
        assert_eq!(id.index, 2);
        assert_eq!(store.freeze_ref_count(1), 1);
    }

    #[test]
    fn test_resolve_by_time() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        store.commit_sweep(small_fabric(0, 1000)).unwrap();
        store.commit_sweep(small_fabric(1, 1010)).unwrap();
        let (view, returned) = store.read_image(&ImageIdQuery::at_time(1004)).unwrap();
        assert_eq!(view.sweep_num, 0);
        assert_eq!(returned.image_time, 1000);
    }

    #[test]
    fn test_stale_sweep_id_not_found() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        let first = store.commit_sweep(small_fabric(0, 1000)).unwrap();
        for sweep in 1..5 {
            store.commit_sweep(small_fabric(sweep, 1000 + u64::from(sweep))).unwrap();
        }
        let err = store
            .read_image(&ImageIdQuery::with_number(first.to_raw()))
            .err()
            .unwrap();
        assert_eq!(err.status_code(), PaStatusCode::NoImage);
    }

    #[test]
    fn test_busy_guard_released_when_stopped() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        store.stop();
        assert!(matches!(store.enter(), Err(PaError::Unavailable)));
        assert_eq!(store.busy_count(), 0);
        store.start();
        let guard = store.enter().unwrap();
        assert_eq!(store.busy_count(), 1);
        drop(guard);
        assert_eq!(store.busy_count(), 0);
    }

    #[test]
    fn test_identities_shared_across_images() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        store.commit_sweep(small_fabric(0, 1000)).unwrap();
        store.commit_sweep(small_fabric(1, 1010)).unwrap();
        let a = Arc::clone(&store.images[0].read().node(1).unwrap().identity);
        let b = Arc::clone(&store.images[1].read().node(1).unwrap().identity);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_totals_accumulate() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = store(&clock);
        let mut image = small_fabric(0, 1000);
        image.node_mut(1).unwrap().port_mut(1).unwrap().delta.xmit_pkts = 5;
        store.commit_sweep(image.clone()).unwrap();
        image.sweep_num = 1;
        store.commit_sweep(image).unwrap();
        let guid = store.images[0].read().node(1).unwrap().guid();
        assert_eq!(store.totals.read()[&(guid, 1)].counters.xmit_pkts, 10);
    }
}

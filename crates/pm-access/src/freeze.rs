//! Freeze frames: client pins that keep an image from being overwritten.
//!
//! A ring image is pinned through a freeze-frame slot plus one bit of the
//! image's 64-bit reference bitmap; the client id is the bit number. A
//! history composite is pinned by placing it in the composite cache. All
//! mutations run under the state write lock.

use crate::error::{PaError, PaStatusCode, Result};
use crate::image_id::{ImageId, ImageIdQuery, ImageKind, ReturnedImageId, MAX_CLIENTS_PER_IMAGE};
use crate::store::{
    no_image, CompositeOrigin, FreezeRef, PmStore, ResolveIntent, SlotMeta, StoreState, Target,
};
use crate::image::ImageData;
use fm_common::audit::AuditCategory;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Returns the first free client id at or after the image's rolling cursor.
fn next_client_id(meta: &SlotMeta) -> Option<u8> {
    (0..MAX_CLIENTS_PER_IMAGE)
        .map(|i| meta.next_client_id.wrapping_add(i) & (MAX_CLIENTS_PER_IMAGE - 1))
        .find(|&client| meta.ff_ref_count & (1u64 << client) == 0)
}

fn out_of_freeze_frames() -> PaError {
    PaError::no_memory(PaStatusCode::NoImage, "Out of Freeze Frame Images")
}

impl PmStore {
    /// Clears the bitmap of every pinned image whose lease has run out.
    fn expire_freeze_leases(&self, state: &mut StoreState, now: u64) {
        let lease = self.config.freeze_frame_lease_secs;
        for (slot, pinned) in state.freeze_frames.iter().enumerate() {
            if let Some(idx) = *pinned {
                let meta = &mut state.slots[idx];
                if meta.expire_lease(now, lease) {
                    warn!(slot, image = idx, "Freeze frame lease expired");
                }
            }
        }
    }

    /// Picks a freeze-frame slot for ring image `idx`: one already pinning
    /// it, else the first empty or stale slot.
    fn alloc_freeze_slot(&self, state: &mut StoreState, idx: usize, now: u64) -> Option<usize> {
        self.expire_freeze_leases(state, now);
        let slots = &state.slots;
        state
            .freeze_frames
            .iter()
            .position(|&p| p == Some(idx) && slots[idx].is_frozen())
            .or_else(|| {
                state
                    .freeze_frames
                    .iter()
                    .position(|p| p.map_or(true, |i| !slots[i].is_frozen()))
            })
    }

    /// Records a new pin of ring image `idx` through freeze slot `slot`.
    fn pin_ring(&self, state: &mut StoreState, slot: usize, idx: usize, client: u8, now: u64) -> ReturnedImageId {
        state.freeze_frames[slot] = Some(idx);
        let instance_id = state.instance_id;
        let meta = &mut state.slots[idx];
        meta.ff_ref_count |= 1u64 << client;
        meta.next_client_id = client.wrapping_add(1) & (MAX_CLIENTS_PER_IMAGE - 1);
        meta.touch(now);
        debug!(slot, image = idx, client, "Freeze frame pinned");
        ReturnedImageId {
            image_number: ImageId::freeze_frame(meta.sweep_num, slot as u8, client, instance_id)
                .to_raw(),
            image_time: meta.sweep_start,
        }
    }

    fn freeze_ring(&self, state: &mut StoreState, idx: usize, now: u64) -> Result<ReturnedImageId> {
        let slot = self
            .alloc_freeze_slot(state, idx, now)
            .ok_or_else(out_of_freeze_frames)?;
        let client = next_client_id(&state.slots[idx]).ok_or_else(|| {
            PaError::no_memory(PaStatusCode::NoImage, "Too many freezes of 1 image")
        })?;
        Ok(self.pin_ring(state, slot, idx, client, now))
    }

    /// Places a composite in the cache (or finds it already there).
    fn freeze_composite(
        &self,
        state: &mut StoreState,
        origin: CompositeOrigin,
        id: ImageId,
        image: Arc<ImageData>,
        now: u64,
    ) -> Result<ReturnedImageId> {
        let returned = |id: ImageId, image: &ImageData| ReturnedImageId {
            image_number: id.to_raw(),
            image_time: image.sweep_start,
        };
        if let CompositeOrigin::Cached(_) = origin {
            return Ok(returned(id, &image));
        }
        if let Some((_, entry)) = state.composites.find_source(id) {
            entry.touch(now);
            return Ok(returned(entry.id, &entry.image));
        }
        let slot = state.composites.free_slot().ok_or_else(out_of_freeze_frames)?;
        let instance_id = state.instance_id;
        let cached = state
            .composites
            .insert(slot, id, Arc::clone(&image), instance_id, now);
        debug!(slot, source = %id, "Composite frozen");
        Ok(returned(cached, &image))
    }

    /// Pins the image named by `query`.
    pub fn freeze_frame_create(&self, query: &ImageIdQuery) -> Result<ReturnedImageId> {
        let _busy = self.enter()?;
        let now = self.now();
        let result = {
            let mut state = self.state.write();
            self.resolve(&state, query, ResolveIntent::Any)
                .and_then(|resolved| match resolved.target {
                    Target::Ring(idx) => self.freeze_ring(&mut state, idx, now),
                    Target::Composite { origin, id, image } => {
                        self.freeze_composite(&mut state, origin, id, image, now)
                    }
                })
        };
        self.audit(
            AuditCategory::FreezeFrame,
            "freeze_frame_create",
            format!("{:#018x}", query.image_number),
            "image",
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Keeps a freeze frame or cached composite alive.
    pub fn freeze_frame_renew(&self, image_number: u64) -> Result<ReturnedImageId> {
        let _busy = self.enter()?;
        let now = self.now();
        let state = self.state.read();
        let resolved = self.resolve(
            &state,
            &ImageIdQuery::with_number(image_number),
            ResolveIntent::FreezeFrame,
        )?;
        match resolved.target {
            Target::Ring(idx) => state.slots[idx].touch(now),
            // Resolution of a cached composite already touched it.
            Target::Composite { .. } => {}
        }
        Ok(resolved.returned)
    }

    /// Drops one client's pin.
    pub fn freeze_frame_release(&self, image_number: u64) -> Result<()> {
        let _busy = self.enter()?;
        let result = {
            let mut state = self.state.write();
            ImageId::from_raw(image_number)
                .and_then(|id| self.release_pin(&mut state, id))
        };
        self.audit(
            AuditCategory::FreezeFrame,
            "freeze_frame_release",
            format!("{:#018x}", image_number),
            "freeze_frame",
            result.as_ref().map(|_| ()),
        );
        result
    }

    fn release_pin(&self, state: &mut StoreState, id: ImageId) -> Result<()> {
        match id.kind {
            ImageKind::History => {
                if state.composites.lookup(id).is_none() {
                    return Err(no_image(format!("cached composite {}", id)));
                }
                state.composites.evict(usize::from(id.index));
                debug!(id = %id, "Composite released");
                Ok(())
            }
            ImageKind::FreezeFrame => {
                let slot = usize::from(id.index);
                let idx = state
                    .freeze_frames
                    .get(slot)
                    .copied()
                    .flatten()
                    .filter(|&i| {
                        id.instance_id == state.instance_id && state.slots[i].sweep_num == id.sweep_num
                    })
                    .ok_or_else(|| no_image(format!("freeze frame {}", id)))?;
                let bit = 1u64 << id.client_id;
                let meta = &mut state.slots[idx];
                if meta.ff_ref_count & bit == 0 {
                    error!(id = %id, image = idx, "Freeze frame has no references");
                    return Err(PaError::invalid(format!("freeze frame {} has no references", id)));
                }
                meta.ff_ref_count &= !bit;
                if meta.ff_ref_count == 0 {
                    state.freeze_frames[slot] = None;
                }
                debug!(id = %id, image = idx, "Freeze frame released");
                Ok(())
            }
            ImageKind::Sweep => Err(PaError::invalid(format!("image {} is not a freeze frame", id))),
        }
    }

    /// Moves a client's pin from `old` to the image named by `new`.
    ///
    /// The new pin is established before the old one is dropped; on error
    /// the old pin is untouched and nothing new is pinned.
    pub fn freeze_frame_move(&self, old: u64, new: &ImageIdQuery) -> Result<ReturnedImageId> {
        let _busy = self.enter()?;
        let now = self.now();
        let result = {
            let mut state = self.state.write();
            self.move_pin(&mut state, old, new, now)
        };
        self.audit(
            AuditCategory::FreezeFrame,
            "freeze_frame_move",
            format!("{:#018x} -> {:#018x}", old, new.image_number),
            "freeze_frame",
            result.as_ref().map(|_| ()),
        );
        result
    }

    fn move_pin(
        &self,
        state: &mut StoreState,
        old: u64,
        new: &ImageIdQuery,
        now: u64,
    ) -> Result<ReturnedImageId> {
        let old_id = ImageId::from_raw(old)?;
        let old_res = self.resolve(state, &ImageIdQuery::with_number(old), ResolveIntent::FreezeFrame)?;
        let new_res = self.resolve(state, new, ResolveIntent::Any)?;

        let returned = match (&old_res.target, new_res.target) {
            (Target::Ring(old_idx), Target::Ring(new_idx)) => {
                if *old_idx == new_idx {
                    return Ok(old_res.returned);
                }
                let Some(FreezeRef { slot, client_id }) = old_res.freeze else {
                    return Err(no_image(format!("freeze frame {}", old_id)));
                };
                let pinned_elsewhere = state.slots[new_idx].is_frozen()
                    && state.freeze_frames.contains(&Some(new_idx));
                if state.slots[*old_idx].ff_ref_count == 1u64 << client_id && !pinned_elsewhere {
                    // Sole client: reuse the old slot for the new image.
                    let client = next_client_id(&state.slots[new_idx]).ok_or_else(|| {
                        PaError::no_memory(PaStatusCode::NoImage, "Too many freezes of 1 image")
                    })?;
                    let returned = self.pin_ring(state, slot, new_idx, client, now);
                    state.slots[*old_idx].ff_ref_count = 0;
                    return Ok(returned);
                }
                self.freeze_ring(state, new_idx, now)?
            }
            (Target::Composite { id: old_cached, .. }, Target::Composite { origin, id, image }) => {
                let same = match origin {
                    CompositeOrigin::Cached(_) => id == *old_cached,
                    _ => state
                        .composites
                        .find_source(id)
                        .is_some_and(|(_, e)| e.id == *old_cached),
                };
                if same {
                    return Ok(old_res.returned);
                }
                if matches!(origin, CompositeOrigin::Cached(_)) || state.composites.free_slot().is_some()
                    || state.composites.find_source(id).is_some()
                {
                    self.freeze_composite(state, origin, id, image, now)?
                } else {
                    // Cache full: the new composite takes over the old entry.
                    let slot = usize::from(old_cached.index);
                    let instance_id = state.instance_id;
                    let image_time = image.sweep_start;
                    let cached = state.composites.insert(slot, id, image, instance_id, now);
                    return Ok(ReturnedImageId {
                        image_number: cached.to_raw(),
                        image_time,
                    });
                }
            }
            (_, Target::Ring(new_idx)) => self.freeze_ring(state, new_idx, now)?,
            (_, Target::Composite { origin, id, image }) => {
                self.freeze_composite(state, origin, id, image, now)?
            }
        };
        self.release_pin(state, old_id)?;
        Ok(returned)
    }

    /// Active freeze-frame ids (client 0 form) followed by cached
    /// composite ids.
    pub fn freeze_frame_details(&self) -> Result<Vec<u64>> {
        let _busy = self.enter()?;
        let state = self.state.read();
        let frames = state
            .freeze_frames
            .iter()
            .enumerate()
            .filter_map(|(slot, pinned)| {
                let meta = &state.slots[(*pinned)?];
                meta.is_frozen().then(|| {
                    ImageId::freeze_frame(meta.sweep_num, slot as u8, 0, state.instance_id).to_raw()
                })
            });
        let composites = state.composites.ids().map(|id| id.to_raw());
        Ok(frames.chain(composites).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_fabric, ManualClock};
    use fm_common::config::PmConfig;

    fn store_with_sweeps(sweeps: u32) -> (PmStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000));
        let config = PmConfig {
            total_images: 5,
            freeze_frame_images: 2,
            ..PmConfig::default()
        };
        let store = PmStore::with_clock(config, clock.clone()).unwrap();
        for sweep in 0..sweeps {
            store.commit_sweep(small_fabric(sweep, 1000 + u64::from(sweep) * 10)).unwrap();
        }
        (store, clock)
    }

    #[test]
    fn test_create_release_symmetry() {
        let (store, _) = store_with_sweeps(2);
        let live = store.live_image_id().unwrap();
        let idx = usize::from(live.index);
        let a = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let b = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        assert_ne!(a.image_number, b.image_number);
        assert_eq!(store.freeze_ref_count(idx).count_ones(), 2);

        store.freeze_frame_release(a.image_number).unwrap();
        store.freeze_frame_release(b.image_number).unwrap();
        assert_eq!(store.freeze_ref_count(idx), 0);
        assert!(store.freeze_frame_details().unwrap().is_empty());
    }

    #[test]
    fn test_double_release_is_invalid() {
        let (store, _) = store_with_sweeps(1);
        let a = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let b = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        store.freeze_frame_release(a.image_number).unwrap();
        let err = store.freeze_frame_release(a.image_number).unwrap_err();
        assert_eq!(err.status_code(), PaStatusCode::InvalidParameter);
        store.freeze_frame_release(b.image_number).unwrap();
        assert_eq!(store.busy_count(), 0);
    }

    #[test]
    fn test_client_ids_roll_forward() {
        let (store, _) = store_with_sweeps(1);
        let first = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        store.freeze_frame_release(first.image_number).unwrap();
        let second = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let c1 = ImageId::from_raw(first.image_number).unwrap().client_id;
        let c2 = ImageId::from_raw(second.image_number).unwrap().client_id;
        assert_eq!(c2, c1 + 1);
    }

    #[test]
    fn test_too_many_clients() {
        let (store, _) = store_with_sweeps(1);
        for _ in 0..MAX_CLIENTS_PER_IMAGE {
            store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        }
        let err = store.freeze_frame_create(&ImageIdQuery::live()).unwrap_err();
        assert!(matches!(err, PaError::InsufficientMemory { code: PaStatusCode::NoImage, .. }));
    }

    #[test]
    fn test_out_of_slots() {
        let (store, _) = store_with_sweeps(3);
        store.freeze_frame_create(&ImageIdQuery::with_offset(0, -1)).unwrap();
        store.freeze_frame_create(&ImageIdQuery::with_offset(0, -2)).unwrap();
        let err = store.freeze_frame_create(&ImageIdQuery::live()).unwrap_err();
        assert_eq!(err.to_string(), "Insufficient memory: Out of Freeze Frame Images");
    }

    #[test]
    fn test_frozen_image_survives_sweeps() {
        let (store, _) = store_with_sweeps(1);
        let frozen = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        for sweep in 1..12 {
            store.commit_sweep(small_fabric(sweep, 2000 + u64::from(sweep))).unwrap();
        }
        let (view, returned) = store
            .read_image(&ImageIdQuery::with_number(frozen.image_number))
            .unwrap();
        assert_eq!(view.sweep_num, 0);
        assert_eq!(returned.image_number, frozen.image_number);
    }

    #[test]
    fn test_lease_expiry_frees_slot() {
        let (store, clock) = store_with_sweeps(1);
        let frozen = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let idx = usize::from(store.live_image_id().unwrap().index);
        clock.advance(store.config().freeze_frame_lease_secs + 1);
        for sweep in 1..6 {
            store.commit_sweep(small_fabric(sweep, 2000 + u64::from(sweep))).unwrap();
        }
        assert_eq!(store.freeze_ref_count(idx), 0);
        assert!(store.freeze_frame_renew(frozen.image_number).is_err());
    }

    #[test]
    fn test_renew_extends_lease() {
        let (store, clock) = store_with_sweeps(1);
        let frozen = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        for sweep in 1..6 {
            clock.advance(30);
            store.freeze_frame_renew(frozen.image_number).unwrap();
            store.commit_sweep(small_fabric(sweep, 2000 + u64::from(sweep))).unwrap();
        }
        let renewed = store.freeze_frame_renew(frozen.image_number).unwrap();
        assert_eq!(renewed.image_time, 1000);
    }

    #[test]
    fn test_move_reuses_sole_slot() {
        let (store, _) = store_with_sweeps(2);
        let frozen = store.freeze_frame_create(&ImageIdQuery::with_offset(0, -1)).unwrap();
        let old_idx = usize::from(
            store
                .read_image(&ImageIdQuery::with_offset(0, -1))
                .map(|(_, r)| ImageId::from_raw(r.image_number).unwrap().index)
                .unwrap(),
        );
        let moved = store
            .freeze_frame_move(frozen.image_number, &ImageIdQuery::live())
            .unwrap();
        let moved_id = ImageId::from_raw(moved.image_number).unwrap();
        let frozen_id = ImageId::from_raw(frozen.image_number).unwrap();
        assert_eq!(moved_id.index, frozen_id.index);
        assert_eq!(moved_id.sweep_num, 1);
        assert_eq!(store.freeze_ref_count(old_idx), 0);
        assert_eq!(store.freeze_frame_details().unwrap().len(), 1);
    }

    #[test]
    fn test_move_coalesces_onto_pinned_image() {
        let (store, _) = store_with_sweeps(2);
        let live = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let older = store.freeze_frame_create(&ImageIdQuery::with_offset(0, -1)).unwrap();
        let live_id = ImageId::from_raw(live.image_number).unwrap();
        let older_id = ImageId::from_raw(older.image_number).unwrap();
        assert_ne!(live_id.index, older_id.index);

        let moved = store
            .freeze_frame_move(older.image_number, &ImageIdQuery::live())
            .unwrap();
        let moved_id = ImageId::from_raw(moved.image_number).unwrap();
        assert_eq!(moved_id.index, live_id.index);
        assert_ne!(moved_id.client_id, live_id.client_id);
        assert_eq!(store.freeze_frame_details().unwrap().len(), 1);
        assert!(store.freeze_frame_renew(older.image_number).is_err());
        store.freeze_frame_release(live.image_number).unwrap();
        store.freeze_frame_release(moved.image_number).unwrap();
        assert!(store.freeze_frame_details().unwrap().is_empty());
    }

    #[test]
    fn test_move_failure_keeps_old_pin() {
        let (store, _) = store_with_sweeps(2);
        let frozen = store.freeze_frame_create(&ImageIdQuery::live()).unwrap();
        let bogus = ImageIdQuery::with_number(ImageId::sweep(77, 3, store.instance_id()).to_raw());
        assert!(store.freeze_frame_move(frozen.image_number, &bogus).is_err());
        assert!(store.freeze_frame_renew(frozen.image_number).is_ok());
        assert_eq!(store.freeze_frame_details().unwrap().len(), 1);
        assert_eq!(store.busy_count(), 0);
    }

    #[test]
    fn test_release_sweep_id_is_invalid() {
        let (store, _) = store_with_sweeps(1);
        let live = store.live_image_id().unwrap();
        let err = store.freeze_frame_release(live.to_raw()).unwrap_err();
        assert_eq!(err.status_code(), PaStatusCode::InvalidParameter);
    }
}

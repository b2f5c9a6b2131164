//! Opaque 64-bit image identifiers.
//!
//! Layout (least significant bit first):
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..32 | sweep number |
//! | 32..40 | index (ring slot, freeze-frame slot or composite cache slot) |
//! | 40..46 | freeze-frame client id |
//! | 46..48 | kind |
//! | 48..56 | engine instance id |
//! | 56..64 | reserved, always zero |
//!
//! The value `0` denotes the live image. [`BAD_IMAGE_ID`] is reported when a
//! query cannot be resolved; its reserved bits are set so it never decodes.

use crate::error::{PaError, Result};
use std::fmt;

/// Returned image number when resolution fails.
pub const BAD_IMAGE_ID: u64 = u64::MAX;

/// Image number naming the most recent valid sweep image.
pub const LIVE_IMAGE_ID: u64 = 0;

/// Composite cache index used for history records that are not cached.
pub const HISTORY_INDEX_RECORD: u8 = 0xFF;

/// Composite cache index naming the composite currently being compounded.
pub const HISTORY_INDEX_CURRENT: u8 = 0xFE;

/// Number of distinct freeze-frame client ids per image.
pub const MAX_CLIENTS_PER_IMAGE: u8 = 64;

const INDEX_SHIFT: u32 = 32;
const CLIENT_SHIFT: u32 = 40;
const KIND_SHIFT: u32 = 46;
const INSTANCE_SHIFT: u32 = 48;
const RESERVED_SHIFT: u32 = 56;

/// Image discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// A ring slot identified by sweep number.
    Sweep,
    /// A freeze-frame slot pinning a ring image.
    FreezeFrame,
    /// A short-term-history composite (cached, current or on record).
    History,
}

impl ImageKind {
    fn bits(self) -> u64 {
        match self {
            ImageKind::Sweep => 0,
            ImageKind::FreezeFrame => 1,
            ImageKind::History => 2,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(ImageKind::Sweep),
            1 => Some(ImageKind::FreezeFrame),
            2 => Some(ImageKind::History),
            _ => None,
        }
    }
}

/// Decoded image identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId {
    pub sweep_num: u32,
    pub index: u8,
    pub client_id: u8,
    pub kind: ImageKind,
    pub instance_id: u8,
}

impl ImageId {
    pub fn sweep(sweep_num: u32, index: u8, instance_id: u8) -> Self {
        Self {
            sweep_num,
            index,
            client_id: 0,
            kind: ImageKind::Sweep,
            instance_id,
        }
    }

    pub fn freeze_frame(sweep_num: u32, slot: u8, client_id: u8, instance_id: u8) -> Self {
        Self {
            sweep_num,
            index: slot,
            client_id: client_id & (MAX_CLIENTS_PER_IMAGE - 1),
            kind: ImageKind::FreezeFrame,
            instance_id,
        }
    }

    pub fn history(sweep_num: u32, index: u8, instance_id: u8) -> Self {
        Self {
            sweep_num,
            index,
            client_id: 0,
            kind: ImageKind::History,
            instance_id,
        }
    }

    /// Decodes a raw image number.
    pub fn from_raw(raw: u64) -> Result<Self> {
        if raw >> RESERVED_SHIFT != 0 {
            return Err(PaError::invalid(format!("image id {:#018x} is malformed", raw)));
        }
        let kind = ImageKind::from_bits((raw >> KIND_SHIFT) & 0x3)
            .ok_or_else(|| PaError::invalid(format!("image id {:#018x} has no kind", raw)))?;
        Ok(Self {
            sweep_num: raw as u32,
            index: (raw >> INDEX_SHIFT) as u8,
            client_id: ((raw >> CLIENT_SHIFT) & 0x3F) as u8,
            kind,
            instance_id: (raw >> INSTANCE_SHIFT) as u8,
        })
    }

    pub fn to_raw(&self) -> u64 {
        u64::from(self.sweep_num)
            | u64::from(self.index) << INDEX_SHIFT
            | u64::from(self.client_id & 0x3F) << CLIENT_SHIFT
            | self.kind.bits() << KIND_SHIFT
            | u64::from(self.instance_id) << INSTANCE_SHIFT
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.to_raw())
    }
}

/// Image selector supplied by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageIdQuery {
    /// Raw image number; [`LIVE_IMAGE_ID`] for the live image.
    pub image_number: u64,
    /// Relative offset; `-n` walks `n` sweeps back through history.
    pub offset: i32,
    /// Absolute time (seconds since the epoch) selecting a live image by
    /// sweep window. Zero when unused.
    pub image_time: u64,
}

impl ImageIdQuery {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn with_number(image_number: u64) -> Self {
        Self {
            image_number,
            ..Self::default()
        }
    }

    pub fn with_offset(image_number: u64, offset: i32) -> Self {
        Self {
            image_number,
            offset,
            image_time: 0,
        }
    }

    pub fn at_time(image_time: u64) -> Self {
        Self {
            image_number: LIVE_IMAGE_ID,
            offset: 0,
            image_time,
        }
    }
}

/// Canonical id of a resolved image plus its sweep start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnedImageId {
    pub image_number: u64,
    pub image_time: u64,
}

impl ReturnedImageId {
    pub fn bad() -> Self {
        Self {
            image_number: BAD_IMAGE_ID,
            image_time: 0,
        }
    }
}

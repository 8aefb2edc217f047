//! The wired subset of the bus.
//!
//! Slots D0..D15 are filtered down to the ones with a channel assigned. The
//! cursors, masks and channel identities are kept as three parallel arrays
//! indexed by [`LineId`]; they are filled together and never reordered. Masks
//! keep the original slot's bit weight, so skipping D2 doesn't move D3 down to
//! bit 2. An unassigned slot is simply a bit that is never set.

use anyhow::{Context, Result};
use derive_more::{From, Into};
use log::info;
use typed_index_collections::TiVec;

use crate::{
    cursor::EdgeCursor,
    settings::{BusSettings, ChannelId, ConfigError},
};

/// Index of an active line, i.e. a position in the filtered set.
#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineId(pub usize);

#[derive(Debug)]
pub struct ChannelSet<C> {
    pub(crate) cursors: TiVec<LineId, C>,
    pub(crate) masks: TiVec<LineId, u16>,
    pub(crate) channels: TiVec<LineId, ChannelId>,
}

impl<C: EdgeCursor> ChannelSet<C> {
    /// Open a cursor for every assigned slot, lowest slot first.
    ///
    /// Fails with [`ConfigError::NoChannelsAssigned`] before opening anything
    /// if no slot is assigned.
    pub fn build(
        settings: &BusSettings,
        mut open: impl FnMut(ChannelId) -> Result<C>,
    ) -> Result<Self> {
        if settings.num_assigned() == 0 {
            return Err(ConfigError::NoChannelsAssigned.into());
        }

        let mut set = Self {
            cursors: TiVec::new(),
            masks: TiVec::new(),
            channels: TiVec::new(),
        };
        for (slot, channel) in settings.assigned() {
            let cursor =
                open(channel).with_context(|| format!("Opening channel {channel} for {slot}"))?;
            set.cursors.push(cursor);
            set.masks.push(slot.mask());
            set.channels.push(channel);
        }

        info!(
            "Bus has {} data lines ({}), mask {:#06x}",
            set.len(),
            settings,
            settings.assigned_mask()
        );
        Ok(set)
    }
}

impl<C> ChannelSet<C> {
    /// Number of active lines. Never 0 for a built set.
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn masks(&self) -> &[u16] {
        &self.masks.raw
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels.raw
    }

    /// The first line's cursor, used as the time reference.
    pub fn reference(&self) -> Option<&C> {
        self.cursors.first()
    }
}

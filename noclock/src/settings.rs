//! Which capture channel drives each data line of the bus.

use std::{fmt, str::FromStr};

use anyhow::{Context, Result};
use derive_more::{Display, From, Into};
use thiserror::Error;

/// Number of data lines, D0..D15.
pub const NUM_SLOTS: usize = 16;

/// A channel of the capture (a physical probe input).
#[derive(From, Into, Display, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

/// Position of a data line on the bus. Slot `i` carries bit `i` of the value.
#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

impl SlotIndex {
    pub fn mask(self) -> u16 {
        1 << self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No data lines are assigned to a channel")]
    NoChannelsAssigned,
    #[error("Slot D{0} does not exist (the bus has 16 data lines)")]
    SlotOutOfRange(usize),
}

/// The channel assignment for D0..D15. Unassigned lines read as a constant 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusSettings {
    slots: [Option<ChannelId>; NUM_SLOTS],
}

impl BusSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, slot: usize, channel: ChannelId) -> Result<Self, ConfigError> {
        self.set_slot(slot, Some(channel))?;
        Ok(self)
    }

    pub fn set_slot(&mut self, slot: usize, channel: Option<ChannelId>) -> Result<(), ConfigError> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(ConfigError::SlotOutOfRange(slot))?;
        *entry = channel;
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Option<ChannelId> {
        self.slots.get(slot).copied().flatten()
    }

    /// Assigned slots in bit order.
    pub fn assigned(&self) -> impl Iterator<Item = (SlotIndex, ChannelId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, channel)| channel.map(|channel| (SlotIndex(i), channel)))
    }

    pub fn num_assigned(&self) -> usize {
        self.assigned().count()
    }

    /// The reference line: the channel in the lowest assigned slot.
    pub fn first_assigned(&self) -> Option<ChannelId> {
        self.assigned().next().map(|(_, channel)| channel)
    }

    /// Bits driven by `channel`. Usually one bit, zero if it isn't assigned.
    pub fn mask_of(&self, channel: ChannelId) -> u16 {
        self.assigned()
            .filter(|(_, c)| *c == channel)
            .fold(0, |mask, (slot, _)| mask | slot.mask())
    }

    /// OR of the masks of all assigned slots.
    pub fn assigned_mask(&self) -> u16 {
        self.assigned().fold(0, |mask, (slot, _)| mask | slot.mask())
    }
}

/// Parses a comma separated list for D0, D1, ... where each entry is a
/// channel number or `-` for unassigned, e.g. `0,1,-,3`.
impl FromStr for BusSettings {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut settings = Self::default();
        for (slot, entry) in s.split(',').map(str::trim).enumerate() {
            let channel = match entry {
                "-" | "" => None,
                n => Some(ChannelId(
                    n.parse()
                        .with_context(|| format!("Invalid channel {n:?} for D{slot}"))?,
                )),
            };
            settings.set_slot(slot, channel)?;
        }
        Ok(settings)
    }
}

impl fmt::Display for BusSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self
            .slots
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1);
        for (i, channel) in self.slots[..used].iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match channel {
                Some(channel) => write!(f, "{channel}")?,
                None => f.write_str("-")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_with_gaps() {
        let settings: BusSettings = "0, 1,-,5".parse().unwrap();
        assert_eq!(settings.slot(0), Some(ChannelId(0)));
        assert_eq!(settings.slot(1), Some(ChannelId(1)));
        assert_eq!(settings.slot(2), None);
        assert_eq!(settings.slot(3), Some(ChannelId(5)));
        assert_eq!(settings.slot(15), None);
        assert_eq!(settings.num_assigned(), 3);
        assert_eq!(settings.assigned_mask(), 0b1011);
        assert_eq!(settings.to_string(), "0,1,-,5");
    }

    #[test]
    fn test_parse_errors() {
        let err = "0,x".parse::<BusSettings>().unwrap_err();
        assert!(err.to_string().contains("D1"));

        let seventeen = vec!["1"; 17].join(",");
        let err = seventeen.parse::<BusSettings>().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::SlotOutOfRange(16))
        );
    }

    #[test]
    fn test_first_assigned_skips_gaps() {
        let settings = BusSettings::new()
            .with_slot(4, ChannelId(9))
            .unwrap()
            .with_slot(7, ChannelId(2))
            .unwrap();
        assert_eq!(settings.first_assigned(), Some(ChannelId(9)));
        assert_eq!(settings.mask_of(ChannelId(2)), 1 << 7);
        assert_eq!(settings.mask_of(ChannelId(3)), 0);
        assert_eq!(BusSettings::new().first_assigned(), None);
    }

    #[test]
    fn test_slot_out_of_range() {
        assert_eq!(
            BusSettings::new().with_slot(16, ChannelId(0)),
            Err(ConfigError::SlotOutOfRange(16))
        );
    }
}

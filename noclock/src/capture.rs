//! In-memory capture storage.
//!
//! Each channel is stored as its state at the start of the capture followed by
//! the sample numbers at which it toggles. Edges are usually dense in time, so
//! rather than a `Vec<u64>` we store the gap to the previous edge as a varint,
//! which is 1 or 2 bytes for most real signals. Cursors decode the gaps as they
//! go so nothing is ever decoded twice.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Context, Result};

use crate::{
    cursor::{BitState, EdgeCursor, NO_MORE_EDGES},
    settings::ChannelId,
    simulation::SimulationChannel,
    varint::{decode_varint, encode_varint},
};

/// The recorded edges of one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelCapture {
    initial: BitState,
    start: u64,
    num_edges: u64,
    /// The last edge pushed, or `start` if there are none.
    last_edge: u64,
    /// Varint encoded gaps: edge[0] - start, then edge[k] - edge[k-1].
    deltas: Vec<u8>,
}

impl ChannelCapture {
    pub fn new(initial: BitState, start: u64) -> Self {
        Self {
            initial,
            start,
            num_edges: 0,
            last_edge: start,
            deltas: Vec::new(),
        }
    }

    pub fn with_edges(
        initial: BitState,
        start: u64,
        edges: impl IntoIterator<Item = u64>,
    ) -> Result<Self> {
        let mut capture = Self::new(initial, start);
        for edge in edges {
            capture.push_edge(edge)?;
        }
        Ok(capture)
    }

    /// Append a toggle at `sample`. Edges must be strictly after the start and
    /// after the previous edge, and can't be at [`NO_MORE_EDGES`].
    pub fn push_edge(&mut self, sample: u64) -> Result<()> {
        if sample == NO_MORE_EDGES {
            bail!("Edge at sample {sample} is reserved to mean no more edges");
        }
        if sample <= self.last_edge {
            bail!(
                "Edge at sample {sample} is not after the previous position {}",
                self.last_edge
            );
        }
        encode_varint(&mut self.deltas, sample - self.last_edge);
        self.last_edge = sample;
        self.num_edges += 1;
        Ok(())
    }

    pub fn initial(&self) -> BitState {
        self.initial
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn num_edges(&self) -> u64 {
        self.num_edges
    }

    /// The state after the last edge.
    pub fn final_state(&self) -> BitState {
        if self.num_edges % 2 == 0 {
            self.initial
        } else {
            self.initial.toggled()
        }
    }

    pub fn edges(&self) -> Edges<'_> {
        Edges {
            deltas: &self.deltas,
            previous: self.start,
        }
    }

    pub(crate) fn deltas(&self) -> &[u8] {
        &self.deltas
    }
}

/// Iterator over the absolute edge times of a [`ChannelCapture`].
#[derive(Clone, Debug)]
pub struct Edges<'a> {
    deltas: &'a [u8],
    previous: u64,
}

impl Iterator for Edges<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let (delta, len) = decode_varint(self.deltas)?;
        self.deltas = &self.deltas[len..];
        // Validated when the edge was pushed.
        self.previous = self.previous.checked_add(delta)?;
        Some(self.previous)
    }
}

/// A cursor over a shared [`ChannelCapture`].
#[derive(Clone, Debug)]
pub struct CaptureCursor {
    capture: Arc<ChannelCapture>,
    position: u64,
    state: BitState,
    /// Offset of the next undecoded gap.
    offset: usize,
    /// The first edge after `position`.
    upcoming: Option<u64>,
}

impl CaptureCursor {
    pub fn new(capture: Arc<ChannelCapture>) -> Self {
        let mut cursor = Self {
            position: capture.start,
            state: capture.initial,
            offset: 0,
            upcoming: None,
            capture,
        };
        cursor.upcoming = cursor.decode_after(cursor.position);
        cursor
    }

    fn decode_after(&mut self, previous: u64) -> Option<u64> {
        let (delta, len) = decode_varint(&self.capture.deltas[self.offset..])?;
        self.offset += len;
        previous.checked_add(delta)
    }
}

impl EdgeCursor for CaptureCursor {
    fn sample_number(&self) -> u64 {
        self.position
    }

    fn advance_to(&mut self, sample: u64) {
        if sample <= self.position {
            return;
        }
        while let Some(edge) = self.upcoming {
            if edge > sample {
                break;
            }
            self.state = self.state.toggled();
            self.upcoming = self.decode_after(edge);
        }
        self.position = sample;
    }

    fn bit_state(&self) -> BitState {
        self.state
    }

    fn next_edge(&mut self) -> Option<u64> {
        self.upcoming
    }
}

/// A complete capture: the sample rate and the edges of each recorded channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capture {
    pub sample_rate: u32,
    channels: BTreeMap<ChannelId, Arc<ChannelCapture>>,
}

impl Capture {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: BTreeMap::new(),
        }
    }

    /// Add or replace a channel.
    pub fn insert(&mut self, channel: ChannelId, capture: ChannelCapture) {
        self.channels.insert(channel, Arc::new(capture));
    }

    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelCapture> {
        self.channels.get(&channel).map(Arc::as_ref)
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelId, &ChannelCapture)> + '_ {
        self.channels
            .iter()
            .map(|(channel, capture)| (*channel, capture.as_ref()))
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Open a cursor at the start of a channel.
    pub fn cursor(&self, channel: ChannelId) -> Result<CaptureCursor> {
        let capture = self
            .channels
            .get(&channel)
            .with_context(|| format!("Channel {channel} is not in the capture"))?;
        Ok(CaptureCursor::new(capture.clone()))
    }

    /// Collect the edges written by the simulation data generator.
    pub fn from_simulation(sample_rate: u32, channels: &[SimulationChannel]) -> Result<Self> {
        let mut capture = Self::new(sample_rate);
        for sim in channels {
            let channel = ChannelCapture::with_edges(
                sim.initial(),
                0,
                sim.transitions().iter().copied(),
            )
            .with_context(|| format!("Simulated channel {}", sim.channel()))?;
            capture.insert(sim.channel(), channel);
        }
        Ok(capture)
    }
}

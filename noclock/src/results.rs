//! Where decoded frames go.
//!
//! [`Results`] stages frames and markers as they are added and only moves them
//! into the shared buffer on [`FrameSink::commit`], so a [`ResultsReader`] on
//! another thread never sees half of a step.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crate::{decoder::Frame, settings::ChannelId};

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum MarkerKind {
    Dot,
}

/// A display-only annotation on one channel's track.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Marker {
    pub sample: u64,
    pub kind: MarkerKind,
    pub channel: ChannelId,
}

pub trait FrameSink {
    fn add_marker(&mut self, marker: Marker);

    fn add_frame(&mut self, frame: Frame);

    /// Publish everything added since the last commit.
    fn commit(&mut self);

    /// The decode has covered everything before `sample`.
    fn report_progress(&mut self, _sample: u64) {}
}

#[derive(Debug, Default)]
struct Committed {
    frames: Vec<Frame>,
    markers: Vec<Marker>,
    bubble_channels: Vec<ChannelId>,
}

/// The decoder's side of the results buffer.
#[derive(Debug, Default)]
pub struct Results {
    committed: Arc<Mutex<Committed>>,
    progress: Arc<AtomicU64>,
    staged_frames: Vec<Frame>,
    staged_markers: Vec<Marker>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for reading committed results, possibly from another thread.
    pub fn reader(&self) -> ResultsReader {
        ResultsReader {
            committed: self.committed.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Ask for decoded values to be drawn on this channel's track.
    pub fn add_channel_bubbles_will_appear_on(&mut self, channel: ChannelId) {
        self.committed.lock().unwrap().bubble_channels.push(channel);
    }
}

impl FrameSink for Results {
    fn add_marker(&mut self, marker: Marker) {
        self.staged_markers.push(marker);
    }

    fn add_frame(&mut self, frame: Frame) {
        self.staged_frames.push(frame);
    }

    fn commit(&mut self) {
        if self.staged_frames.is_empty() && self.staged_markers.is_empty() {
            return;
        }
        let mut committed = self.committed.lock().unwrap();
        committed.frames.append(&mut self.staged_frames);
        committed.markers.append(&mut self.staged_markers);
    }

    fn report_progress(&mut self, sample: u64) {
        self.progress.store(sample, Ordering::SeqCst);
    }
}

/// Read-only view of committed results.
#[derive(Debug, Clone)]
pub struct ResultsReader {
    committed: Arc<Mutex<Committed>>,
    progress: Arc<AtomicU64>,
}

impl ResultsReader {
    pub fn num_frames(&self) -> usize {
        self.committed.lock().unwrap().frames.len()
    }

    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.committed.lock().unwrap().frames.get(index).copied()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.committed.lock().unwrap().frames.clone()
    }

    /// Frames from `from` onwards, for consumers that poll incrementally.
    pub fn frames_since(&self, from: usize) -> Vec<Frame> {
        let committed = self.committed.lock().unwrap();
        committed.frames.get(from..).unwrap_or_default().to_vec()
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.committed.lock().unwrap().markers.clone()
    }

    pub fn bubble_channels(&self) -> Vec<ChannelId> {
        self.committed.lock().unwrap().bubble_channels.clone()
    }

    /// The end of the last committed frame.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }
}

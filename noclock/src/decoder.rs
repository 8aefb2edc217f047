//! The edge-merge decoder.
//!
//! There is no clock, so a new bus value exists whenever any line changes.
//! The decoder is a lazy k-way merge over the edge streams of the active
//! lines. Each step:
//!
//! 1. Advances every cursor to `sample` and ORs together the masks of the
//!    lines that are high.
//! 2. For each line whose cached next edge is at or before `sample`, asks its
//!    cursor for the following edge (or caches [`NO_MORE_EDGES`] for good).
//! 3. Takes the minimum of the caches as the next `sample`, and emits the
//!    frame `sample..minimum`.
//!
//! A line's cache is only refreshed once we reach it, so a step costs O(lines)
//! no matter how busy the other lines are, and each cursor moves over each of
//! its edges exactly once.
//!
//! The frame that ends at [`NO_MORE_EDGES`] is the last one; stepping after it
//! reports [`Step::Exhausted`] without touching the cursors.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, trace};
use typed_index_collections::TiVec;

use crate::{
    channel_set::{ChannelSet, LineId},
    cursor::{EdgeCursor, NO_MORE_EDGES},
    results::{FrameSink, Marker, MarkerKind},
};

/// One decoded bus value and the samples it was valid for.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Frame {
    pub value: u16,
    /// Reserved, always 0.
    pub flags: u8,
    pub start: u64,
    /// The start of the next frame, or [`NO_MORE_EDGES`] for the last frame.
    pub end: u64,
}

impl Frame {
    /// The last frame has no end and so no visual width.
    pub fn is_open(&self) -> bool {
        self.end == NO_MORE_EDGES
    }
}

/// Tabular text, e.g. `0..5 0x0001`.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "{}..end {:#06x}", self.start, self.value)
        } else {
            write!(f, "{}..{} {:#06x}", self.start, self.end, self.value)
        }
    }
}

/// Where the first composed sample is taken.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SeedPolicy {
    /// At the current position of the first line's cursor, even if other lines
    /// start earlier.
    #[default]
    ReferenceChannel,
    /// At the earliest current position of any line.
    EarliestPosition,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    Frame(Frame),
    /// The last frame has been emitted.
    Exhausted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exhausted,
    Cancelled,
}

/// Cooperative cancellation shared between a host and a running decode.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State of a single decode pass over one capture.
#[derive(Debug)]
pub struct EdgeMergeDecoder<C> {
    set: ChannelSet<C>,
    /// Per line, the earliest known edge at or after the last sample.
    next_edge: TiVec<LineId, u64>,
    /// Where the next frame starts. [`NO_MORE_EDGES`] once the last frame is out.
    sample: u64,
    frames: u64,
}

impl<C: EdgeCursor> EdgeMergeDecoder<C> {
    pub fn new(set: ChannelSet<C>) -> Self {
        Self::with_seed_policy(set, SeedPolicy::default())
    }

    pub fn with_seed_policy(set: ChannelSet<C>, policy: SeedPolicy) -> Self {
        let reference = set.reference().map_or(0, EdgeCursor::sample_number);
        let seed = match policy {
            SeedPolicy::ReferenceChannel => reference,
            SeedPolicy::EarliestPosition => set
                .cursors
                .iter()
                .map(EdgeCursor::sample_number)
                .fold(reference, u64::min),
        };
        debug!("Seeding {} lines at sample {seed} ({policy:?})", set.len());

        // Every cache starts "reached" so the first step queries every line.
        let next_edge = set.cursors.iter().map(|_| seed).collect();
        Self {
            set,
            next_edge,
            sample: seed,
            frames: 0,
        }
    }

    pub fn channel_set(&self) -> &ChannelSet<C> {
        &self.set
    }

    /// Start of the frame the next step will produce.
    pub fn position(&self) -> u64 {
        self.sample
    }

    /// Compose the value at the current position and find where it ends.
    ///
    /// This moves the cursors but doesn't publish anything; see [`Self::run`].
    pub fn step(&mut self) -> Step {
        let sample = self.sample;
        if sample == NO_MORE_EDGES {
            return Step::Exhausted;
        }

        let mut value = 0;
        for (cursor, mask) in self.set.cursors.iter_mut().zip(self.set.masks.iter()) {
            cursor.advance_to(sample);
            if cursor.bit_state().is_high() {
                value |= mask;
            }
        }

        let mut nearest = NO_MORE_EDGES;
        for (cursor, next) in self.set.cursors.iter_mut().zip(self.next_edge.iter_mut()) {
            // Once NO_MORE_EDGES this is never true again.
            if *next <= sample {
                *next = cursor.next_edge().unwrap_or(NO_MORE_EDGES);
            }
            nearest = nearest.min(*next);
        }

        self.sample = nearest;
        self.frames += 1;

        let frame = Frame {
            value,
            flags: 0,
            start: sample,
            end: nearest,
        };
        trace!("{frame}");
        Step::Frame(frame)
    }

    /// Step until the input is exhausted or `cancel` is set, committing each
    /// frame and its markers to `sink`.
    ///
    /// Cancellation is checked before each step and again before its results
    /// are committed, so a cancelled run commits nothing further.
    pub fn run(&mut self, sink: &mut impl FrameSink, cancel: &CancelToken) -> RunOutcome {
        info!(
            "Decoding {} data lines from sample {}",
            self.set.len(),
            self.sample
        );
        loop {
            if cancel.is_cancelled() {
                info!("Decode cancelled after {} frames", self.frames);
                return RunOutcome::Cancelled;
            }

            let frame = match self.step() {
                Step::Frame(frame) => frame,
                Step::Exhausted => {
                    info!("Decode finished after {} frames", self.frames);
                    return RunOutcome::Exhausted;
                }
            };

            if cancel.is_cancelled() {
                info!(
                    "Decode cancelled after {} frames, discarding frame at {}",
                    self.frames - 1,
                    frame.start
                );
                return RunOutcome::Cancelled;
            }

            self.commit(sink, &frame);
        }
    }

    fn commit(&self, sink: &mut impl FrameSink, frame: &Frame) {
        for channel in self.set.channels.iter() {
            sink.add_marker(Marker {
                sample: frame.start,
                kind: MarkerKind::Dot,
                channel: *channel,
            });
        }
        sink.add_frame(*frame);
        sink.commit();
        sink.report_progress(frame.end);
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        capture::{Capture, CaptureCursor, ChannelCapture},
        cursor::BitState,
        results::Results,
        settings::{BusSettings, ChannelId},
    };

    fn logging_setup() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Info)
            .try_init();
    }

    /// A capture where channel `n` holds `lines[n]`, all starting low at 0.
    fn capture_of(lines: &[&[u64]]) -> Capture {
        let mut capture = Capture::new(1_000_000);
        for (n, edges) in lines.iter().enumerate() {
            capture.insert(
                ChannelId(n),
                ChannelCapture::with_edges(BitState::Low, 0, edges.iter().copied()).unwrap(),
            );
        }
        capture
    }

    fn decoder_for(settings: &str, capture: &Capture) -> Result<EdgeMergeDecoder<CaptureCursor>> {
        let settings: BusSettings = settings.parse()?;
        let set = ChannelSet::build(&settings, |channel| capture.cursor(channel))?;
        Ok(EdgeMergeDecoder::new(set))
    }

    fn decode(settings: &str, capture: &Capture) -> Vec<Frame> {
        logging_setup();
        let mut decoder = decoder_for(settings, capture).unwrap();
        let mut results = Results::new();
        let reader = results.reader();
        assert_eq!(
            decoder.run(&mut results, &CancelToken::new()),
            RunOutcome::Exhausted
        );
        reader.frames()
    }

    fn frame(start: u64, end: u64, value: u16) -> Frame {
        Frame {
            value,
            flags: 0,
            start,
            end,
        }
    }

    #[test]
    fn test_single_line() {
        let frames = decode("0", &capture_of(&[&[5, 10]]));
        assert_eq!(
            frames,
            [
                frame(0, 5, 0),
                frame(5, 10, 1),
                frame(10, NO_MORE_EDGES, 0)
            ]
        );
        assert!(frames[2].is_open());
    }

    #[test]
    fn test_two_lines_rising_in_turn() {
        let frames = decode("0,1", &capture_of(&[&[4], &[6]]));
        assert_eq!(
            frames,
            [
                frame(0, 4, 0b00),
                frame(4, 6, 0b01),
                frame(6, NO_MORE_EDGES, 0b11)
            ]
        );
    }

    #[test]
    fn test_unassigned_slots_read_zero() {
        let mut capture = Capture::new(1_000_000);
        for n in 0..2 {
            capture.insert(ChannelId(n), ChannelCapture::new(BitState::High, 0));
        }
        // A third channel that toggles, so there is more than one frame.
        capture.insert(
            ChannelId(2),
            ChannelCapture::with_edges(BitState::Low, 0, [3, 8]).unwrap(),
        );
        let frames = decode("0,1,-,-,2", &capture);
        assert_eq!(frames.len(), 3);
        for frame in frames {
            assert_eq!(frame.value & 0b0011, 0b0011);
            assert_eq!(frame.value & 0b1100, 0);
        }
    }

    #[test]
    fn test_line_without_edges() {
        let mut capture = Capture::new(1_000_000);
        capture.insert(ChannelId(0), ChannelCapture::new(BitState::High, 7));
        assert_eq!(decode("0", &capture), [frame(7, NO_MORE_EDGES, 1)]);
    }

    #[test]
    fn test_simultaneous_edges_make_one_boundary() {
        let frames = decode("0,1", &capture_of(&[&[3, 9], &[3, 6]]));
        assert_eq!(
            frames,
            [
                frame(0, 3, 0b00),
                frame(3, 6, 0b11),
                frame(6, 9, 0b01),
                frame(9, NO_MORE_EDGES, 0b00)
            ]
        );
    }

    #[test]
    fn test_exhausted_line_keeps_its_last_value() {
        let frames = decode("0,1", &capture_of(&[&[1], &[2, 3, 4, 5, 6]]));
        assert_eq!(frames.len(), 7);
        for frame in &frames[1..] {
            assert_eq!(frame.value & 1, 1);
        }
    }

    #[test]
    fn test_stepping_after_the_last_frame() {
        let capture = capture_of(&[&[5]]);
        let mut decoder = decoder_for("0", &capture).unwrap();
        assert_eq!(decoder.step(), Step::Frame(frame(0, 5, 0)));
        assert_eq!(decoder.position(), 5);
        assert_eq!(decoder.step(), Step::Frame(frame(5, NO_MORE_EDGES, 1)));
        assert_eq!(decoder.step(), Step::Exhausted);
        assert_eq!(decoder.step(), Step::Exhausted);
    }

    #[test]
    fn test_seed_policies() {
        let mut capture = Capture::new(1_000_000);
        capture.insert(ChannelId(0), ChannelCapture::new(BitState::Low, 10));
        capture.insert(
            ChannelId(1),
            ChannelCapture::with_edges(BitState::Low, 2, [4]).unwrap(),
        );
        let settings: BusSettings = "0,1".parse().unwrap();

        let set = ChannelSet::build(&settings, |c| capture.cursor(c)).unwrap();
        let mut decoder = EdgeMergeDecoder::new(set);
        // Channel 1's edge at 4 has already happened by sample 10.
        assert_eq!(decoder.step(), Step::Frame(frame(10, NO_MORE_EDGES, 0b10)));

        let set = ChannelSet::build(&settings, |c| capture.cursor(c)).unwrap();
        let mut decoder = EdgeMergeDecoder::with_seed_policy(set, SeedPolicy::EarliestPosition);
        assert_eq!(decoder.step(), Step::Frame(frame(2, 4, 0b00)));
        assert_eq!(decoder.step(), Step::Frame(frame(4, NO_MORE_EDGES, 0b10)));
    }

    #[test]
    fn test_markers_per_line_per_frame() {
        let capture = capture_of(&[&[5], &[7]]);
        let mut decoder = decoder_for("1,-,0", &capture).unwrap();
        let mut results = Results::new();
        let reader = results.reader();
        decoder.run(&mut results, &CancelToken::new());

        let markers = reader.markers();
        assert_eq!(markers.len(), 2 * reader.num_frames());
        assert_eq!(
            markers[..2],
            [
                Marker {
                    sample: 0,
                    kind: MarkerKind::Dot,
                    channel: ChannelId(1)
                },
                Marker {
                    sample: 0,
                    kind: MarkerKind::Dot,
                    channel: ChannelId(0)
                }
            ]
        );
        assert_eq!(reader.progress(), NO_MORE_EDGES);
    }

    #[test]
    fn test_cancelled_before_start() {
        let capture = capture_of(&[&[5]]);
        let mut decoder = decoder_for("0", &capture).unwrap();
        let mut results = Results::new();
        let reader = results.reader();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(decoder.run(&mut results, &cancel), RunOutcome::Cancelled);
        assert_eq!(reader.num_frames(), 0);
        assert!(reader.markers().is_empty());
    }

    /// Cancels once a given number of frames have been committed.
    struct CancelAfter {
        results: Results,
        remaining: usize,
        cancel: CancelToken,
    }

    impl FrameSink for CancelAfter {
        fn add_marker(&mut self, marker: Marker) {
            self.results.add_marker(marker);
        }

        fn add_frame(&mut self, frame: Frame) {
            self.results.add_frame(frame);
        }

        fn commit(&mut self) {
            self.results.commit();
            self.remaining -= 1;
            if self.remaining == 0 {
                self.cancel.cancel();
            }
        }
    }

    #[test]
    fn test_cancelled_mid_run() {
        let capture = capture_of(&[&[1, 2, 3, 4, 5, 6]]);
        let mut decoder = decoder_for("0", &capture).unwrap();
        let cancel = CancelToken::new();
        let mut sink = CancelAfter {
            results: Results::new(),
            remaining: 2,
            cancel: cancel.clone(),
        };
        let reader = sink.results.reader();
        assert_eq!(decoder.run(&mut sink, &cancel), RunOutcome::Cancelled);
        assert_eq!(reader.frames(), [frame(0, 1, 0), frame(1, 2, 1)]);
        assert_eq!(reader.markers().len(), 2);
    }

    /// Reference: the state of each line at `time`, composed the slow way.
    fn value_at(slots: &[Option<&Vec<u64>>], time: u64) -> u16 {
        slots
            .iter()
            .enumerate()
            .filter_map(|(slot, edges)| edges.map(|edges| (slot, edges)))
            .filter(|(_, edges)| edges.iter().filter(|e| **e <= time).count() % 2 == 1)
            .fold(0, |value, (slot, _)| value | 1 << slot)
    }

    fn edge_lists() -> impl Strategy<Value = Vec<Option<Vec<u64>>>> {
        prop::collection::vec(
            prop::option::weighted(
                0.7,
                prop::collection::btree_set(1u64..200, 0..12)
                    .prop_map(|edges| edges.into_iter().collect::<Vec<_>>()),
            ),
            1..=16,
        )
    }

    proptest! {
        #[test]
        fn test_frames_match_reference(slots in edge_lists()) {
            prop_assume!(slots.iter().any(Option::is_some));

            let mut capture = Capture::new(1_000_000);
            let mut settings = BusSettings::new();
            for (slot, edges) in slots.iter().enumerate() {
                if let Some(edges) = edges {
                    capture.insert(
                        ChannelId(slot),
                        ChannelCapture::with_edges(BitState::Low, 0, edges.iter().copied()).unwrap(),
                    );
                    settings.set_slot(slot, Some(ChannelId(slot))).unwrap();
                }
            }

            let set = ChannelSet::build(&settings, |c| capture.cursor(c)).unwrap();
            let mut decoder = EdgeMergeDecoder::new(set);
            let mut results = Results::new();
            let reader = results.reader();
            prop_assert_eq!(decoder.run(&mut results, &CancelToken::new()), RunOutcome::Exhausted);
            let frames = reader.frames();

            // One boundary per distinct edge time, plus the start.
            let mut starts: Vec<u64> = slots.iter().flatten().flatten().copied().collect();
            starts.push(0);
            starts.sort_unstable();
            starts.dedup();
            prop_assert_eq!(frames.iter().map(|f| f.start).collect::<Vec<_>>(), starts);

            // Contiguous, ending open.
            for pair in frames.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            prop_assert!(frames.last().unwrap().is_open());

            let refs: Vec<Option<&Vec<u64>>> = slots.iter().map(Option::as_ref).collect();
            for frame in &frames {
                prop_assert_eq!(frame.value, value_at(&refs, frame.start));
                prop_assert_eq!(frame.value & !settings.assigned_mask(), 0);
            }

            // Same input, same output.
            let set = ChannelSet::build(&settings, |c| capture.cursor(c)).unwrap();
            let mut again = EdgeMergeDecoder::new(set);
            let mut results = Results::new();
            let reader = results.reader();
            again.run(&mut results, &CancelToken::new());
            prop_assert_eq!(reader.frames(), frames);
        }
    }

    #[test]
    fn test_boxed_cursors() {
        let capture = capture_of(&[&[2]]);
        let settings: BusSettings = "0".parse().unwrap();
        let set = ChannelSet::build(&settings, |c| {
            Ok(Box::new(capture.cursor(c)?) as Box<dyn EdgeCursor + Send>)
        })
        .unwrap();
        let mut decoder = EdgeMergeDecoder::new(set);
        assert_eq!(decoder.step(), Step::Frame(frame(0, 2, 0)));
        assert_eq!(decoder.step(), Step::Frame(frame(2, NO_MORE_EDGES, 1)));
    }
}

//! The analyzer as a host application sees it: fixed identity, a decode
//! worker thread, and simulation data on request.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, warn};

use crate::{
    channel_set::ChannelSet,
    cursor::EdgeCursor,
    decoder::{CancelToken, EdgeMergeDecoder, Frame, RunOutcome, SeedPolicy},
    results::{FrameSink, Marker, Results, ResultsReader},
    settings::{BusSettings, ChannelId},
    simulation::{SimulationChannel, SimulationDataGenerator},
};

pub const ANALYZER_NAME: &str = "Simple Parallel noclock";

pub const MINIMUM_SAMPLE_RATE_HZ: u32 = 1_000_000;

/// How long dropping a [`DecodeWorker`] waits for a cancelled decode to stop.
pub const DROP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct NoClockAnalyzer {
    settings: BusSettings,
    seed_policy: SeedPolicy,
    simulation_sample_rate: u32,
    // Created on the first simulation request and kept so that later requests
    // continue the same sequence.
    simulation: Option<SimulationDataGenerator>,
}

impl NoClockAnalyzer {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            seed_policy: SeedPolicy::default(),
            simulation_sample_rate: MINIMUM_SAMPLE_RATE_HZ,
            simulation: None,
        }
    }

    pub fn with_seed_policy(mut self, seed_policy: SeedPolicy) -> Self {
        self.seed_policy = seed_policy;
        self
    }

    pub fn with_simulation_sample_rate(mut self, sample_rate: u32) -> Self {
        self.simulation_sample_rate = sample_rate;
        self
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    pub fn minimum_sample_rate_hz(&self) -> u32 {
        MINIMUM_SAMPLE_RATE_HZ
    }

    /// Each pass is deterministic, so one is always enough.
    pub fn needs_rerun(&self) -> bool {
        false
    }

    /// The track decoded values are drawn on: the reference (lowest assigned)
    /// line. Historically called the clock channel, though there is no clock.
    pub fn bubble_channel(&self) -> Option<ChannelId> {
        self.settings.first_assigned()
    }

    pub fn setup_results(&self) -> Results {
        let mut results = Results::new();
        if let Some(channel) = self.bubble_channel() {
            results.add_channel_bubbles_will_appear_on(channel);
        }
        results
    }

    /// Build a decoder for this bus, opening each assigned channel with `open`.
    pub fn decoder<C: EdgeCursor>(
        &self,
        open: impl FnMut(ChannelId) -> Result<C>,
    ) -> Result<EdgeMergeDecoder<C>> {
        let set = ChannelSet::build(&self.settings, open)?;
        Ok(EdgeMergeDecoder::with_seed_policy(set, self.seed_policy))
    }

    /// Open the channels and start decoding them on a new thread.
    ///
    /// `open` is given the worker's cancel token, which sources that can block
    /// (such as [`crate::live::live_channel`]) must watch so that cancelling or
    /// dropping the worker can stop them.
    ///
    /// Configuration errors are returned from here, before any thread exists.
    pub fn start<C>(
        &self,
        cancel: CancelToken,
        open: impl FnMut(ChannelId, &CancelToken) -> Result<C>,
    ) -> Result<DecodeWorker>
    where
        C: EdgeCursor + Send + 'static,
    {
        self.start_with_callback(cancel, open, Box::new(|| {}))
    }

    /// As [`Self::start`], calling `update_callback` on the worker thread after
    /// every commit (e.g. to request a repaint).
    pub fn start_with_callback<C>(
        &self,
        cancel: CancelToken,
        mut open: impl FnMut(ChannelId, &CancelToken) -> Result<C>,
        update_callback: Box<dyn FnMut() + Send>,
    ) -> Result<DecodeWorker>
    where
        C: EdgeCursor + Send + 'static,
    {
        let decoder = self.decoder(|channel| open(channel, &cancel))?;
        let results = self.setup_results();
        DecodeWorker::spawn(decoder, results, cancel, update_callback)
    }

    /// Extend simulated data for every channel up to `minimum_sample_index`.
    pub fn generate_simulation_data(
        &mut self,
        minimum_sample_index: u64,
        device_sample_rate: u32,
        channels: &mut [SimulationChannel],
    ) -> usize {
        let settings = &self.settings;
        let sample_rate = self.simulation_sample_rate;
        self.simulation
            .get_or_insert_with(|| SimulationDataGenerator::new(sample_rate, settings))
            .generate(minimum_sample_index, device_sample_rate, channels)
    }

    /// Fresh descriptors for the assigned channels.
    pub fn simulation_channels(&self) -> Vec<SimulationChannel> {
        SimulationDataGenerator::new(self.simulation_sample_rate, &self.settings).channels()
    }
}

/// Calls back into the host after every commit.
struct NotifyingSink {
    results: Results,
    update_callback: Box<dyn FnMut() + Send>,
}

impl FrameSink for NotifyingSink {
    fn add_marker(&mut self, marker: Marker) {
        self.results.add_marker(marker);
    }

    fn add_frame(&mut self, frame: Frame) {
        self.results.add_frame(frame);
    }

    fn commit(&mut self) {
        self.results.commit();
        (self.update_callback)();
    }

    fn report_progress(&mut self, sample: u64) {
        self.results.report_progress(sample);
    }
}

/// A decode running on its own thread.
///
/// Dropping the worker cancels it and waits up to [`DROP_JOIN_TIMEOUT`] for
/// the thread to exit. A thread stuck in a source that ignores the cancel
/// token is detached after that.
pub struct DecodeWorker {
    cancel: CancelToken,
    results: ResultsReader,
    done: Receiver<RunOutcome>,
    outcome: Option<RunOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn<C>(
        mut decoder: EdgeMergeDecoder<C>,
        results: Results,
        cancel: CancelToken,
        update_callback: Box<dyn FnMut() + Send>,
    ) -> Result<Self>
    where
        C: EdgeCursor + Send + 'static,
    {
        let reader = results.reader();
        let (done_sender, done) = crossbeam_channel::bounded(1);
        let cancel_thread = cancel.clone();

        let handle = thread::Builder::new()
            .name("noclock-decoder".to_owned())
            .spawn(move || {
                let mut sink = NotifyingSink {
                    results,
                    update_callback,
                };
                let outcome = decoder.run(&mut sink, &cancel_thread);
                // The worker may already have been dropped.
                let _ = done_sender.send(outcome);
            })
            .context("Spawning decoder thread")?;

        info!("Started decoder thread");
        Ok(Self {
            cancel,
            results: reader,
            done,
            outcome: None,
            handle: Some(handle),
        })
    }

    pub fn results(&self) -> &ResultsReader {
        &self.results
    }

    /// End of the last committed frame.
    pub fn progress(&self) -> u64 {
        self.results.progress()
    }

    /// Ask the decoder to stop at its next step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The outcome, if the decoder has finished.
    pub fn try_outcome(&mut self) -> Option<RunOutcome> {
        if self.outcome.is_none() {
            self.outcome = self.done.try_recv().ok();
        }
        self.outcome
    }

    /// Wait up to `timeout` for the decoder to finish.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<RunOutcome>> {
        if self.outcome.is_some() {
            return Ok(self.outcome);
        }
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                Ok(self.outcome)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.join_panicked()),
        }
    }

    /// Wait for the decoder to finish and join its thread.
    pub fn wait(mut self) -> Result<RunOutcome> {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => self.done.recv().map_err(|_| self.join_panicked())?,
        };
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("Decoder thread panicked"))?;
        }
        Ok(outcome)
    }

    fn join_panicked(&mut self) -> anyhow::Error {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        anyhow!("Decoder thread exited without finishing")
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.cancel();
        if self.outcome.is_none() {
            if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(DROP_JOIN_TIMEOUT) {
                warn!("Decoder thread did not stop within {DROP_JOIN_TIMEOUT:?}, detaching it");
                return;
            }
        }
        let _ = handle.join();
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Instant,
    };

    use super::*;
    use crate::{
        capture::{Capture, ChannelCapture},
        cursor::{BitState, NO_MORE_EDGES},
        live::live_channel,
        settings::ConfigError,
    };

    fn logging_setup() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Info)
            .try_init();
    }

    fn analyzer(slots: &str) -> NoClockAnalyzer {
        NoClockAnalyzer::new(slots.parse().unwrap())
    }

    #[test]
    fn test_identity() {
        let analyzer = analyzer("-,4,5");
        assert_eq!(analyzer.name(), "Simple Parallel noclock");
        assert_eq!(analyzer.minimum_sample_rate_hz(), 1_000_000);
        assert!(!analyzer.needs_rerun());
        assert_eq!(analyzer.bubble_channel(), Some(ChannelId(4)));
        assert_eq!(
            analyzer.setup_results().reader().bubble_channels(),
            [ChannelId(4)]
        );
    }

    #[test]
    fn test_start_without_channels_fails_fast() {
        let capture = Capture::new(1_000_000);
        let err = analyzer("-,-")
            .start(CancelToken::new(), |c, _| capture.cursor(c))
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NoChannelsAssigned)
        );
    }

    #[test]
    fn test_worker_decodes_capture() {
        logging_setup();
        let mut capture = Capture::new(1_000_000);
        capture.insert(
            ChannelId(0),
            ChannelCapture::with_edges(BitState::Low, 0, [5, 10]).unwrap(),
        );

        let commits = Arc::new(AtomicUsize::new(0));
        let commits_thread = commits.clone();
        let worker = analyzer("0")
            .start_with_callback(
                CancelToken::new(),
                |c, _| capture.cursor(c),
                Box::new(move || {
                    commits_thread.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let results = worker.results().clone();
        assert_eq!(worker.wait().unwrap(), RunOutcome::Exhausted);

        assert_eq!(results.num_frames(), 3);
        assert_eq!(results.progress(), NO_MORE_EDGES);
        assert_eq!(commits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_live_decode_matches_capture() {
        logging_setup();
        let edges: [&[u64]; 2] = [&[4, 9, 15], &[6, 9]];

        let mut capture = Capture::new(1_000_000);
        for (n, e) in edges.iter().enumerate() {
            capture.insert(
                ChannelId(n),
                ChannelCapture::with_edges(BitState::Low, 0, e.iter().copied()).unwrap(),
            );
        }
        let expected = analyzer("0,1")
            .start(CancelToken::new(), |c, _| capture.cursor(c))
            .unwrap();
        let expected_results = expected.results().clone();
        expected.wait().unwrap();

        let cancel = CancelToken::new();
        let mut feeds = Vec::new();
        let worker = analyzer("0,1")
            .start(cancel.clone(), |_, cancel| {
                let (feed, cursor) = live_channel(BitState::Low, 0, cancel.clone());
                feeds.push(feed);
                Ok(cursor)
            })
            .unwrap();
        for (feed, e) in feeds.into_iter().zip(edges) {
            for edge in e {
                feed.edge(*edge).unwrap();
            }
            feed.close();
        }
        let results = worker.results().clone();
        assert_eq!(worker.wait().unwrap(), RunOutcome::Exhausted);
        assert_eq!(results.frames(), expected_results.frames());
    }

    #[test]
    fn test_cancel_blocked_live_decode() {
        let cancel = CancelToken::new();
        let mut feeds = Vec::new();
        let mut worker = analyzer("0")
            .start(cancel.clone(), |_, cancel| {
                let (feed, cursor) = live_channel(BitState::Low, 0, cancel.clone());
                feeds.push(feed);
                Ok(cursor)
            })
            .unwrap();

        feeds[0].edge(3).unwrap();
        // The first frame [0, 3) can be committed; then the cursor waits for
        // more data that never comes.
        while worker.results().num_frames() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.wait_timeout(Duration::from_millis(50)).unwrap(), None);

        worker.cancel();
        assert_eq!(worker.wait().unwrap(), RunOutcome::Cancelled);
        drop(feeds);
    }

    #[test]
    fn test_drop_stops_blocked_live_decode() {
        let mut feeds = Vec::new();
        let worker = analyzer("0")
            .start(CancelToken::new(), |_, cancel| {
                let (feed, cursor) = live_channel(BitState::Low, 0, cancel.clone());
                feeds.push(feed);
                Ok(cursor)
            })
            .unwrap();
        let results = worker.results().clone();

        feeds[0].edge(3).unwrap();
        while results.num_frames() < 1 {
            thread::sleep(Duration::from_millis(1));
        }

        // The feed stays open, so only the worker's own token can unblock it.
        let started = Instant::now();
        drop(worker);
        assert!(started.elapsed() < DROP_JOIN_TIMEOUT);
        assert_eq!(results.num_frames(), 1);
        drop(feeds);
    }

    /// A source that never answers and never looks at a cancel token.
    struct StuckCursor(Arc<AtomicUsize>);

    impl EdgeCursor for StuckCursor {
        fn sample_number(&self) -> u64 {
            0
        }

        fn advance_to(&mut self, _sample: u64) {}

        fn bit_state(&self) -> BitState {
            BitState::Low
        }

        fn next_edge(&mut self) -> Option<u64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            loop {
                thread::park();
            }
        }
    }

    #[test]
    fn test_drop_detaches_uncancellable_decode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = analyzer("0")
            .start(CancelToken::new(), |_, _| Ok(StuckCursor(calls.clone())))
            .unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        drop(worker);
        let elapsed = started.elapsed();
        assert!(elapsed >= DROP_JOIN_TIMEOUT);
        assert!(elapsed < DROP_JOIN_TIMEOUT * 5);
    }

    #[test]
    fn test_simulation_initialized_once() {
        let mut analyzer = analyzer("0,1");
        let mut channels = analyzer.simulation_channels();
        assert_eq!(analyzer.generate_simulation_data(1_000, 1_000_000, &mut channels), 2);
        assert_eq!(analyzer.generate_simulation_data(3_000, 1_000_000, &mut channels), 2);

        let mut fresh = analyzer.simulation_channels();
        let mut generator = SimulationDataGenerator::new(1_000_000, analyzer.settings());
        generator.generate(3_000, 1_000_000, &mut fresh);
        assert_eq!(channels, fresh);
    }
}

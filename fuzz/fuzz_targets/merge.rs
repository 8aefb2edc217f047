#![no_main]

use libfuzzer_sys::fuzz_target;
use noclock::{
    capture::{Capture, ChannelCapture},
    channel_set::ChannelSet,
    results::Results,
    BitState, BusSettings, CancelToken, ChannelId, EdgeMergeDecoder, RunOutcome,
};

// Each input byte adds an edge: the low 2 bits pick one of 4 lines and the
// rest is the gap since that line's previous edge (0 means "same time as the
// last edge on any line", to exercise simultaneous edges).
fuzz_target!(|data: &[u8]| {
    let mut last = [0u64; 4];
    let mut latest = 0u64;
    let mut edges: [Vec<u64>; 4] = Default::default();
    for byte in data {
        let line = (byte & 0b11) as usize;
        let gap = (byte >> 2) as u64;
        let edge = if gap == 0 { latest.max(last[line] + 1) } else { last[line] + gap };
        edges[line].push(edge);
        last[line] = edge;
        latest = latest.max(edge);
    }

    let mut capture = Capture::new(1_000_000);
    let mut settings = BusSettings::new();
    for (line, edges) in edges.iter().enumerate() {
        capture.insert(
            ChannelId(line),
            ChannelCapture::with_edges(BitState::Low, 0, edges.iter().copied()).unwrap(),
        );
        settings.set_slot(line * 4, Some(ChannelId(line))).unwrap();
    }

    let set = ChannelSet::build(&settings, |c| capture.cursor(c)).unwrap();
    let mut decoder = EdgeMergeDecoder::new(set);
    let mut results = Results::new();
    let reader = results.reader();
    assert_eq!(decoder.run(&mut results, &CancelToken::new()), RunOutcome::Exhausted);

    let frames = reader.frames();
    assert_eq!(frames[0].start, 0);
    for pair in frames.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
        assert!(pair[0].start < pair[0].end);
    }
    assert!(frames.last().unwrap().is_open());
    for frame in &frames {
        assert_eq!(frame.value & !0b0001_0001_0001_0001, 0);
    }
});

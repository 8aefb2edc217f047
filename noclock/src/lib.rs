//! Decoder for clockless parallel buses.
//!
//! Up to 16 data lines (D0..D15) are captured as independent streams of edges.
//! There is no strobe, so the bus value is whatever the lines read whenever any
//! of them changes. [`decoder::EdgeMergeDecoder`] merges the edge streams in
//! time order and emits one [`decoder::Frame`] per interval between changes.
//!
//! ```text
//! capture / live feed -> EdgeCursor -> ChannelSet -> EdgeMergeDecoder -> FrameSink
//! ```

pub mod analyzer;
pub mod capture;
pub mod capture_file;
pub mod channel_set;
pub mod cursor;
pub mod decoder;
pub mod live;
pub mod results;
pub mod settings;
pub mod simulation;
pub mod varint;

pub use analyzer::{DecodeWorker, NoClockAnalyzer, ANALYZER_NAME, MINIMUM_SAMPLE_RATE_HZ};
pub use cursor::{BitState, EdgeCursor, NO_MORE_EDGES};
pub use decoder::{CancelToken, EdgeMergeDecoder, Frame, RunOutcome, SeedPolicy, Step};
pub use settings::{BusSettings, ChannelId, ConfigError};

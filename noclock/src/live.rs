//! Channel sources that are still being captured.
//!
//! An acquisition thread pushes edge times into a [`LiveFeed`] as it finds
//! them. The matching [`LiveCursor`] blocks whenever the decoder asks about a
//! position the feed hasn't reached yet, and reports "no more edges" only
//! once the feed is closed (or dropped). That blocking is the decoder's
//! backpressure: it never has to guess whether a quiet line is idle or just
//! not captured yet.

use std::{collections::VecDeque, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::{
    cursor::{BitState, EdgeCursor},
    decoder::CancelToken,
};

/// How often a blocked cursor checks its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Create a live channel that starts in `initial` at sample `start`.
///
/// The cursor stops waiting for data, as if the feed had closed, once
/// `cancel` is set.
pub fn live_channel(
    initial: BitState,
    start: u64,
    cancel: CancelToken,
) -> (LiveFeed, LiveCursor) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let cursor = LiveCursor {
        receiver,
        pending: VecDeque::new(),
        closed: false,
        position: start,
        state: initial,
        last_edge: start,
        cancel,
    };
    (LiveFeed { sender }, cursor)
}

/// The acquisition side of a live channel.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    sender: Sender<u64>,
}

impl LiveFeed {
    /// Report a toggle at `sample`. Fails if the cursor has gone away.
    pub fn edge(&self, sample: u64) -> Result<()> {
        self.sender
            .send(sample)
            .ok()
            .context("Live cursor has been dropped")
    }

    /// End of capture for this channel.
    pub fn close(self) {}
}

#[derive(Debug)]
pub struct LiveCursor {
    receiver: Receiver<u64>,
    /// Received edges after `position`.
    pending: VecDeque<u64>,
    closed: bool,
    position: u64,
    state: BitState,
    last_edge: u64,
    cancel: CancelToken,
}

impl LiveCursor {
    /// Wait for one more edge. Returns false once the feed is closed.
    fn fill(&mut self) -> bool {
        while !self.closed {
            let received = match self.receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(edge) => Some(edge),
                Err(RecvTimeoutError::Timeout) if !self.cancel.is_cancelled() => continue,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Live cursor cancelled at sample {}", self.position);
                    None
                }
                Err(RecvTimeoutError::Disconnected) => None,
            };
            match received {
                Some(edge) if edge <= self.last_edge => {
                    warn!(
                        "Dropping edge at sample {edge}, not after the previous edge at {}",
                        self.last_edge
                    );
                }
                Some(edge) => {
                    self.last_edge = edge;
                    self.pending.push_back(edge);
                    return true;
                }
                None => self.closed = true,
            }
        }
        false
    }
}

impl EdgeCursor for LiveCursor {
    fn sample_number(&self) -> u64 {
        self.position
    }

    fn advance_to(&mut self, sample: u64) {
        if sample <= self.position {
            return;
        }
        // Apply every edge up to `sample`, waiting until we have seen one after
        // it (or the end) so none can still arrive.
        loop {
            if self.pending.is_empty() && !self.fill() {
                break;
            }
            match self.pending.front() {
                Some(&edge) if edge <= sample => {
                    self.pending.pop_front();
                    self.state = self.state.toggled();
                }
                _ => break,
            }
        }
        self.position = sample;
    }

    fn bit_state(&self) -> BitState {
        self.state
    }

    fn next_edge(&mut self) -> Option<u64> {
        if self.pending.is_empty() {
            self.fill();
        }
        self.pending.front().copied()
    }
}

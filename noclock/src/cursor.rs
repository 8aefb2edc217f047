//! The interface between the decoder and whatever stores the captured edges.

/// Time value meaning "no further transitions". Also the end of the last frame.
pub const NO_MORE_EDGES: u64 = u64::MAX;

#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub enum BitState {
    #[default]
    Low,
    High,
}

impl BitState {
    pub fn toggled(self) -> Self {
        match self {
            BitState::Low => BitState::High,
            BitState::High => BitState::Low,
        }
    }

    pub fn is_high(self) -> bool {
        self == BitState::High
    }
}

impl From<bool> for BitState {
    fn from(high: bool) -> Self {
        if high {
            BitState::High
        } else {
            BitState::Low
        }
    }
}

/// A forward-only cursor over one channel's edges.
///
/// Positions are absolute sample numbers. The cursor only ever moves forward;
/// the bit state is the state in effect at the current position, so an edge
/// exactly at the position has already happened.
pub trait EdgeCursor {
    /// The current position.
    fn sample_number(&self) -> u64;

    /// Move forward to `sample`, applying every edge at or before it. Moving to
    /// a position at or before the current one does nothing. May block until
    /// the backing data reaches `sample`.
    fn advance_to(&mut self, sample: u64);

    fn bit_state(&self) -> BitState;

    /// The first edge after the current position, or None if the channel has
    /// no more transitions. May block until that is known.
    fn next_edge(&mut self) -> Option<u64>;
}

impl<C: EdgeCursor + ?Sized> EdgeCursor for Box<C> {
    fn sample_number(&self) -> u64 {
        (**self).sample_number()
    }

    fn advance_to(&mut self, sample: u64) {
        (**self).advance_to(sample)
    }

    fn bit_state(&self) -> BitState {
        (**self).bit_state()
    }

    fn next_edge(&mut self) -> Option<u64> {
        (**self).next_edge()
    }
}

//! Synthetic bus traffic for self-test.
//!
//! The generator drives the assigned lines with a pseudo-random sequence of bus
//! values. Without a clock the lines of a real bus never change at exactly the
//! same moment, so each line settles on its new bit after its own small,
//! pseudo-random skew. The decoder therefore sees a few short glitch frames
//! before each settled value, just like real hardware.

use log::debug;
use rand::{RngExt, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::{
    cursor::BitState,
    settings::{BusSettings, ChannelId},
};

/// Rate at which new bus values are produced.
const VALUE_RATE_HZ: u32 = 50_000;
/// Never hold a value for fewer samples than this.
const MIN_SAMPLES_PER_VALUE: u64 = 4;
const SIMULATION_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// The simulated waveform of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationChannel {
    channel: ChannelId,
    initial: BitState,
    state: BitState,
    current_sample: u64,
    transitions: Vec<u64>,
}

impl SimulationChannel {
    pub fn new(channel: ChannelId, initial: BitState) -> Self {
        Self {
            channel,
            initial,
            state: initial,
            current_sample: 0,
            transitions: Vec::new(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn initial(&self) -> BitState {
        self.initial
    }

    pub fn current_bit_state(&self) -> BitState {
        self.state
    }

    pub fn current_sample_number(&self) -> u64 {
        self.current_sample
    }

    /// Sample numbers of every toggle so far, in order.
    pub fn transitions(&self) -> &[u64] {
        &self.transitions
    }

    pub fn advance(&mut self, samples: u64) {
        self.current_sample += samples;
    }

    /// Toggle at the current sample. Toggling twice at one sample cancels out.
    pub fn transition(&mut self) {
        self.state = self.state.toggled();
        if self.transitions.last() == Some(&self.current_sample) {
            self.transitions.pop();
        } else {
            self.transitions.push(self.current_sample);
        }
    }

    pub fn transition_if_needed(&mut self, state: BitState) {
        if self.state != state {
            self.transition();
        }
    }
}

/// Convert a sample number at `device_sample_rate` into one at `simulation_sample_rate`.
pub fn adjust_simulation_target_sample(
    target_sample: u64,
    device_sample_rate: u32,
    simulation_sample_rate: u32,
) -> u64 {
    if device_sample_rate == 0 || device_sample_rate == simulation_sample_rate {
        return target_sample;
    }
    let adjusted =
        target_sample as u128 * simulation_sample_rate as u128 / device_sample_rate as u128;
    u64::try_from(adjusted).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug)]
pub struct SimulationDataGenerator {
    sample_rate: u32,
    settings: BusSettings,
    // XorShiftRng output is fixed for a given seed, on every platform.
    rng: XorShiftRng,
    samples_per_value: u64,
    values: u64,
    /// Every bus value drawn so far.
    #[cfg(test)]
    driven: Vec<u16>,
}

impl SimulationDataGenerator {
    /// Seeded once here; later calls to [`Self::generate`] continue the sequence.
    pub fn new(sample_rate: u32, settings: &BusSettings) -> Self {
        let samples_per_value = (sample_rate / VALUE_RATE_HZ) as u64;
        Self {
            sample_rate,
            settings: settings.clone(),
            rng: XorShiftRng::seed_from_u64(SIMULATION_SEED),
            samples_per_value: samples_per_value.max(MIN_SAMPLES_PER_VALUE),
            values: 0,
            #[cfg(test)]
            driven: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples_per_value(&self) -> u64 {
        self.samples_per_value
    }

    /// One descriptor per assigned slot, in slot order, all starting low.
    pub fn channels(&self) -> Vec<SimulationChannel> {
        self.settings
            .assigned()
            .map(|(_, channel)| SimulationChannel::new(channel, BitState::Low))
            .collect()
    }

    /// Extend `channels` until they all reach `minimum_sample_index` (given at
    /// `device_sample_rate`). Returns the number of channels.
    ///
    /// Every channel advances by the same amount, so they stay aligned.
    pub fn generate(
        &mut self,
        minimum_sample_index: u64,
        device_sample_rate: u32,
        channels: &mut [SimulationChannel],
    ) -> usize {
        let target = adjust_simulation_target_sample(
            minimum_sample_index,
            device_sample_rate,
            self.sample_rate,
        );
        let masks: Vec<u16> = channels
            .iter()
            .map(|c| self.settings.mask_of(c.channel()))
            .collect();
        // Skews are in 1..=max_skew, so a line never toggles at the very start
        // of a period and always settles in its first quarter.
        let max_skew = (self.samples_per_value / 4).max(1);

        while channels.iter().any(|c| c.current_sample_number() < target) {
            let value: u16 = self.rng.random();
            #[cfg(test)]
            self.driven.push(value);
            for (channel, mask) in channels.iter_mut().zip(&masks) {
                let skew = self.rng.random_range(1..=max_skew);
                channel.advance(skew);
                channel.transition_if_needed(BitState::from(value & mask != 0));
                channel.advance(self.samples_per_value - skew);
            }
            self.values += 1;
        }
        debug!(
            "Simulated {} bus values up to sample {target}",
            self.values
        );
        channels.len()
    }
}

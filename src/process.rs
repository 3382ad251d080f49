// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The processing contract between a module and the host's audio thread.
//!
//! # Example Processor
//!
//! ```ignore
//! use patchcord::*;
//!
//! struct Gain {
//!     gain: f32,
//! }
//!
//! impl AudioProcessor for Gain {
//!     fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
//!         while let Some(message) = scope.next() {
//!             if let [0xB0, 7, value] = message.data() {
//!                 self.gain = *value as f32 / 127.0;
//!             }
//!         }
//!         block.copy_input_to_output();
//!         for sample in block.output_mut() {
//!             *sample *= self.gain;
//!         }
//!     }
//! }
//! ```

use crate::error::BlockError;
use crate::realtime::{Message, MessageReceiver};
use crate::stats::ModuleStats;
use std::sync::Arc;

/// A module's audio processing function.
///
/// # Real-time Safety
///
/// `process` runs on the host's audio thread. Implementations MUST be
/// real-time safe:
/// - No memory allocation
/// - No mutex locks
/// - No file I/O
/// - No unbounded loops
///
/// A panic is caught by the host driver and silences the block, but it is
/// still a bug in the processor.
pub trait AudioProcessor: Send + 'static {
    /// Compute one block of output, draining control messages from `scope`
    /// as needed.
    fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>);
}

impl<F> AudioProcessor for F
where
    F: FnMut(&mut AudioBlock<'_>, &mut ProcessScope<'_>) + Send + 'static,
{
    fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
        self(block, scope)
    }
}

/// Plain function processing callback taking a shared context.
pub type ProcessFn<C> = fn(&C, &mut AudioBlock<'_>, &mut ProcessScope<'_>);

/// A process function paired with its context.
///
/// The module stores only a reference to the context; the installer keeps its
/// own handle and may share state with the audio thread through it. Anything
/// in the context that changes while processing must use atomics.
pub struct ProcessCallback<C: Send + Sync + 'static> {
    process: ProcessFn<C>,
    context: Arc<C>,
}

impl<C: Send + Sync + 'static> ProcessCallback<C> {
    /// Pair a function with its context.
    pub fn new(process: ProcessFn<C>, context: Arc<C>) -> Self {
        Self { process, context }
    }

    /// The context passed to every call.
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }
}

impl<C: Send + Sync + 'static> AudioProcessor for ProcessCallback<C> {
    #[inline]
    fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
        (self.process)(&self.context, block, scope)
    }
}

/// One quantum of audio.
///
/// Buffers are non-interleaved: channel `c` occupies
/// `[c * frames, (c + 1) * frames)`.
pub struct AudioBlock<'a> {
    sample_rate: u32,
    frames: usize,
    input_channels: usize,
    input: &'a [f32],
    output_channels: usize,
    output: &'a mut [f32],
}

impl<'a> AudioBlock<'a> {
    /// Wrap host buffers.
    ///
    /// Fails if either buffer is shorter than `channels * frames`.
    pub fn new(
        sample_rate: u32,
        frames: usize,
        input_channels: usize,
        input: &'a [f32],
        output_channels: usize,
        output: &'a mut [f32],
    ) -> Result<Self, BlockError> {
        let needed_in = input_channels * frames;
        if input.len() < needed_in {
            return Err(BlockError::InputTooShort {
                needed: needed_in,
                actual: input.len(),
            });
        }
        let needed_out = output_channels * frames;
        if output.len() < needed_out {
            return Err(BlockError::OutputTooShort {
                needed: needed_out,
                actual: output.len(),
            });
        }

        Ok(Self {
            sample_rate,
            frames,
            input_channels,
            input: &input[..needed_in],
            output_channels,
            output: &mut output[..needed_out],
        })
    }

    /// Sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames per channel in this block.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    #[inline]
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// The whole input buffer.
    #[inline]
    pub fn input(&self) -> &[f32] {
        self.input
    }

    /// The whole output buffer.
    #[inline]
    pub fn output_mut(&mut self) -> &mut [f32] {
        &mut *self.output
    }

    /// One input channel.
    ///
    /// Returns an empty slice for an out-of-range channel.
    pub fn input_channel(&self, channel: usize) -> &[f32] {
        if channel >= self.input_channels {
            return &[];
        }
        let start = channel * self.frames;
        &self.input[start..start + self.frames]
    }

    /// One output channel.
    ///
    /// Returns an empty slice for an out-of-range channel.
    pub fn output_channel_mut(&mut self, channel: usize) -> &mut [f32] {
        if channel >= self.output_channels {
            return &mut [];
        }
        let start = channel * self.frames;
        &mut self.output[start..start + self.frames]
    }

    /// Zero the output.
    pub fn silence(&mut self) {
        self.output.fill(0.0);
    }

    /// Copy input channels to matching output channels and zero the rest.
    pub fn copy_input_to_output(&mut self) {
        let shared = self.input_channels.min(self.output_channels) * self.frames;
        self.output[..shared].copy_from_slice(&self.input[..shared]);
        self.output[shared..].fill(0.0);
    }
}

/// Per-quantum services available to a processor.
pub struct ProcessScope<'a> {
    messages: &'a mut MessageReceiver,
    stats: &'a ModuleStats,
    quantum: u64,
    /// Messages still deliverable this quantum.
    budget: usize,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(
        messages: &'a mut MessageReceiver,
        stats: &'a ModuleStats,
        quantum: u64,
    ) -> Self {
        let budget = messages.capacity();
        Self {
            messages,
            stats,
            quantum,
            budget,
        }
    }

    /// Pop the oldest pending control message.
    ///
    /// `None` means nothing is pending, which is the common case. Never
    /// blocks or allocates. Drop the message before the quantum ends.
    ///
    /// At most one channel's worth of messages is handed out per quantum;
    /// anything posted beyond that waits for the next one.
    pub fn next(&mut self) -> Option<Message<'_>> {
        if self.budget == 0 {
            return None;
        }
        let message = self.messages.next()?;
        self.budget -= 1;
        self.stats.record_delivered();
        Some(message)
    }

    /// Pop every pending message, handing each to `f`. Returns the count.
    pub fn drain<F: FnMut(&[u8])>(&mut self, mut f: F) -> usize {
        let mut count = 0;
        while let Some(message) = self.next() {
            f(message.data());
            count += 1;
        }
        count
    }

    /// Index of the current quantum, counted from module creation.
    pub fn quantum(&self) -> u64 {
        self.quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_channels() {
        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut output = [0.0; 6];
        let mut block = AudioBlock::new(48000, 3, 2, &input, 2, &mut output).unwrap();

        assert_eq!(block.sample_rate(), 48000);
        assert_eq!(block.frames(), 3);
        assert_eq!(block.input_channel(0), &[1.0, 2.0, 3.0]);
        assert_eq!(block.input_channel(1), &[4.0, 5.0, 6.0]);
        assert!(block.input_channel(2).is_empty());

        block.output_channel_mut(1).fill(9.0);
        assert_eq!(output, [0.0, 0.0, 0.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_block_too_short() {
        let input = [0.0; 4];
        let mut output = [0.0; 8];

        assert_eq!(
            AudioBlock::new(48000, 4, 2, &input, 2, &mut output).err(),
            Some(BlockError::InputTooShort {
                needed: 8,
                actual: 4
            })
        );
        assert_eq!(
            AudioBlock::new(48000, 4, 1, &input, 3, &mut output).err(),
            Some(BlockError::OutputTooShort {
                needed: 12,
                actual: 8
            })
        );
    }

    #[test]
    fn test_copy_input_to_output() {
        let input = [1.0, 2.0];
        let mut output = [7.0; 4];
        let mut block = AudioBlock::new(44100, 2, 1, &input, 2, &mut output).unwrap();

        block.copy_input_to_output();
        assert_eq!(output, [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_no_input_channels() {
        let mut output = [3.0; 4];
        let mut block = AudioBlock::new(44100, 4, 0, &[], 1, &mut output).unwrap();

        assert!(block.input().is_empty());
        block.silence();
        assert_eq!(output, [0.0; 4]);
    }
}

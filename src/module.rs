// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A module instance: one callback slot plus one message channel.
//!
//! Creating a module yields two halves:
//!
//! ```text
//!   control threads                      audio thread
//!  ┌───────────────┐   CallbackSlot    ┌────────────────┐
//!  │ ModuleControl │ ───────────────►  │ RealtimeModule │ ──► AudioProcessor
//!  │  (Clone)      │   MessageChannel  │  (one owner)   │
//!  └───────────────┘ ───────────────►  └────────────────┘
//! ```
//!
//! The host owns the audio thread and calls [`RealtimeModule::process`] once
//! per quantum; this crate never spawns threads.

use crate::config::ChannelConfig;
use crate::error::PostError;
use crate::process::{AudioBlock, AudioProcessor, ProcessCallback, ProcessFn, ProcessScope};
use crate::realtime::{
    ActiveProcessor, CallbackSlot, MessageChannel, MessageReceiver, MessageSender, SlotReader,
    SlotWriter,
};
use crate::stats::{ModuleStats, StatsSnapshot};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Create the two halves of a module.
///
/// The config is assumed valid; see [`ChannelConfig::validate`].
pub fn new_module(config: &ChannelConfig) -> (ModuleControl, RealtimeModule) {
    let (writer, reader) = CallbackSlot::new().split();
    let (sender, receiver) = MessageChannel::new(config.capacity, config.max_message_size).split();
    let stats = Arc::new(ModuleStats::new());

    (
        ModuleControl {
            writer,
            sender,
            stats: Arc::clone(&stats),
        },
        RealtimeModule {
            reader,
            receiver,
            stats,
            quantum: 0,
        },
    )
}

/// Control-side half of a module. Clone freely across threads.
#[derive(Clone)]
pub struct ModuleControl {
    writer: SlotWriter,
    sender: MessageSender,
    stats: Arc<ModuleStats>,
}

impl ModuleControl {
    /// Install a processor, replacing the current one.
    ///
    /// Returns the new generation number. Never blocks.
    pub fn configure<P: AudioProcessor>(&self, processor: P) -> u64 {
        self.configure_boxed(Box::new(processor))
    }

    /// Install an already boxed processor.
    pub fn configure_boxed(&self, processor: Box<dyn AudioProcessor>) -> u64 {
        let generation = self.writer.install(processor);
        self.stats.record_configure();
        generation
    }

    /// Install a function and its context.
    pub fn configure_fn<C: Send + Sync + 'static>(
        &self,
        process: ProcessFn<C>,
        context: Arc<C>,
    ) -> u64 {
        self.configure(ProcessCallback::new(process, context))
    }

    /// Queue a control message for the processor.
    pub fn post(&self, data: &[u8]) -> Result<(), PostError> {
        match self.sender.post(data) {
            Ok(()) => {
                self.stats.record_posted();
                Ok(())
            }
            Err(err) => {
                match err {
                    PostError::ChannelFull { .. } => self.stats.record_rejected_full(),
                    PostError::MessageTooLarge { .. } => self.stats.record_rejected_too_large(),
                }
                Err(err)
            }
        }
    }

    /// Whether a processor has been installed.
    pub fn is_configured(&self) -> bool {
        self.writer.is_configured()
    }

    /// Generation of the most recent install (0 when unconfigured).
    pub fn generation(&self) -> u64 {
        self.writer.generation()
    }

    /// Free replaced processors the audio thread has moved past.
    pub fn collect(&self) -> usize {
        self.writer.collect()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn max_message_size(&self) -> usize {
        self.sender.max_message_size()
    }

    /// Approximate number of queued messages.
    pub fn pending_messages(&self) -> usize {
        self.sender.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// What happened during one quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantum {
    /// Nothing installed yet; output silenced.
    Unconfigured,
    /// The processor of the given generation ran.
    Processed { generation: u64 },
    /// The processor panicked; output silenced.
    Faulted { generation: u64 },
}

/// Audio-thread half of a module.
///
/// Owned by exactly one thread. The host must stop calling into it before
/// dropping it.
pub struct RealtimeModule {
    reader: SlotReader,
    receiver: MessageReceiver,
    stats: Arc<ModuleStats>,
    quantum: u64,
}

impl RealtimeModule {
    /// Run one full quantum: read the slot, invoke the processor with access
    /// to pending messages, then mark the quantum boundary.
    ///
    /// Never blocks, allocates or frees on the normal path.
    pub fn process(&mut self, block: &mut AudioBlock<'_>) -> Quantum {
        let index = self.quantum;
        self.quantum = self.quantum.wrapping_add(1);

        let Some(mut active) = self.reader.read_active() else {
            block.silence();
            self.stats.record_quantum(false);
            return Quantum::Unconfigured;
        };

        let generation = active.generation();
        let mut scope = ProcessScope::new(&mut self.receiver, &self.stats, index);
        let result = panic::catch_unwind(AssertUnwindSafe(|| active.process(block, &mut scope)));
        drop(scope);
        drop(active);

        // Anything retained past the processor's return goes back now.
        self.receiver.release_held();
        self.stats.record_quantum(true);

        match result {
            Ok(()) => Quantum::Processed { generation },
            Err(_) => {
                block.silence();
                self.stats.record_fault();
                Quantum::Faulted { generation }
            }
        }
    }

    /// Read the active processor directly.
    ///
    /// For hosts that drive the processor themselves; dropping the guard marks
    /// the quantum boundary.
    pub fn read_active(&mut self) -> Option<ActiveProcessor<'_>> {
        self.reader.read_active()
    }

    /// Direct access to the message receiver, for hosts driving the
    /// processor themselves.
    pub fn messages(&mut self) -> &mut MessageReceiver {
        &mut self.receiver
    }

    /// Read the active processor and the receiver together.
    pub fn split_mut(&mut self) -> (Option<ActiveProcessor<'_>>, &mut MessageReceiver) {
        (self.reader.read_active(), &mut self.receiver)
    }

    /// Quanta driven so far.
    pub fn quanta(&self) -> u64 {
        self.quantum
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Patchcord
//!
//! Lets a host audio engine run module processing callbacks on its real-time
//! thread while other threads install those callbacks and send them control
//! messages (MIDI, OSC, anything byte-shaped).
//!
//! Each module owns a callback slot and a message channel. Control threads
//! use [`ModuleControl`] (or a [`ModuleRegistry`] handle); the audio thread
//! owns the matching [`RealtimeModule`] and calls
//! [`process`](RealtimeModule::process) once per buffer.
//!
//! ```ignore
//! use patchcord::*;
//!
//! let registry = ModuleRegistry::new();
//! let (handle, mut rt) = registry.create();
//!
//! registry.configure(handle, |block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>| {
//!     while let Some(message) = scope.next() {
//!         // apply message
//!     }
//!     block.copy_input_to_output();
//! })?;
//! registry.post(handle, b"PING")?;
//!
//! // audio thread
//! let mut block = AudioBlock::new(48000, 256, 2, &input, 2, &mut output)?;
//! rt.process(&mut block);
//! ```

pub mod config;
pub mod error;
pub mod module;
pub mod process;
pub mod realtime;
pub mod registry;
pub mod stats;

pub use config::{ChannelConfig, ConfigError, ConfigManager, HostConfig, SimulationConfig};
pub use error::{BlockError, ModuleError, ModuleResult, PostError};
pub use module::{new_module, ModuleControl, Quantum, RealtimeModule};
pub use process::{AudioBlock, AudioProcessor, ProcessCallback, ProcessFn, ProcessScope};
pub use realtime::Message;
pub use registry::{ModuleHandle, ModuleRegistry};
pub use stats::{ModuleStats, StatsSnapshot};

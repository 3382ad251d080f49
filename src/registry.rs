// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handle-based access to module instances.
//!
//! Hosts that address modules by opaque token (the way a managed-language
//! binding would) go through a [`ModuleRegistry`]. Handles are random UUIDs
//! and never reused, so a released handle stays invalid forever.
//!
//! The registry lock is taken on control threads only. The audio thread holds
//! its [`RealtimeModule`] directly and never looks anything up.

use crate::config::{ChannelConfig, ConfigError};
use crate::error::{ModuleError, ModuleResult};
use crate::module::{new_module, ModuleControl, RealtimeModule};
use crate::process::{AudioProcessor, ProcessFn};
use crate::stats::StatsSnapshot;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque token identifying a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle(Uuid);

impl ModuleHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Rebuild a handle from a UUID previously obtained from [`as_uuid`](Self::as_uuid).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live modules, keyed by handle.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<ModuleHandle, ModuleControl>>,
    default_config: ChannelConfig,
}

impl ModuleRegistry {
    /// Create a registry whose modules use the default channel sizing.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            default_config: ChannelConfig::default(),
        }
    }

    /// Create a registry with a custom default channel sizing.
    pub fn with_config(config: ChannelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            modules: RwLock::new(HashMap::new()),
            default_config: config,
        })
    }

    /// Create a module with the default channel sizing.
    ///
    /// The returned [`RealtimeModule`] belongs to the host's audio thread.
    pub fn create(&self) -> (ModuleHandle, RealtimeModule) {
        self.create_module(&self.default_config)
    }

    /// Create a module with its own channel sizing.
    pub fn create_with(
        &self,
        config: &ChannelConfig,
    ) -> Result<(ModuleHandle, RealtimeModule), ConfigError> {
        config.validate()?;
        Ok(self.create_module(config))
    }

    fn create_module(&self, config: &ChannelConfig) -> (ModuleHandle, RealtimeModule) {
        let handle = ModuleHandle::new();
        let (control, realtime) = new_module(config);
        info!(
            "Created module {} ({} slots, {} byte messages)",
            handle,
            control.capacity(),
            control.max_message_size()
        );
        self.modules.write().insert(handle, control);
        (handle, realtime)
    }

    /// Look up a module's control half.
    ///
    /// Holding on to the returned value lets a busy producer skip the lookup.
    /// It keeps working after release, but the audio thread will no longer
    /// be reading.
    pub fn control(&self, handle: ModuleHandle) -> ModuleResult<ModuleControl> {
        self.modules
            .read()
            .get(&handle)
            .cloned()
            .ok_or(ModuleError::InvalidHandle(handle))
    }

    /// Install a processor on a module.
    pub fn configure<P: AudioProcessor>(
        &self,
        handle: ModuleHandle,
        processor: P,
    ) -> ModuleResult<u64> {
        let control = self.control(handle)?;
        let generation = control.configure(processor);
        debug!("Module {} configured (generation {})", handle, generation);
        Ok(generation)
    }

    /// Install a function and its context on a module.
    pub fn configure_fn<C: Send + Sync + 'static>(
        &self,
        handle: ModuleHandle,
        process: ProcessFn<C>,
        context: Arc<C>,
    ) -> ModuleResult<u64> {
        let control = self.control(handle)?;
        let generation = control.configure_fn(process, context);
        debug!("Module {} configured (generation {})", handle, generation);
        Ok(generation)
    }

    /// Queue a control message for a module.
    pub fn post(&self, handle: ModuleHandle, data: &[u8]) -> ModuleResult<()> {
        let control = self.control(handle)?;
        control.post(data).map_err(|err| {
            debug!("Post to module {} rejected: {}", handle, err);
            ModuleError::from(err)
        })
    }

    /// Forget a module. Its handle is invalid from now on.
    ///
    /// The host must have stopped the audio thread's use of the matching
    /// [`RealtimeModule`] before dropping it.
    pub fn release(&self, handle: ModuleHandle) -> ModuleResult<()> {
        let control = self
            .modules
            .write()
            .remove(&handle)
            .ok_or(ModuleError::InvalidHandle(handle))?;

        let pending = control.pending_messages();
        if pending > 0 {
            warn!(
                "Released module {} with {} undelivered messages",
                handle, pending
            );
        } else {
            info!("Released module {}", handle);
        }
        Ok(())
    }

    /// Counters for a module.
    pub fn stats(&self, handle: ModuleHandle) -> ModuleResult<StatsSnapshot> {
        Ok(self.control(handle)?.stats())
    }

    pub fn contains(&self, handle: ModuleHandle) -> bool {
        self.modules.read().contains_key(&handle)
    }

    /// Number of live modules.
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

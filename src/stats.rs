// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-module counters.
//!
//! The audio thread can't log, so it reports through relaxed atomic counters
//! that control threads read back as a [`StatsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ModuleStats {
    configures: AtomicU64,
    posted: AtomicU64,
    rejected_full: AtomicU64,
    rejected_too_large: AtomicU64,
    delivered: AtomicU64,
    quanta: AtomicU64,
    unconfigured_quanta: AtomicU64,
    faults: AtomicU64,
}

impl ModuleStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_configure(&self) {
        Self::bump(&self.configures);
    }

    pub(crate) fn record_posted(&self) {
        Self::bump(&self.posted);
    }

    pub(crate) fn record_rejected_full(&self) {
        Self::bump(&self.rejected_full);
    }

    pub(crate) fn record_rejected_too_large(&self) {
        Self::bump(&self.rejected_too_large);
    }

    #[inline]
    pub(crate) fn record_delivered(&self) {
        Self::bump(&self.delivered);
    }

    #[inline]
    pub(crate) fn record_quantum(&self, configured: bool) {
        Self::bump(&self.quanta);
        if !configured {
            Self::bump(&self.unconfigured_quanta);
        }
    }

    pub(crate) fn record_fault(&self) {
        Self::bump(&self.faults);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            configures: self.configures.load(Ordering::Relaxed),
            posted: self.posted.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            rejected_too_large: self.rejected_too_large.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            quanta: self.quanta.load(Ordering::Relaxed),
            unconfigured_quanta: self.unconfigured_quanta.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a module's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Successful `configure` calls.
    pub configures: u64,
    /// Messages accepted by `post`.
    pub posted: u64,
    /// Posts rejected because the channel was full.
    pub rejected_full: u64,
    /// Posts rejected for exceeding the size limit.
    pub rejected_too_large: u64,
    /// Messages handed to the processor.
    pub delivered: u64,
    /// Quanta driven by the host.
    pub quanta: u64,
    /// Quanta that ran before anything was configured.
    pub unconfigured_quanta: u64,
    /// Quanta whose processor panicked.
    pub faults: u64,
}

impl StatsSnapshot {
    /// Total rejected posts.
    pub fn rejected(&self) -> u64 {
        self.rejected_full + self.rejected_too_large
    }
}

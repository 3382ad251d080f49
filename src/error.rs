// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types for the control path.
//!
//! Errors are only ever returned to non-real-time callers. The audio thread
//! never sees one: an empty channel or an unconfigured slot is a normal `None`.

use crate::registry::ModuleHandle;
use thiserror::Error;

/// Errors returned by module control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The handle does not name a live module (never created, or released).
    #[error("invalid module handle: {0}")]
    InvalidHandle(ModuleHandle),

    /// Every message slot is occupied. Transient; the caller may retry or drop.
    #[error("message channel full ({capacity} slots)")]
    ChannelFull {
        /// Number of slots in the channel.
        capacity: usize,
    },

    /// The message does not fit in a channel slot.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured maximum message size.
        max: usize,
    },
}

/// Errors returned by [`MessageSender::post`](crate::realtime::MessageSender::post).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("message channel full ({capacity} slots)")]
    ChannelFull { capacity: usize },
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<PostError> for ModuleError {
    fn from(err: PostError) -> Self {
        match err {
            PostError::ChannelFull { capacity } => ModuleError::ChannelFull { capacity },
            PostError::MessageTooLarge { size, max } => ModuleError::MessageTooLarge { size, max },
        }
    }
}

/// Host buffers that don't match the declared block shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("input buffer holds {actual} samples, {needed} needed")]
    InputTooShort { needed: usize, actual: usize },
    #[error("output buffer holds {actual} samples, {needed} needed")]
    OutputTooShort { needed: usize, actual: usize },
}

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time safe primitives shared between control threads and the audio
//! thread.
//!
//! # Real-Time Safety
//!
//! The audio thread has strict requirements:
//! - No memory allocation
//! - No locks (mutexes, RwLocks)
//! - No system calls (file I/O, network)
//! - Bounded execution time
//!
//! Every reader-side operation here (`read_active`, `next`) meets them.
//! Writer-side operations may allocate or lock, but never anything the
//! audio thread waits on.

pub mod callback_slot;
pub mod message_channel;

pub use callback_slot::{ActiveProcessor, CallbackSlot, SlotReader, SlotWriter};
pub use message_channel::{Message, MessageChannel, MessageReceiver, MessageSender};

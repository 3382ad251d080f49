// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bounded multi-producer single-consumer channel for control messages.
//!
//! Control threads post opaque byte messages (MIDI, OSC, anything the module
//! understands); the audio thread drains them at the start of each quantum.
//!
//! # Example
//!
//! ```ignore
//! use patchcord::realtime::MessageChannel;
//!
//! let (sender, mut receiver) = MessageChannel::new(64, 256).split();
//!
//! // Any control thread
//! sender.post(&[0xB0, 7, 100])?;
//!
//! // Audio thread
//! while let Some(message) = receiver.next() {
//!     apply_midi(message.data());
//! }
//! ```
//!
//! # Layout
//!
//! Storage is a preallocated ring of fixed-size slots, twice as many as the
//! advertised capacity. Every slot carries a sequence stamp:
//!
//! - `pos` when the slot is free for the producer that claims position `pos`
//! - `pos + 1` once the message written at `pos` is complete
//! - `pos + slots` once the consumer has released it
//!
//! Producers claim positions with a CAS on the tail index, copy the payload
//! and then publish the stamp. The consumer only reads a slot whose stamp says
//! it is complete, so a message is either fully visible or not visible at all.
//!
//! Fullness is `tail - head >= capacity`, with `head` advanced when a message
//! is popped. The message the consumer is still reading sits in one of the
//! spare slots and never counts against capacity.

use crate::error::PostError;
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A single message slot.
struct Slot {
    /// Sequence stamp (see module docs).
    stamp: AtomicUsize,
    /// Length of the message currently stored.
    len: UnsafeCell<usize>,
    /// Fixed-size payload storage, `max_message_size` bytes.
    data: UnsafeCell<Box<[u8]>>,
}

/// Shared state behind the sender and receiver handles.
pub struct MessageChannel {
    slots: Box<[Slot]>,
    /// Next position to be claimed by a producer.
    tail: CachePadded<AtomicUsize>,
    /// Next position to be popped by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Messages that may be queued at once (power of 2).
    capacity: usize,
    /// Mask for efficient modulo operation over `slots`.
    mask: usize,
    /// Largest payload a slot can hold.
    max_message_size: usize,
}

// SAFETY: a slot's `len` and `data` are written only by the producer that won
// the CAS for its position while the stamp marks it free, and read only by the
// single consumer after the stamp marks it complete. The stamp's
// release/acquire pair orders those accesses.
unsafe impl Send for MessageChannel {}
unsafe impl Sync for MessageChannel {}

impl MessageChannel {
    /// Create a channel with room for `capacity` messages of up to
    /// `max_message_size` bytes each.
    ///
    /// The capacity is rounded up to the next power of 2, with a minimum of 2.
    /// All storage is allocated here; nothing is allocated afterwards.
    pub fn new(capacity: usize, max_message_size: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slot_count = capacity * 2;
        let mask = slot_count - 1;

        let slots = (0..slot_count)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                len: UnsafeCell::new(0),
                data: UnsafeCell::new(vec![0u8; max_message_size].into_boxed_slice()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            capacity,
            mask,
            max_message_size,
        }
    }

    /// Number of message slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest accepted message, in bytes.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Split into a cloneable sender and the single receiver.
    pub fn split(self) -> (MessageSender, MessageReceiver) {
        let shared = Arc::new(self);
        (
            MessageSender {
                inner: Arc::clone(&shared),
            },
            MessageReceiver {
                inner: shared,
                head: 0,
                held: None,
            },
        )
    }

    /// Approximate number of messages claimed but not yet read.
    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity)
    }

    fn push(&self, data: &[u8]) -> Result<(), PostError> {
        if data.len() > self.max_message_size {
            return Err(PostError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }

        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let head = self.head.load(Ordering::Acquire);
            let queued = tail.wrapping_sub(head) as isize;
            if queued < 0 {
                // Stale tail; the consumer already moved past it.
                backoff.spin();
                tail = self.tail.load(Ordering::Relaxed);
                continue;
            }
            if queued as usize >= self.capacity {
                return Err(PostError::ChannelFull {
                    capacity: self.capacity,
                });
            }

            let slot = &self.slots[tail & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp.wrapping_sub(tail) as isize;

            if lag == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS while the stamp equals `tail`
                        // gives this producer exclusive access to the slot.
                        unsafe {
                            let storage = &mut *slot.data.get();
                            storage[..data.len()].copy_from_slice(data);
                            *slot.len.get() = data.len();
                        }
                        slot.stamp.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if lag < 0 {
                // Slot from the previous lap not yet released.
                return Err(PostError::ChannelFull {
                    capacity: self.capacity,
                });
            } else {
                // Another producer claimed this position; catch up.
                backoff.snooze();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Hand the slot at `pos` back to producers.
    fn release(&self, pos: usize) {
        self.slots[pos & self.mask]
            .stamp
            .store(pos.wrapping_add(self.slots.len()), Ordering::Release);
    }
}

/// Producer handle. Cheap to clone; any number of threads may post at once.
#[derive(Clone)]
pub struct MessageSender {
    inner: Arc<MessageChannel>,
}

impl MessageSender {
    /// Copy `data` into the channel and make it visible to the consumer.
    ///
    /// Never blocks waiting for the consumer. A full channel rejects the new
    /// message with [`PostError::ChannelFull`]; queued messages are untouched.
    pub fn post(&self, data: &[u8]) -> Result<(), PostError> {
        self.inner.push(data)
    }

    /// Number of message slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Largest accepted message, in bytes.
    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    /// Approximate number of pending messages.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if no messages are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer handle, owned by the audio thread.
///
/// Only one receiver exists per channel.
pub struct MessageReceiver {
    inner: Arc<MessageChannel>,
    /// Next position to read (only modified here).
    head: usize,
    /// Position handed out but not yet returned to producers.
    held: Option<usize>,
}

impl MessageReceiver {
    /// Pop the oldest pending message.
    ///
    /// Returns `None` when nothing is pending. Never blocks, allocates or
    /// frees. The message leaves the queue immediately, so its room is
    /// available to producers while it is still being read. Its storage goes
    /// back when the message is dropped.
    pub fn next(&mut self) -> Option<Message<'_>> {
        self.release_held();

        let pos = self.head;
        let slot = &self.inner.slots[pos & self.inner.mask];
        if slot.stamp.load(Ordering::Acquire) != pos.wrapping_add(1) {
            return None;
        }

        // SAFETY: the stamp says the producer finished writing this slot, and
        // it stays ours until released.
        let len = unsafe { *slot.len.get() };

        self.head = pos.wrapping_add(1);
        self.inner.head.store(self.head, Ordering::Release);
        self.held = Some(pos);

        Some(Message {
            receiver: self,
            pos,
            len,
        })
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

    /// Return a retained slot to producers.
    ///
    /// Only needed after [`Message::retain`]; dropped messages release
    /// themselves.
    pub fn release_held(&mut self) {
        if let Some(pos) = self.held.take() {
            self.inner.release(pos);
        }
    }

    /// Number of message slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Approximate number of pending messages.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if no messages are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MessageReceiver {
    fn drop(&mut self) {
        self.release_held();
    }
}

/// A message borrowed from the channel's storage.
pub struct Message<'a> {
    receiver: &'a mut MessageReceiver,
    pos: usize,
    len: usize,
}

impl<'a> Message<'a> {
    /// Message payload.
    pub fn data(&self) -> &[u8] {
        let slot = &self.receiver.inner.slots[self.pos & self.receiver.inner.mask];
        // SAFETY: the slot is held by the receiver until this message is
        // dropped or retained.
        unsafe { &(&*slot.data.get())[..self.len] }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check for a zero-length message.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keep the slot after this guard goes away and return a raw view of it.
    ///
    /// The pointer stays valid until the receiver's next call to
    /// [`MessageReceiver::next`] or [`MessageReceiver::release_held`]. Used by
    /// the C ABI, whose callers iterate with a message out-parameter.
    pub fn retain(self) -> (*const u8, usize) {
        let raw = (self.data().as_ptr(), self.len);
        mem::forget(self);
        raw
    }
}

impl Deref for Message<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for Message<'_> {
    fn drop(&mut self) {
        self.receiver.release_held();
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("pos", &self.pos)
            .field("data", &self.data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_post_next() {
        let (sender, mut receiver) = MessageChannel::new(4, 16).split();

        assert!(receiver.is_empty());

        sender.post(b"one").unwrap();
        sender.post(b"two").unwrap();
        sender.post(b"three").unwrap();

        assert_eq!(receiver.len(), 3);
        assert_eq!(receiver.next().unwrap().data(), b"one");
        assert_eq!(receiver.next().unwrap().data(), b"two");
        assert_eq!(receiver.next().unwrap().data(), b"three");
        assert!(receiver.next().is_none());
    }

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(MessageChannel::new(5, 8).capacity(), 8);
        assert_eq!(MessageChannel::new(64, 8).capacity(), 64);
        assert_eq!(MessageChannel::new(1, 8).capacity(), 2);
        assert_eq!(MessageChannel::new(0, 8).capacity(), 2);
    }

    #[test]
    fn test_full_rejects_new() {
        let (sender, mut receiver) = MessageChannel::new(2, 8).split();

        sender.post(b"a").unwrap();
        sender.post(b"b").unwrap();

        assert_eq!(
            sender.post(b"c"),
            Err(PostError::ChannelFull { capacity: 2 })
        );

        // Queued messages survive the rejected post
        assert_eq!(receiver.next().unwrap().data(), b"a");
        assert_eq!(receiver.next().unwrap().data(), b"b");
        assert!(receiver.next().is_none());
    }

    #[test]
    fn test_too_large() {
        let (sender, mut receiver) = MessageChannel::new(4, 4).split();

        assert_eq!(
            sender.post(b"12345"),
            Err(PostError::MessageTooLarge { size: 5, max: 4 })
        );
        sender.post(b"1234").unwrap();
        assert_eq!(receiver.next().unwrap().data(), b"1234");
    }

    #[test]
    fn test_empty_message() {
        let (sender, mut receiver) = MessageChannel::new(4, 4).split();

        sender.post(&[]).unwrap();

        let message = receiver.next().unwrap();
        assert!(message.is_empty());
        assert_eq!(message.len(), 0);
    }

    #[test]
    fn test_slot_reuse_keeps_lengths() {
        let (sender, mut receiver) = MessageChannel::new(2, 8).split();

        for lap in 0..10u8 {
            let long = [lap; 8];
            let short = [lap; 1];
            sender.post(&long).unwrap();
            sender.post(&short).unwrap();
            assert_eq!(receiver.next().unwrap().data(), &long);
            assert_eq!(receiver.next().unwrap().data(), &short);
        }
    }

    #[test]
    fn test_popped_message_frees_room() {
        let (sender, mut receiver) = MessageChannel::new(2, 8).split();

        sender.post(b"a").unwrap();
        sender.post(b"b").unwrap();
        assert!(sender.post(b"x").is_err());

        let message = receiver.next().unwrap();
        // Still reading "a", yet a new post fits
        sender.post(b"c").unwrap();
        assert_eq!(
            sender.post(b"d"),
            Err(PostError::ChannelFull { capacity: 2 })
        );
        assert_eq!(message.data(), b"a");
        drop(message);

        assert_eq!(receiver.next().unwrap().data(), b"b");
        assert_eq!(receiver.next().unwrap().data(), b"c");
        assert!(receiver.next().is_none());
    }

    #[test]
    fn test_retained_message_stays_readable() {
        let (sender, mut receiver) = MessageChannel::new(2, 8).split();

        sender.post(b"abc").unwrap();
        sender.post(b"b").unwrap();

        let (ptr, len) = receiver.next().unwrap().retain();
        assert_eq!(len, 3);
        sender.post(b"c").unwrap();

        // SAFETY: the receiver has not moved on, so the slot is still held.
        let data = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(data, b"abc");

        receiver.release_held();
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn test_wraps_many_laps_with_held_messages() {
        let (sender, mut receiver) = MessageChannel::new(4, 4).split();

        for n in 0..100u32 {
            while sender.post(&n.to_le_bytes()).is_ok() {}
            let message = receiver.next().unwrap();
            let (_, len) = message.retain();
            assert_eq!(len, 4);
            // Room for exactly one more while the retained slot is held
            sender.post(&[0; 4]).unwrap();
            assert!(sender.post(&[0; 4]).is_err());
            receiver.drain(|_| {});
        }
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_drain() {
        let (sender, mut receiver) = MessageChannel::new(8, 8).split();

        sender.post(b"x").unwrap();
        sender.post(b"yy").unwrap();

        let mut total = 0;
        let count = receiver.drain(|data| total += data.len());
        assert_eq!(count, 2);
        assert_eq!(total, 3);
        assert!(receiver.is_empty());
    }
}

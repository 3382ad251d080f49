// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wait-free handoff of the active processor to the audio thread.
//!
//! The processor and everything it needs (its context) travel as one boxed
//! value behind a single atomic pointer, so the audio thread sees either the
//! old installation or the new one, never a mix.
//!
//! # Reclamation
//!
//! Replaced installations are not freed right away: the audio thread may
//! still be running them. Each replacement is stamped with the number of
//! quanta the reader had completed at that moment, and is freed by a control
//! thread once the reader has completed more. The audio thread itself never
//! frees anything.
//!
//! Replaced installations go onto a lock-free stack. Installs free what they
//! can only if no other reclamation pass is running, so an install never
//! waits on another thread.
//!
//! ```ignore
//! let (writer, mut reader) = CallbackSlot::new().split();
//!
//! // Control thread
//! writer.install(Box::new(my_processor));
//!
//! // Audio thread, once per quantum
//! if let Some(mut active) = reader.read_active() {
//!     active.process(&mut block, &mut scope);
//! } // quantum boundary marked here
//! ```

use crate::process::{AudioBlock, AudioProcessor, ProcessScope};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A published processor.
struct Installed {
    /// Only ever dereferenced mutably by the single reader.
    processor: UnsafeCell<Box<dyn AudioProcessor>>,
    /// Sequence number of the install that produced this value.
    generation: u64,
}

/// An installation waiting for the reader to move past it.
struct Retired {
    installed: *mut Installed,
    /// Completed-quanta count observed right after it was unpublished.
    epoch: u64,
    next: *mut Retired,
}

/// Shared state behind the writer and reader handles.
pub struct CallbackSlot {
    active: AtomicPtr<Installed>,
    /// Quanta completed by the reader.
    completed: CachePadded<AtomicU64>,
    /// Stack of replaced installations. Control-side only.
    retired: AtomicPtr<Retired>,
    retired_len: AtomicUsize,
    /// Held for the duration of a reclamation pass. Installs only try it.
    reclaiming: Mutex<()>,
    generations: AtomicU64,
}

// SAFETY: `Installed` values are created and freed by control threads and
// used mutably only by the single reader between its acquire and the next
// quantum boundary. Processors are `Send`, so freeing them on another thread
// is allowed.
unsafe impl Send for CallbackSlot {}
unsafe impl Sync for CallbackSlot {}

impl CallbackSlot {
    /// Create an unconfigured slot.
    pub fn new() -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            completed: CachePadded::new(AtomicU64::new(0)),
            retired: AtomicPtr::new(ptr::null_mut()),
            retired_len: AtomicUsize::new(0),
            reclaiming: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    /// Split into a cloneable writer and the single reader.
    pub fn split(self) -> (SlotWriter, SlotReader) {
        let shared = Arc::new(self);
        (
            SlotWriter {
                inner: Arc::clone(&shared),
            },
            SlotReader { inner: shared },
        )
    }

    fn publish(&self, processor: Box<dyn AudioProcessor>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let installed = Box::into_raw(Box::new(Installed {
            processor: UnsafeCell::new(processor),
            generation,
        }));

        // SeqCst pairs with the reader's load of `active` and its increment
        // of `completed`: if the epoch read below already counts a quantum,
        // every later quantum loads the new pointer.
        let previous = self.active.swap(installed, Ordering::SeqCst);
        let epoch = self.completed.load(Ordering::SeqCst);

        if !previous.is_null() {
            self.retire(previous, epoch);
        }
        if let Some(_pass) = self.reclaiming.try_lock() {
            self.reclaim(epoch);
        }

        generation
    }

    fn retire(&self, installed: *mut Installed, epoch: u64) {
        let node = Box::into_raw(Box::new(Retired {
            installed,
            epoch,
            next: ptr::null_mut(),
        }));
        self.retired_len.fetch_add(1, Ordering::Relaxed);
        self.push_retired(node, node);
    }

    /// Push the chain `first..=last` onto the retired stack.
    fn push_retired(&self, first: *mut Retired, last: *mut Retired) {
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            // SAFETY: the chain belongs to this thread until the CAS succeeds.
            unsafe { (*last).next = head };
            match self.retired.compare_exchange_weak(
                head,
                first,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Free every retired installation the reader has moved past.
    ///
    /// The caller holds `reclaiming`.
    fn reclaim(&self, completed: u64) -> usize {
        let mut node = self.retired.swap(ptr::null_mut(), Ordering::Acquire);
        let mut kept_first: *mut Retired = ptr::null_mut();
        let mut kept_last: *mut Retired = ptr::null_mut();
        let mut freed = 0;

        while !node.is_null() {
            // SAFETY: the swap above took the whole chain off the stack, so
            // this pass owns every node on it.
            let mut entry = unsafe { Box::from_raw(node) };
            node = entry.next;

            if completed > entry.epoch {
                // SAFETY: the reader finished a quantum after this entry was
                // unpublished, so it no longer holds a reference.
                drop(unsafe { Box::from_raw(entry.installed) });
                freed += 1;
            } else {
                entry.next = ptr::null_mut();
                let kept = Box::into_raw(entry);
                if kept_last.is_null() {
                    kept_first = kept;
                } else {
                    // SAFETY: `kept_last` is a node this pass still owns.
                    unsafe { (*kept_last).next = kept };
                }
                kept_last = kept;
            }
        }

        if !kept_first.is_null() {
            self.push_retired(kept_first, kept_last);
        }
        self.retired_len.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}

impl Default for CallbackSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        let active = *self.active.get_mut();
        if !active.is_null() {
            // SAFETY: both handles are gone, nothing can read it anymore.
            drop(unsafe { Box::from_raw(active) });
        }
        let mut node = *self.retired.get_mut();
        while !node.is_null() {
            // SAFETY: as above.
            let entry = unsafe { Box::from_raw(node) };
            node = entry.next;
            drop(unsafe { Box::from_raw(entry.installed) });
        }
    }
}

/// Control-side handle. Any number of threads may install concurrently.
#[derive(Clone)]
pub struct SlotWriter {
    inner: Arc<CallbackSlot>,
}

impl SlotWriter {
    /// Publish a new processor, replacing the current one.
    ///
    /// Returns the generation number of the new installation. Never waits for
    /// the audio thread or for other installers.
    ///
    /// The replaced processor is freed by a later install or [`collect`]
    /// once the audio thread has finished a quantum. While the audio thread
    /// is not running quanta, replaced processors accumulate; they are freed
    /// when it resumes or when the slot is dropped.
    ///
    /// [`collect`]: Self::collect
    pub fn install(&self, processor: Box<dyn AudioProcessor>) -> u64 {
        self.inner.publish(processor)
    }

    /// Check whether anything has been installed yet.
    pub fn is_configured(&self) -> bool {
        !self.inner.active.load(Ordering::Acquire).is_null()
    }

    /// Generation of the most recent install (0 when unconfigured).
    pub fn generation(&self) -> u64 {
        self.inner.generations.load(Ordering::Relaxed)
    }

    /// Free replaced processors the audio thread has moved past.
    ///
    /// Installs do this on their own; hosts that rarely reconfigure can call
    /// it from a housekeeping thread. Returns how many were freed.
    pub fn collect(&self) -> usize {
        let _pass = self.inner.reclaiming.lock();
        let completed = self.inner.completed.load(Ordering::SeqCst);
        self.inner.reclaim(completed)
    }

    /// Number of replaced processors still awaiting reclamation.
    pub fn pending_reclaim(&self) -> usize {
        self.inner.retired_len.load(Ordering::Relaxed)
    }
}

/// Audio-thread handle. Only one reader exists per slot.
pub struct SlotReader {
    inner: Arc<CallbackSlot>,
}

impl SlotReader {
    /// Read the active processor for this quantum.
    ///
    /// Returns `None` until something is installed. Dropping the returned
    /// guard marks the quantum boundary; call this at most once per quantum.
    pub fn read_active(&mut self) -> Option<ActiveProcessor<'_>> {
        let installed = self.inner.active.load(Ordering::SeqCst);
        if installed.is_null() {
            return None;
        }

        Some(ActiveProcessor {
            slot: &self.inner,
            // SAFETY: non-null published pointers stay allocated until the
            // reader completes a quantum after they are replaced, which
            // cannot happen while this guard borrows the reader.
            installed: unsafe { &*installed },
        })
    }

    /// Number of quanta completed so far.
    pub fn completed_quanta(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }
}

/// The processor installed for the current quantum.
pub struct ActiveProcessor<'a> {
    slot: &'a CallbackSlot,
    installed: &'a Installed,
}

impl ActiveProcessor<'_> {
    /// Generation number of this installation.
    pub fn generation(&self) -> u64 {
        self.installed.generation
    }

    /// Mutable access to the processor.
    pub fn processor_mut(&mut self) -> &mut dyn AudioProcessor {
        // SAFETY: only the single reader reaches this, through `&mut self`.
        unsafe { &mut **self.installed.processor.get() }
    }

    /// Run the processor on one block.
    #[inline]
    pub fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
        self.processor_mut().process(block, scope);
    }
}

impl Drop for ActiveProcessor<'_> {
    fn drop(&mut self) {
        self.slot.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tagged {
        tag: u32,
        drops: Arc<AtomicUsize>,
    }

    impl AudioProcessor for Tagged {
        fn process(&mut self, block: &mut AudioBlock<'_>, _scope: &mut ProcessScope<'_>) {
            block.output_mut().fill(self.tag as f32);
        }
    }

    impl Drop for Tagged {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tagged(tag: u32, drops: &Arc<AtomicUsize>) -> Box<dyn AudioProcessor> {
        Box::new(Tagged {
            tag,
            drops: Arc::clone(drops),
        })
    }

    #[test]
    fn test_unconfigured() {
        let (writer, mut reader) = CallbackSlot::new().split();

        assert!(!writer.is_configured());
        assert_eq!(writer.generation(), 0);
        assert!(reader.read_active().is_none());
    }

    #[test]
    fn test_install_and_replace() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, mut reader) = CallbackSlot::new().split();

        assert_eq!(writer.install(tagged(1, &drops)), 1);
        assert!(writer.is_configured());
        assert_eq!(reader.read_active().unwrap().generation(), 1);

        assert_eq!(writer.install(tagged(2, &drops)), 2);
        assert_eq!(reader.read_active().unwrap().generation(), 2);
    }

    #[test]
    fn test_reclaim_waits_for_quantum() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, mut reader) = CallbackSlot::new().split();

        writer.install(tagged(1, &drops));

        {
            let active = reader.read_active().unwrap();
            assert_eq!(active.generation(), 1);

            // Replaced while the reader is mid-quantum: must not be freed
            writer.install(tagged(2, &drops));
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            assert_eq!(writer.pending_reclaim(), 1);
        }

        // Quantum finished
        assert_eq!(writer.collect(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(writer.pending_reclaim(), 0);
    }

    #[test]
    fn test_drop_frees_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, reader) = CallbackSlot::new().split();

        writer.install(tagged(1, &drops));
        writer.install(tagged(2, &drops));
        writer.install(tagged(3, &drops));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(writer);
        drop(reader);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_install_does_not_wait_for_reclaim() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, mut reader) = CallbackSlot::new().split();
        writer.install(tagged(1, &drops));
        drop(reader.read_active());

        {
            // Another thread is mid-reclamation
            let _busy = writer.inner.reclaiming.lock();
            for tag in 2..=4 {
                writer.install(tagged(tag, &drops));
            }
            assert_eq!(writer.pending_reclaim(), 3);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }

        drop(reader.read_active());
        assert_eq!(writer.collect(), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(writer.pending_reclaim(), 0);
    }

    #[test]
    fn test_replaced_accumulate_while_reader_idle() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, mut reader) = CallbackSlot::new().split();

        for tag in 0..10 {
            writer.install(tagged(tag, &drops));
        }
        assert_eq!(writer.pending_reclaim(), 9);
        assert_eq!(writer.collect(), 0);

        // One quantum lets the next install free everything it replaced
        drop(reader.read_active());
        writer.install(tagged(10, &drops));
        assert_eq!(drops.load(Ordering::SeqCst), 9);
        assert_eq!(writer.pending_reclaim(), 1);
    }

    #[test]
    fn test_completed_quanta() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (writer, mut reader) = CallbackSlot::new().split();

        writer.install(tagged(1, &drops));
        for _ in 0..5 {
            let _active = reader.read_active();
        }
        assert_eq!(reader.completed_quanta(), 5);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! C ABI for patchcord modules.
//!
//! Module side (what a native processing library sees):
//!
//! ```c
//! typedef void (*audio_module_process_t)
//!     (void *context, int sample_rate, int buffer_frames,
//!      int input_channels, const float *input_buffer,
//!      int output_channels, float *output_buffer);
//!
//! void am_configure(void *handle, audio_module_process_t process, void *context);
//!
//! typedef struct { int32_t size; char *data; } am_message;
//! int am_next_message(void *handle, am_message *message);
//! ```
//!
//! Host side: `am_module_create`, `am_post_message`, `am_module_process`
//! and `am_module_release`.
//!
//! Typical call pattern inside a process callback:
//!
//! ```c
//! am_message message = { 0, NULL };
//! while (!am_next_message(handle, &message)) {
//!     // handle message.data[0 .. message.size]
//! }
//! ```

use parking_lot::{const_mutex, Mutex};
use patchcord::{
    new_module, AudioBlock, AudioProcessor, ChannelConfig, ModuleControl, PostError,
    ProcessScope, Quantum, RealtimeModule,
};
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::{debug, warn};

// Return codes
pub const AM_OK: c_int = 0;
/// `am_next_message`: nothing pending. `am_module_process`: no processor
/// installed, output silenced.
pub const AM_EMPTY: c_int = 1;
/// `am_module_process`: the processor panicked, output silenced.
pub const AM_FAULTED: c_int = 2;

pub const AM_ERR_INVALID_HANDLE: c_int = -1;
pub const AM_ERR_CHANNEL_FULL: c_int = -2;
pub const AM_ERR_MESSAGE_TOO_LARGE: c_int = -3;
pub const AM_ERR_INVALID_ARGUMENT: c_int = -4;
/// `am_next_message` called outside a process callback.
pub const AM_ERR_NOT_PROCESSING: c_int = -5;

/// Native processing callback.
pub type AudioModuleProcess = Option<
    unsafe extern "C" fn(
        context: *mut c_void,
        sample_rate: c_int,
        buffer_frames: c_int,
        input_channels: c_int,
        input_buffer: *const f32,
        output_channels: c_int,
        output_buffer: *mut f32,
    ),
>;

/// Control message view handed to native code.
#[repr(C)]
#[derive(Debug)]
pub struct AmMessage {
    pub size: i32,
    pub data: *mut c_char,
}

/// A module as seen through the C ABI.
///
/// Releasing a module drops its state but keeps this small allocation, so a
/// released handle's address is never handed out again and stays invalid.
pub struct AmModule {
    /// `None` once released.
    state: UnsafeCell<Option<Box<ModuleState>>>,
    /// Scope of the quantum in progress, null outside `am_module_process`.
    scope: AtomicPtr<c_void>,
}

struct ModuleState {
    control: ModuleControl,
    /// Only touched by the thread calling `am_module_process`.
    realtime: UnsafeCell<RealtimeModule>,
}

impl AmModule {
    /// # Safety
    ///
    /// Must not race with `am_module_release` on the same module.
    unsafe fn state(&self) -> Option<&ModuleState> {
        (*self.state.get()).as_deref()
    }
}

/// Addresses of modules that have been created and not yet released.
static LIVE: Mutex<Vec<usize>> = const_mutex(Vec::new());

/// Run `f` on a live module, holding the table lock so it cannot be
/// released underneath.
fn with_live<R>(handle: *mut AmModule, f: impl FnOnce(&ModuleState) -> R) -> Option<R> {
    let live = LIVE.lock();
    if handle.is_null() || !live.contains(&(handle as usize)) {
        return None;
    }
    // SAFETY: module allocations are never freed, and release takes this
    // lock before dropping the state.
    let state = unsafe { (*handle).state() }?;
    Some(f(state))
}

/// A C function pointer and its context installed as a processor.
struct NativeProcess {
    process: unsafe extern "C" fn(
        *mut c_void,
        c_int,
        c_int,
        c_int,
        *const f32,
        c_int,
        *mut f32,
    ),
    context: *mut c_void,
    module: *const AmModule,
}

// SAFETY: the context belongs to native code, which is told it runs on the
// audio thread. The module outlives every processor installed in it.
unsafe impl Send for NativeProcess {}

impl AudioProcessor for NativeProcess {
    fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
        // SAFETY: processors are owned by the module's slot, which the module
        // owns.
        let module = unsafe { &*self.module };
        module
            .scope
            .store(scope as *mut ProcessScope<'_> as *mut c_void, Ordering::Relaxed);

        let sample_rate = block.sample_rate() as c_int;
        let frames = block.frames() as c_int;
        let input_channels = block.input_channels() as c_int;
        let output_channels = block.output_channels() as c_int;
        let input = block.input().as_ptr();
        let output = block.output_mut().as_mut_ptr();
        // SAFETY: buffers are sized `channels * frames` by `AudioBlock`.
        unsafe {
            (self.process)(
                self.context,
                sample_rate,
                frames,
                input_channels,
                input,
                output_channels,
                output,
            );
        }

        module.scope.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

/// Create a module. Returns null if the sizes are out of range.
#[no_mangle]
pub extern "C" fn am_module_create(capacity: u32, max_message_size: u32) -> *mut AmModule {
    let config = ChannelConfig::new(capacity as usize, max_message_size as usize);
    if let Err(e) = config.validate() {
        warn!("Rejecting module: {}", e);
        return ptr::null_mut();
    }

    let (control, realtime) = new_module(&config);
    let handle = Box::into_raw(Box::new(AmModule {
        state: UnsafeCell::new(Some(Box::new(ModuleState {
            control,
            realtime: UnsafeCell::new(realtime),
        }))),
        scope: AtomicPtr::new(ptr::null_mut()),
    }));
    LIVE.lock().push(handle as usize);
    debug!("Created module {:p}", handle);
    handle
}

/// Install a native process function and its context.
///
/// # Safety
///
/// `context` must stay valid until the processor is replaced or the module is
/// released, and `process` must be safe to call from the audio thread.
/// Unknown and released handles are ignored with a warning.
#[no_mangle]
pub unsafe extern "C" fn am_configure(
    handle: *mut c_void,
    process: AudioModuleProcess,
    context: *mut c_void,
) {
    let module = handle as *mut AmModule;
    let Some(process) = process else {
        warn!("am_configure called without a process function");
        return;
    };

    let installed = with_live(module, |state| {
        state.control.configure(NativeProcess {
            process,
            context,
            module,
        })
    });
    match installed {
        Some(generation) => debug!("Configured module {:p} (generation {})", module, generation),
        None => warn!("am_configure on unknown handle {:p}", module),
    }
}

/// Iterate over pending control messages. Call only from a process callback.
///
/// Returns 0 and fills `message` while messages remain, then [`AM_EMPTY`].
/// The data stays valid until the next call or the end of the quantum.
///
/// # Safety
///
/// `handle` must be the handle passed to `am_configure`, and `message` must
/// point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn am_next_message(handle: *mut c_void, message: *mut AmMessage) -> c_int {
    let module = handle as *const AmModule;
    if module.is_null() || message.is_null() {
        return AM_ERR_INVALID_ARGUMENT;
    }

    let scope = (*module).scope.load(Ordering::Relaxed) as *mut ProcessScope<'static>;
    if scope.is_null() {
        return AM_ERR_NOT_PROCESSING;
    }

    match (*scope).next() {
        Some(next) => {
            let (data, size) = next.retain();
            *message = AmMessage {
                size: size as i32,
                data: data as *mut c_char,
            };
            AM_OK
        }
        None => {
            *message = AmMessage {
                size: 0,
                data: ptr::null_mut(),
            };
            AM_EMPTY
        }
    }
}

/// Queue a control message. Never blocks on the audio thread.
///
/// Returns [`AM_ERR_INVALID_HANDLE`] for unknown and released handles.
///
/// # Safety
///
/// `data` must point to `size` readable bytes (or be null with `size == 0`).
#[no_mangle]
pub unsafe extern "C" fn am_post_message(
    handle: *mut AmModule,
    data: *const c_char,
    size: i32,
) -> c_int {
    let Ok(size) = usize::try_from(size) else {
        return AM_ERR_INVALID_ARGUMENT;
    };
    if data.is_null() && size > 0 {
        return AM_ERR_INVALID_ARGUMENT;
    }
    let bytes: &[u8] = if size == 0 {
        &[]
    } else {
        slice::from_raw_parts(data as *const u8, size)
    };

    match with_live(handle, |state| state.control.post(bytes)) {
        Some(Ok(())) => AM_OK,
        Some(Err(PostError::ChannelFull { .. })) => AM_ERR_CHANNEL_FULL,
        Some(Err(PostError::MessageTooLarge { .. })) => AM_ERR_MESSAGE_TOO_LARGE,
        None => AM_ERR_INVALID_HANDLE,
    }
}

/// Run one quantum. Call only from the host's audio thread.
///
/// Returns 0 when the processor ran, [`AM_EMPTY`] when nothing is installed
/// and [`AM_FAULTED`] when it panicked; output is silenced in both cases.
///
/// # Safety
///
/// `handle` must come from `am_module_create` and not be released
/// concurrently; a released handle returns [`AM_ERR_INVALID_HANDLE`]. Buffers must hold
/// `channels * buffer_frames` samples; they may be null for zero channels.
#[no_mangle]
pub unsafe extern "C" fn am_module_process(
    handle: *mut AmModule,
    sample_rate: c_int,
    buffer_frames: c_int,
    input_channels: c_int,
    input_buffer: *const f32,
    output_channels: c_int,
    output_buffer: *mut f32,
) -> c_int {
    if handle.is_null() {
        return AM_ERR_INVALID_HANDLE;
    }
    let (Ok(sample_rate), Ok(frames), Ok(inputs), Ok(outputs)) = (
        u32::try_from(sample_rate),
        usize::try_from(buffer_frames),
        usize::try_from(input_channels),
        usize::try_from(output_channels),
    ) else {
        return AM_ERR_INVALID_ARGUMENT;
    };

    let input_len = inputs * frames;
    let output_len = outputs * frames;
    if (input_buffer.is_null() && input_len > 0) || (output_buffer.is_null() && output_len > 0) {
        return AM_ERR_INVALID_ARGUMENT;
    }
    let input: &[f32] = if input_len == 0 {
        &[]
    } else {
        slice::from_raw_parts(input_buffer, input_len)
    };
    let output: &mut [f32] = if output_len == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(output_buffer, output_len)
    };

    let Ok(mut block) = AudioBlock::new(sample_rate, frames, inputs, input, outputs, output) else {
        return AM_ERR_INVALID_ARGUMENT;
    };

    let Some(state) = (*handle).state() else {
        return AM_ERR_INVALID_HANDLE;
    };
    let realtime = &mut *state.realtime.get();
    match realtime.process(&mut block) {
        Quantum::Processed { .. } => AM_OK,
        Quantum::Unconfigured => AM_EMPTY,
        Quantum::Faulted { .. } => AM_FAULTED,
    }
}

/// Release a module and everything installed in it.
///
/// The handle stays invalid afterwards: later calls return
/// [`AM_ERR_INVALID_HANDLE`] and no new module reuses its address.
///
/// # Safety
///
/// The host must have stopped calling `am_module_process` on this handle.
#[no_mangle]
pub unsafe extern "C" fn am_module_release(handle: *mut AmModule) -> c_int {
    let state = {
        let mut live = LIVE.lock();
        let Some(index) = live.iter().position(|&addr| addr == handle as usize) else {
            return AM_ERR_INVALID_HANDLE;
        };
        live.swap_remove(index);
        (*(*handle).state.get()).take()
    };

    if let Some(state) = state {
        let pending = state.control.pending_messages();
        if pending > 0 {
            debug!("Releasing module {:p} with {} undelivered messages", handle, pending);
        }
    }
    AM_OK
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end module scenarios driven from a simulated audio thread.

use patchcord::{
    AudioBlock, ChannelConfig, ModuleError, ModuleRegistry, ProcessCallback, ProcessScope,
    Quantum,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Marker {
    id: u32,
}

fn mark(context: &Marker, block: &mut AudioBlock<'_>, _scope: &mut ProcessScope<'_>) {
    block.output_mut().fill(context.id as f32);
}

#[test]
fn test_ping_scenario() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create();

    let context = Arc::new(Marker { id: 7 });
    assert_eq!(registry.configure_fn(handle, mark, Arc::clone(&context)), Ok(1));
    registry.post(handle, b"PING").unwrap();

    // Simulated audio thread
    let (active, messages) = rt.split_mut();
    let active = active.expect("configured processor");
    assert_eq!(active.generation(), 1);

    {
        let message = messages.next().expect("pending message");
        assert_eq!(message.data(), b"PING");
        assert_eq!(message.len(), 4);
    }
    assert!(messages.next().is_none());
    drop(active);

    // The installed function runs with the context it was installed with
    let mut output = [0.0f32; 4];
    {
        let mut block = AudioBlock::new(48000, 2, 0, &[], 2, &mut output).unwrap();
        assert_eq!(rt.process(&mut block), Quantum::Processed { generation: 1 });
    }
    assert_eq!(output, [7.0; 4]);
}

#[test]
fn test_ping_scenario_through_process() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create();

    let seen = Arc::new(AtomicU32::new(0));
    let empty_after = Arc::new(AtomicU32::new(0));
    {
        let seen = Arc::clone(&seen);
        let empty_after = Arc::clone(&empty_after);
        registry
            .configure(handle, move |block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>| {
                if let Some(message) = scope.next() {
                    if message.data() == b"PING" && message.len() == 4 {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
                if scope.next().is_none() {
                    empty_after.fetch_add(1, Ordering::SeqCst);
                }
                block.silence();
            })
            .unwrap();
    }
    registry.post(handle, b"PING").unwrap();

    let mut output = [1.0f32; 8];
    let mut block = AudioBlock::new(48000, 4, 0, &[], 2, &mut output).unwrap();
    assert_eq!(rt.process(&mut block), Quantum::Processed { generation: 1 });

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(empty_after.load(Ordering::SeqCst), 1);
    assert_eq!(registry.stats(handle).unwrap().delivered, 1);
}

#[test]
fn test_capacity_scenario() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry
        .create_with(&ChannelConfig::new(8, 16))
        .unwrap();
    let capacity = registry.control(handle).unwrap().capacity();
    assert_eq!(capacity, 8);

    for n in 0..capacity {
        registry.post(handle, &[n as u8]).unwrap();
    }
    assert_eq!(
        registry.post(handle, b"overflow"),
        Err(ModuleError::ChannelFull { capacity })
    );

    // Drain one message on the audio side
    assert_eq!(rt.messages().next().unwrap().data(), &[0]);
    registry.post(handle, b"fits").unwrap();

    // The rest are intact and in order
    let mut drained = Vec::new();
    rt.messages().drain(|data| drained.push(data.to_vec()));
    let mut expected: Vec<Vec<u8>> = (1..capacity as u8).map(|n| vec![n]).collect();
    expected.push(b"fits".to_vec());
    assert_eq!(drained, expected);
}

#[test]
fn test_round_trip_all_sizes() {
    let max = 64;
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry
        .create_with(&ChannelConfig::new(4, max))
        .unwrap();

    for size in 0..=max {
        let payload: Vec<u8> = (0..size).map(|i| (i * 31 + size) as u8).collect();
        registry.post(handle, &payload).unwrap();

        let message = rt.messages().next().unwrap();
        assert_eq!(message.len(), size);
        assert_eq!(message.data(), payload.as_slice());
    }

    assert_eq!(
        registry.post(handle, &vec![0u8; max + 1]),
        Err(ModuleError::MessageTooLarge { size: max + 1, max })
    );
}

#[test]
fn test_single_producer_fifo() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create();

    registry.post(handle, b"A").unwrap();
    registry.post(handle, b"B").unwrap();

    let messages = rt.messages();
    assert_eq!(messages.next().unwrap().data(), b"A");
    assert_eq!(messages.next().unwrap().data(), b"B");
    assert!(messages.next().is_none());
}

#[test]
fn test_unconfigured_then_configured() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create();

    let mut output = [5.0f32; 4];
    {
        let mut block = AudioBlock::new(44100, 4, 0, &[], 1, &mut output).unwrap();
        assert_eq!(rt.process(&mut block), Quantum::Unconfigured);
    }
    assert_eq!(output, [0.0; 4]);

    registry
        .configure(handle, ProcessCallback::new(mark, Arc::new(Marker { id: 3 })))
        .unwrap();
    {
        let mut block = AudioBlock::new(44100, 4, 0, &[], 1, &mut output).unwrap();
        assert_eq!(rt.process(&mut block), Quantum::Processed { generation: 1 });
    }
    assert_eq!(output, [3.0; 4]);

    let stats = registry.stats(handle).unwrap();
    assert_eq!(stats.quanta, 2);
    assert_eq!(stats.unconfigured_quanta, 1);
}

#[test]
fn test_messages_wait_for_processor() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create();
    registry.post(handle, b"early").unwrap();

    let mut output = [0.0f32; 2];
    {
        let mut block = AudioBlock::new(44100, 2, 0, &[], 1, &mut output).unwrap();
        rt.process(&mut block);
    }
    assert_eq!(registry.control(handle).unwrap().pending_messages(), 1);

    let count = Arc::new(AtomicU32::new(0));
    {
        let count = Arc::clone(&count);
        registry
            .configure(handle, move |_: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>| {
                count.fetch_add(scope.drain(|_| {}) as u32, Ordering::SeqCst);
            })
            .unwrap();
    }
    {
        let mut block = AudioBlock::new(44100, 2, 0, &[], 1, &mut output).unwrap();
        rt.process(&mut block);
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_post_fits_after_pop_inside_quantum() {
    let registry = ModuleRegistry::new();
    let (handle, mut rt) = registry.create_with(&ChannelConfig::new(2, 4)).unwrap();
    let feeder = registry.control(handle).unwrap();

    registry.post(handle, b"a").unwrap();
    registry.post(handle, b"b").unwrap();
    assert_eq!(
        registry.post(handle, b"c"),
        Err(ModuleError::ChannelFull { capacity: 2 })
    );

    let accepted = Arc::new(AtomicU32::new(0));
    {
        let accepted = Arc::clone(&accepted);
        registry
            .configure(handle, move |_: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>| {
                if let Some(message) = scope.next() {
                    // Still holding "a" while the room it left is reused
                    if feeder.post(b"x").is_ok() && message.data() == b"a" {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .unwrap();
    }

    let mut output = [0.0f32; 2];
    {
        let mut block = AudioBlock::new(48000, 2, 0, &[], 1, &mut output).unwrap();
        rt.process(&mut block);
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    let mut rest = Vec::new();
    rt.messages().drain(|data| rest.push(data.to_vec()));
    assert_eq!(rest, vec![b"b".to_vec(), b"x".to_vec()]);
}

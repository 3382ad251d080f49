// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! patchcord-sim - drives one module the way a host audio engine would.
//!
//! A paced "audio thread" runs the module once per buffer period while
//! several control threads post MIDI CC messages and one of them swaps the
//! processor halfway through.
//!
//! Usage: `patchcord-sim [config.toml]`

use patchcord::{
    AudioBlock, AudioProcessor, ConfigError, ConfigManager, HostConfig, ModuleError,
    ModuleHandle, ModuleRegistry, ProcessScope, Quantum, RealtimeModule, SimulationConfig,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// MIDI controller number for channel volume.
const CC_VOLUME: u8 = 7;

/// Attempts per message before a producer gives up on a full channel.
const POST_ATTEMPTS: usize = 4;

/// Parse a three-byte control change for channel volume.
fn volume_cc(data: &[u8]) -> Option<f32> {
    match *data {
        [status, CC_VOLUME, value] if status & 0xF0 == 0xB0 => Some(value.min(127) as f32 / 127.0),
        _ => None,
    }
}

/// Gain stage driven by CC 7 with per-sample smoothing.
struct MidiGain {
    target: f32,
    current: f32,
    coeff: f32,
}

impl MidiGain {
    fn new(sample_rate: u32) -> Self {
        // ~5 ms time constant
        let samples = (0.005 * sample_rate as f32).max(1.0);
        Self {
            target: 1.0,
            current: 1.0,
            coeff: 1.0 - (-1.0 / samples).exp(),
        }
    }
}

impl AudioProcessor for MidiGain {
    fn process(&mut self, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
        while let Some(message) = scope.next() {
            if let Some(gain) = volume_cc(message.data()) {
                self.target = gain;
            }
        }

        block.copy_input_to_output();
        let frames = block.frames();
        let channels = block.output_channels();
        let output = block.output_mut();
        for frame in 0..frames {
            self.current += self.coeff * (self.target - self.current);
            for channel in 0..channels {
                output[channel * frames + frame] *= self.current;
            }
        }
    }
}

/// Shared between the installing thread and the audio thread.
struct MeterContext {
    /// Gain as f32 bits; written by CC messages.
    gain: AtomicU32,
    /// Output peak of the last quantum as f32 bits.
    peak: AtomicU32,
}

impl MeterContext {
    fn new(gain: f32) -> Self {
        Self {
            gain: AtomicU32::new(gain.to_bits()),
            peak: AtomicU32::new(0),
        }
    }

    fn peak(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }
}

/// Plain function processor: unsmoothed gain plus peak metering.
fn metered_gain(context: &MeterContext, block: &mut AudioBlock<'_>, scope: &mut ProcessScope<'_>) {
    while let Some(message) = scope.next() {
        if let Some(gain) = volume_cc(message.data()) {
            context.gain.store(gain.to_bits(), Ordering::Relaxed);
        }
    }

    let gain = f32::from_bits(context.gain.load(Ordering::Relaxed));
    block.copy_input_to_output();
    let mut peak = 0.0f32;
    for sample in block.output_mut() {
        *sample *= gain;
        peak = peak.max(sample.abs());
    }
    context.peak.store(peak.to_bits(), Ordering::Relaxed);
}

/// Result of the audio thread's run.
struct AudioReport {
    realtime: RealtimeModule,
    worst: Duration,
    overruns: u64,
    faults: u64,
}

fn run_audio_thread(mut realtime: RealtimeModule, sim: SimulationConfig) -> AudioReport {
    let frames = sim.buffer_frames;
    let period = Duration::from_secs_f64(frames as f64 / sim.sample_rate as f64);

    // Buffers are allocated once, before the loop.
    let mut input = vec![0.0f32; sim.input_channels * frames];
    let mut output = vec![0.0f32; sim.output_channels * frames];
    let step = 440.0 * std::f32::consts::TAU / sim.sample_rate as f32;
    let mut phase = 0.0f32;

    let mut worst = Duration::ZERO;
    let mut overruns = 0;
    let mut faults = 0;

    for _ in 0..sim.quanta {
        let started = Instant::now();

        for frame in 0..frames {
            let sample = phase.sin() * 0.5;
            phase = (phase + step) % std::f32::consts::TAU;
            for channel in 0..sim.input_channels {
                input[channel * frames + frame] = sample;
            }
        }

        let quantum = match AudioBlock::new(
            sim.sample_rate,
            frames,
            sim.input_channels,
            &input,
            sim.output_channels,
            &mut output,
        ) {
            Ok(mut block) => realtime.process(&mut block),
            Err(e) => {
                error!("Bad block shape: {}", e);
                break;
            }
        };
        if let Quantum::Faulted { .. } = quantum {
            faults += 1;
        }

        let elapsed = started.elapsed();
        worst = worst.max(elapsed);
        if elapsed > period {
            overruns += 1;
        } else if sim.paced {
            thread::sleep(period - elapsed);
        }
    }

    AudioReport {
        realtime,
        worst,
        overruns,
        faults,
    }
}

/// Post CC sweeps, retrying briefly on a full channel.
fn run_producer(
    registry: Arc<ModuleRegistry>,
    handle: ModuleHandle,
    index: usize,
    sim: SimulationConfig,
    dropped: Arc<AtomicU64>,
) {
    let spacing = Duration::from_secs_f64(sim.buffer_frames as f64 / sim.sample_rate as f64 / 2.0);
    let status = 0xB0 | (index as u8 & 0x0F);

    for n in 0..sim.messages_per_producer {
        let message = [status, CC_VOLUME, (n % 128) as u8];
        let mut attempts = 0;
        loop {
            match registry.post(handle, &message) {
                Ok(()) => break,
                Err(ModuleError::ChannelFull { .. }) if attempts + 1 < POST_ATTEMPTS => {
                    attempts += 1;
                    thread::sleep(spacing);
                }
                Err(ModuleError::ChannelFull { capacity }) => {
                    debug!("Producer {} dropped a message ({} slots full)", index, capacity);
                    dropped.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    warn!("Producer {} stopping: {}", index, e);
                    return;
                }
            }
        }
        thread::sleep(spacing);
    }
}

fn load_config() -> Result<HostConfig, ConfigError> {
    match std::env::args().nth(1) {
        Some(path) => ConfigManager::load_file(Path::new(&path)),
        None => match ConfigManager::new() {
            Ok(manager) => manager.load_host_config(),
            Err(ConfigError::NoConfigDir) => {
                warn!("No config directory, using defaults");
                Ok(HostConfig::default())
            }
            Err(e) => Err(e),
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("patchcord=debug".parse()?))
        .init();

    let config = load_config()?;
    let sim = config.simulation.clone();
    info!(
        "Simulating {} quanta of {} frames at {} Hz with {} producers",
        sim.quanta, sim.buffer_frames, sim.sample_rate, sim.producers
    );

    let registry = Arc::new(ModuleRegistry::with_config(config.channel)?);
    let (handle, realtime) = registry.create();
    registry.configure(handle, MidiGain::new(sim.sample_rate))?;

    let audio = {
        let sim = sim.clone();
        thread::Builder::new()
            .name("patchcord-audio".into())
            .spawn(move || run_audio_thread(realtime, sim))?
    };

    let dropped = Arc::new(AtomicU64::new(0));
    let mut producers = Vec::with_capacity(sim.producers);
    for index in 0..sim.producers {
        let registry = Arc::clone(&registry);
        let sim = sim.clone();
        let dropped = Arc::clone(&dropped);
        producers.push(
            thread::Builder::new()
                .name(format!("patchcord-producer-{}", index))
                .spawn(move || run_producer(registry, handle, index, sim, dropped))?,
        );
    }

    // Swap processors halfway through the run.
    let half = Duration::from_secs_f64(
        sim.quanta as f64 * sim.buffer_frames as f64 / sim.sample_rate as f64 / 2.0,
    );
    thread::sleep(half);
    let meter = Arc::new(MeterContext::new(1.0));
    let generation = registry.configure_fn(handle, metered_gain, Arc::clone(&meter))?;
    info!("Installed metered processor (generation {})", generation);

    for producer in producers {
        if producer.join().is_err() {
            error!("Producer thread panicked");
        }
    }
    let report = match audio.join() {
        Ok(report) => report,
        Err(_) => {
            error!("Audio thread panicked");
            return Err("audio thread panicked".into());
        }
    };

    let stats = registry.stats(handle)?;
    info!(
        "Quanta: {} ({} overruns, {} faults), worst cycle {:?}",
        stats.quanta, report.overruns, report.faults, report.worst
    );
    info!(
        "Messages: {} posted, {} delivered, {} rejected, {} dropped after retries",
        stats.posted,
        stats.delivered,
        stats.rejected(),
        dropped.load(Ordering::Relaxed)
    );
    info!("Last output peak: {:.3}", meter.peak());
    debug!("Stats: {}", toml::to_string(&stats)?);

    registry.release(handle)?;
    drop(report.realtime);
    Ok(())
}

// src/device/mod.rs
//! Acquisition device abstraction and the built-in signal simulator
//!
//! The recording and online phases pull `SampleBatch`es from whatever
//! implements [`DeviceInterface`]; the simulator stands in for hardware in
//! tests and demos.

use crate::types::{SampleBatch, SampleFrame};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use std::time::Duration;
use thiserror::Error;

/// Device-side failures
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device disconnected")]
    Disconnected,
    #[error("device io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming acquisition source
#[async_trait]
pub trait DeviceInterface: Send {
    /// Await the next batch of frames. Timestamps are monotonic across
    /// batches; a `Disconnected` error is terminal.
    async fn next_batch(&mut self) -> Result<SampleBatch, DeviceError>;

    fn sampling_rate_hz(&self) -> u32;

    fn channel_count(&self) -> usize;

    fn is_connected(&self) -> bool;
}

/// Simulator tuning knobs
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub channels: usize,
    pub sampling_rate_hz: u32,
    pub frames_per_batch: usize,
    /// Seed for the noise generator; a fixed seed replays identically
    pub seed: u64,
    pub burst_amplitude: f32,
    pub noise_amplitude: f32,
    /// Pace batch delivery at the nominal sampling rate instead of
    /// delivering as fast as the consumer pulls
    pub paced: bool,
    /// Simulate a cable pull after this many batches
    pub disconnect_after_batches: Option<u32>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            channels: 8,
            sampling_rate_hz: 2000,
            frames_per_batch: 32,
            seed: 0x5eed,
            burst_amplitude: 0.8,
            noise_amplitude: 0.05,
            paced: false,
            disconnect_after_batches: None,
        }
    }
}

/// Deterministic synthetic signal source.
///
/// Each channel carries a sinusoidal burst with a channel-specific phase
/// plus seeded uniform noise, amplitude-modulated by a slow envelope so the
/// signal has quiet and active stretches like a real recording.
pub struct SignalSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    sequence: u32,
    next_timestamp_us: u64,
    connected: bool,
}

impl SignalSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng, sequence: 0, next_timestamp_us: 0, connected: true }
    }

    fn sample(&mut self, frame_index: u64, channel: usize) -> f32 {
        let t = frame_index as f32 / self.config.sampling_rate_hz as f32;
        // 1 Hz envelope gates 80 Hz carrier bursts
        let envelope = (0.5 + 0.5 * (TAU * t).sin()).powi(2);
        let phase = channel as f32 * 0.7;
        let carrier = (TAU * 80.0 * t + phase).sin();
        let noise = self.rng.gen_range(-1.0f32..1.0);
        self.config.burst_amplitude * envelope * carrier + self.config.noise_amplitude * noise
    }
}

#[async_trait]
impl DeviceInterface for SignalSimulator {
    async fn next_batch(&mut self) -> Result<SampleBatch, DeviceError> {
        if !self.connected {
            return Err(DeviceError::Disconnected);
        }
        if let Some(limit) = self.config.disconnect_after_batches {
            if self.sequence >= limit {
                self.connected = false;
                return Err(DeviceError::Disconnected);
            }
        }

        let frame_interval_us = 1_000_000u64 / u64::from(self.config.sampling_rate_hz.max(1));
        if self.config.paced {
            let batch_us = frame_interval_us * self.config.frames_per_batch as u64;
            tokio::time::sleep(Duration::from_micros(batch_us)).await;
        }

        let mut frames = Vec::with_capacity(self.config.frames_per_batch);
        for _ in 0..self.config.frames_per_batch {
            let frame_index = self.next_timestamp_us / frame_interval_us.max(1);
            let channels = (0..self.config.channels)
                .map(|ch| self.sample(frame_index, ch))
                .collect();
            frames.push(SampleFrame { timestamp_us: self.next_timestamp_us, channels });
            self.next_timestamp_us += frame_interval_us;
        }

        let batch = SampleBatch { sequence: self.sequence, frames };
        self.sequence += 1;
        Ok(batch)
    }

    fn sampling_rate_hz(&self) -> u32 {
        self.config.sampling_rate_hz
    }

    fn channel_count(&self) -> usize {
        self.config.channels
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

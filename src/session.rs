// src/session.rs
//! Recording session bookkeeping
//!
//! A session is mutated by incoming device frames and ground-truth points
//! only while the Recording phase is active, then sealed and persisted.
//! Sealed sessions are immutable.

use crate::types::{current_timestamp_micros, GroundTruthPoint, SampleFrame, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bounded capture of device frames plus synchronized ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: String,
    pub task: TaskCategory,
    pub created_at_us: u64,
    pub channel_count: usize,
    pub sampling_rate_hz: u32,
    /// Names of the visual interfaces active when the session started
    pub active_interfaces: Vec<String>,
    /// Ordered device frames with monotonic timestamps
    pub frames: Vec<SampleFrame>,
    /// Independent ground-truth stream per active interface
    pub ground_truth: BTreeMap<String, Vec<GroundTruthPoint>>,
    pub sealed: bool,
    /// Set when the session was aborted (device disconnect, operator abort)
    /// and holds truncated data
    pub partial: bool,
}

impl RecordingSession {
    pub fn new(
        task: TaskCategory,
        active_interfaces: Vec<String>,
        channel_count: usize,
        sampling_rate_hz: u32,
    ) -> Self {
        let created_at_us = current_timestamp_micros();
        let id = format!("session_{}_{:04x}", created_at_us, rand::random::<u16>());
        let ground_truth =
            active_interfaces.iter().map(|name| (name.clone(), Vec::new())).collect();
        Self {
            id,
            task,
            created_at_us,
            channel_count,
            sampling_rate_hz,
            active_interfaces,
            frames: Vec::new(),
            ground_truth,
            sealed: false,
            partial: false,
        }
    }

    /// Append device frames; ignored once the session is sealed
    pub fn push_frames(&mut self, frames: impl IntoIterator<Item = SampleFrame>) {
        if self.sealed {
            return;
        }
        self.frames.extend(frames);
    }

    /// Append ground-truth points for one interface; ignored once sealed
    pub fn push_ground_truth(
        &mut self,
        interface: &str,
        points: impl IntoIterator<Item = GroundTruthPoint>,
    ) {
        if self.sealed {
            return;
        }
        self.ground_truth.entry(interface.to_string()).or_default().extend(points);
    }

    /// Seal the session; `partial` marks truncated/aborted captures
    pub fn seal(&mut self, partial: bool) {
        self.sealed = true;
        self.partial = partial;
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether this session can contribute to training for `task`
    pub fn is_compatible_with(&self, task: TaskCategory) -> bool {
        self.sealed && self.task == task && !self.frames.is_empty()
    }

    /// Ground truth across all interfaces, merged by timestamp
    pub fn merged_ground_truth(&self) -> Vec<GroundTruthPoint> {
        let mut merged: Vec<GroundTruthPoint> =
            self.ground_truth.values().flatten().cloned().collect();
        merged.sort_by_key(|p| p.timestamp_us);
        merged
    }
}

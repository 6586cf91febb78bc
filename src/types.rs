// src/types.rs
//! Shared value types for the record/train/online core

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single multi-channel device frame with a monotonic timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFrame {
    pub timestamp_us: u64,
    pub channels: Vec<f32>,
}

/// Batch of frames delivered by one device read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub sequence: u32,
    pub frames: Vec<SampleFrame>,
}

impl SampleBatch {
    /// Timestamp of the last frame in the batch, if any
    pub fn end_timestamp_us(&self) -> Option<u64> {
        self.frames.last().map(|f| f.timestamp_us)
    }
}

/// Labeled target value received from a visual interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthPoint {
    pub timestamp_us: u64,
    pub values: Vec<f32>,
}

/// Discrete domain of control targets for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    HandGestures,
    CursorDirections,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskCategory::HandGestures => write!(f, "hand_gestures"),
            TaskCategory::CursorDirections => write!(f, "cursor_directions"),
        }
    }
}

/// Raw model output: one value per control target dimension,
/// or a single class id for classifiers
pub type Prediction = Vec<f32>;

/// Prediction after the post-prediction filter chain, ready for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredPrediction {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub task: TaskCategory,
    pub values: Vec<f32>,
}

/// Centralized timestamp utility (microseconds since the Unix epoch)
pub fn current_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

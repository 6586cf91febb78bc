// src/registry/kinds.rs
//! Capability contracts for the five extension kinds
//!
//! Each kind is a closed interface with one implementation per concrete
//! model/feature/filter. The online loop and the training pipeline depend
//! only on these traits, never on concrete types.

use crate::types::{FilteredPrediction, Prediction, SampleFrame, TaskCategory};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Free-form numeric training parameters passed through to a model kind
pub type ParamMap = BTreeMap<String, f64>;

/// Assembled training data: one feature row and one target row per window
#[derive(Debug, Clone)]
pub struct TrainingDataset {
    pub features: Array2<f32>,
    pub targets: Array2<f32>,
}

impl TrainingDataset {
    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }

    pub fn len(&self) -> usize {
        self.features.nrows()
    }
}

/// Errors surfaced by model kinds
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("training failed: {0}")]
    Training(String),
    #[error("malformed parameter blob: {0}")]
    MalformedBlob(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
}

/// Temporal requirements a model places on feature extraction
///
/// Models with convolutional layers need multiple temporal steps per input,
/// so features must keep the time dimension and the online loop must
/// accumulate `feature_window_size` frames before invoking the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemporalRequirements {
    pub requires_temporal_preservation: bool,
    pub feature_window_size: Option<usize>,
}

/// Trainable model kind: train/save/load/predict contract
pub trait ModelKind: Send + Sync {
    /// Classifier (discrete class id output) vs regressor (value vector)
    fn is_classifier(&self) -> bool;

    fn temporal(&self) -> TemporalRequirements {
        TemporalRequirements::default()
    }

    fn train(
        &self,
        dataset: &TrainingDataset,
        params: &ParamMap,
    ) -> Result<Box<dyn TrainedModel>, ModelError>;

    /// Rehydrate a trained model from a saved parameter blob
    fn load(&self, blob: &[u8]) -> Result<Box<dyn TrainedModel>, ModelError>;
}

/// Trained model instance bound to one artifact
pub trait TrainedModel: Send {
    /// Serialize the trained parameters
    fn save(&self) -> Result<Vec<u8>, ModelError>;

    /// Predict from one flattened feature vector
    fn predict(&mut self, features: &[f32]) -> Result<Prediction, ModelError>;
}

/// Signal feature kind
pub trait FeatureKind: Send + Sync {
    /// Extract feature values from a window of frames.
    ///
    /// Non-temporal features return one value per channel; features that
    /// preserve temporal structure return one value per channel per step.
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32>;

    /// Whether this feature is bounded in latency and safe for the online
    /// loop. Non-real-time-safe features are rejected at model load time.
    fn realtime_safe(&self) -> bool {
        true
    }

    /// Whether the output keeps the time dimension instead of collapsing
    /// the window to a single summary value per channel
    fn preserves_temporal_structure(&self) -> bool {
        false
    }
}

/// Post-prediction filter kind: a factory for per-session filter state
pub trait FilterKind: Send + Sync {
    fn instantiate(&self) -> Box<dyn OutputFilter>;
}

/// Stateful post-prediction transform. State persists across invocations
/// within one online session and resets on session start (fresh instance).
pub trait OutputFilter: Send {
    fn apply(&mut self, value: Prediction) -> Prediction;
}

/// Errors surfaced by output systems
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output routing failed: {0}")]
    Routing(String),
}

/// Registered sink that routes filtered predictions to a consumer
pub trait OutputSystem: Send + Sync {
    fn route(&self, prediction: &FilteredPrediction) -> Result<(), OutputError>;

    /// Restrict this sink to one task category; `None` accepts everything
    fn task_category(&self) -> Option<TaskCategory> {
        None
    }
}

/// How to launch an externally running feedback process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Static description of a visual interface kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualInterfaceDescriptor {
    pub task_category: TaskCategory,
    /// Where the external process listens for our datagrams
    pub endpoint: SocketAddr,
    /// Launch command for a bridge-owned process; `None` means the process
    /// is always externally pre-launched
    pub launch: Option<LaunchCommand>,
}

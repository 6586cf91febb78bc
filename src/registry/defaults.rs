// src/registry/defaults.rs
//! Built-in models, features, filters, interfaces and output systems
//!
//! Defaults are re-registered identically on every startup; user extensions
//! layer on top of them through the same registration calls.

use crate::registry::kinds::{
    FeatureKind, FilterKind, ModelError, ModelKind, OutputError, OutputFilter, OutputSystem,
    ParamMap, TemporalRequirements, TrainedModel, TrainingDataset, VisualInterfaceDescriptor,
};
use crate::registry::Registry;
use crate::types::{FilteredPrediction, Prediction, SampleFrame, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::info;

/// Default UDP port the virtual hand process listens on
pub const VIRTUAL_HAND_PORT: u16 = 1236;
/// Default UDP port the virtual cursor process listens on
pub const VIRTUAL_CURSOR_PORT: u16 = 1246;

/// Register every built-in component
pub fn register_defaults(registry: &mut Registry) {
    registry.register_feature("rms", Arc::new(RmsFeature));
    registry.register_feature("mav", Arc::new(MavFeature));
    registry.register_feature("wl", Arc::new(WaveformLengthFeature));
    registry.register_feature("var", Arc::new(VarianceFeature));
    registry.register_feature("windowed_rms", Arc::new(WindowedRmsFeature { step: 8 }));

    registry.register_model("centroid_classifier", Arc::new(CentroidClassifier::new()));
    registry.register_model(
        "temporal_centroid_classifier",
        Arc::new(CentroidClassifier::temporal_preserving(16)),
    );
    registry.register_model("ridge_regressor", Arc::new(RidgeRegressor));

    registry.register_filter("ema", Arc::new(EmaFilterKind { alpha: 0.3 }));
    registry.register_filter("majority_vote", Arc::new(MajorityVoteKind { window: 5 }));

    registry.register_visual_interface(
        "virtual_hand",
        VisualInterfaceDescriptor {
            task_category: TaskCategory::HandGestures,
            endpoint: SocketAddr::from(([127, 0, 0, 1], VIRTUAL_HAND_PORT)),
            launch: None,
        },
    );
    registry.register_visual_interface(
        "virtual_cursor",
        VisualInterfaceDescriptor {
            task_category: TaskCategory::CursorDirections,
            endpoint: SocketAddr::from(([127, 0, 0, 1], VIRTUAL_CURSOR_PORT)),
            launch: None,
        },
    );

    registry.register_output_system("console_log", Arc::new(ConsoleLogOutput));
}

// ---------------------------------------------------------------------------
// Features (time-domain, per channel over a window of frames)
// ---------------------------------------------------------------------------

fn channel_count(window: &[SampleFrame]) -> usize {
    window.first().map(|f| f.channels.len()).unwrap_or(0)
}

/// Root mean square per channel
pub struct RmsFeature;

impl FeatureKind for RmsFeature {
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32> {
        let channels = channel_count(window);
        (0..channels)
            .map(|ch| {
                let sum_sq: f32 = window.iter().map(|f| f.channels[ch] * f.channels[ch]).sum();
                (sum_sq / window.len() as f32).sqrt()
            })
            .collect()
    }
}

/// Mean absolute value per channel
pub struct MavFeature;

impl FeatureKind for MavFeature {
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32> {
        let channels = channel_count(window);
        (0..channels)
            .map(|ch| {
                let sum: f32 = window.iter().map(|f| f.channels[ch].abs()).sum();
                sum / window.len() as f32
            })
            .collect()
    }
}

/// Waveform length (cumulative absolute first difference) per channel
pub struct WaveformLengthFeature;

impl FeatureKind for WaveformLengthFeature {
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32> {
        let channels = channel_count(window);
        (0..channels)
            .map(|ch| {
                window
                    .windows(2)
                    .map(|pair| (pair[1].channels[ch] - pair[0].channels[ch]).abs())
                    .sum()
            })
            .collect()
    }
}

/// Signal variance per channel
pub struct VarianceFeature;

impl FeatureKind for VarianceFeature {
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32> {
        let channels = channel_count(window);
        (0..channels)
            .map(|ch| {
                let mean: f32 =
                    window.iter().map(|f| f.channels[ch]).sum::<f32>() / window.len() as f32;
                window.iter().map(|f| (f.channels[ch] - mean).powi(2)).sum::<f32>()
                    / window.len() as f32
            })
            .collect()
    }
}

/// RMS over sub-windows, preserving the time dimension.
///
/// Output is step-major: all channels of the first sub-window, then all
/// channels of the second, and so on.
pub struct WindowedRmsFeature {
    pub step: usize,
}

impl FeatureKind for WindowedRmsFeature {
    fn extract(&self, window: &[SampleFrame]) -> Vec<f32> {
        let step = self.step.max(1);
        window.chunks(step).flat_map(|chunk| RmsFeature.extract(chunk)).collect()
    }

    fn preserves_temporal_structure(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CentroidParams {
    classes: Vec<i32>,
    centroids: Vec<Vec<f32>>,
}

/// Nearest-centroid classifier over flattened feature vectors
pub struct CentroidClassifier {
    temporal: TemporalRequirements,
}

impl CentroidClassifier {
    pub fn new() -> Self {
        Self { temporal: TemporalRequirements::default() }
    }

    /// Variant that requires temporal-preserving features over a fixed
    /// sliding window
    pub fn temporal_preserving(feature_window_size: usize) -> Self {
        Self {
            temporal: TemporalRequirements {
                requires_temporal_preservation: true,
                feature_window_size: Some(feature_window_size),
            },
        }
    }
}

impl Default for CentroidClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelKind for CentroidClassifier {
    fn is_classifier(&self) -> bool {
        true
    }

    fn temporal(&self) -> TemporalRequirements {
        self.temporal
    }

    fn train(
        &self,
        dataset: &TrainingDataset,
        _params: &ParamMap,
    ) -> Result<Box<dyn TrainedModel>, ModelError> {
        if dataset.is_empty() {
            return Err(ModelError::Training("no rows to train on".to_string()));
        }

        let dims = dataset.features.ncols();
        let mut sums: BTreeMap<i32, (Vec<f64>, usize)> = BTreeMap::new();
        for (row, target) in dataset.features.rows().into_iter().zip(dataset.targets.rows()) {
            let label = target
                .first()
                .copied()
                .ok_or_else(|| ModelError::Training("targets have zero columns".to_string()))?
                .round() as i32;
            let entry = sums.entry(label).or_insert_with(|| (vec![0.0; dims], 0));
            for (acc, value) in entry.0.iter_mut().zip(row.iter()) {
                *acc += f64::from(*value);
            }
            entry.1 += 1;
        }

        let mut classes = Vec::with_capacity(sums.len());
        let mut centroids = Vec::with_capacity(sums.len());
        for (label, (sum, count)) in sums {
            classes.push(label);
            centroids.push(sum.iter().map(|v| (v / count as f64) as f32).collect());
        }

        Ok(Box::new(TrainedCentroid { params: CentroidParams { classes, centroids } }))
    }

    fn load(&self, blob: &[u8]) -> Result<Box<dyn TrainedModel>, ModelError> {
        let params: CentroidParams = serde_json::from_slice(blob)
            .map_err(|e| ModelError::MalformedBlob(e.to_string()))?;
        Ok(Box::new(TrainedCentroid { params }))
    }
}

struct TrainedCentroid {
    params: CentroidParams,
}

impl TrainedModel for TrainedCentroid {
    fn save(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(&self.params).map_err(|e| ModelError::Training(e.to_string()))
    }

    fn predict(&mut self, features: &[f32]) -> Result<Prediction, ModelError> {
        let mut best: Option<(i32, f32)> = None;
        for (label, centroid) in self.params.classes.iter().zip(&self.params.centroids) {
            if centroid.len() != features.len() {
                return Err(ModelError::Prediction(format!(
                    "feature vector has {} values, centroid expects {}",
                    features.len(),
                    centroid.len()
                )));
            }
            let dist: f32 =
                centroid.iter().zip(features).map(|(c, x)| (c - x) * (c - x)).sum();
            match best {
                Some((_, d)) if d <= dist => {}
                _ => best = Some((*label, dist)),
            }
        }
        let (label, _) =
            best.ok_or_else(|| ModelError::Prediction("model has no centroids".to_string()))?;
        Ok(vec![label as f32])
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RidgeParams {
    /// One weight row per target dimension; bias term is the last entry
    weights: Vec<Vec<f32>>,
}

/// Ridge regressor solved through the normal equations
pub struct RidgeRegressor;

impl ModelKind for RidgeRegressor {
    fn is_classifier(&self) -> bool {
        false
    }

    fn train(
        &self,
        dataset: &TrainingDataset,
        params: &ParamMap,
    ) -> Result<Box<dyn TrainedModel>, ModelError> {
        if dataset.is_empty() {
            return Err(ModelError::Training("no rows to train on".to_string()));
        }
        let lambda = params.get("lambda").copied().unwrap_or(1e-3);

        let n = dataset.features.nrows();
        let d = dataset.features.ncols() + 1; // bias column
        let t = dataset.targets.ncols();

        // A = X^T X + lambda I, with X extended by a ones column
        let mut a = vec![vec![0.0f64; d]; d];
        for row in dataset.features.rows() {
            let extended: Vec<f64> =
                row.iter().map(|v| f64::from(*v)).chain(std::iter::once(1.0)).collect();
            for i in 0..d {
                for j in 0..d {
                    a[i][j] += extended[i] * extended[j];
                }
            }
        }
        for (i, row) in a.iter_mut().enumerate() {
            row[i] += lambda * n as f64;
        }

        let mut weights = Vec::with_capacity(t);
        for k in 0..t {
            let mut b = vec![0.0f64; d];
            for (row, target) in dataset.features.rows().into_iter().zip(dataset.targets.rows())
            {
                let y = f64::from(target[k]);
                for (i, v) in row.iter().enumerate() {
                    b[i] += f64::from(*v) * y;
                }
                b[d - 1] += y;
            }
            let w = solve_linear(a.clone(), b)?;
            weights.push(w.into_iter().map(|v| v as f32).collect());
        }

        Ok(Box::new(TrainedRidge { params: RidgeParams { weights } }))
    }

    fn load(&self, blob: &[u8]) -> Result<Box<dyn TrainedModel>, ModelError> {
        let params: RidgeParams = serde_json::from_slice(blob)
            .map_err(|e| ModelError::MalformedBlob(e.to_string()))?;
        Ok(Box::new(TrainedRidge { params }))
    }
}

struct TrainedRidge {
    params: RidgeParams,
}

impl TrainedModel for TrainedRidge {
    fn save(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(&self.params).map_err(|e| ModelError::Training(e.to_string()))
    }

    fn predict(&mut self, features: &[f32]) -> Result<Prediction, ModelError> {
        self.params
            .weights
            .iter()
            .map(|w| {
                if w.len() != features.len() + 1 {
                    return Err(ModelError::Prediction(format!(
                        "feature vector has {} values, weights expect {}",
                        features.len(),
                        w.len() - 1
                    )));
                }
                let bias = w[w.len() - 1];
                Ok(w[..w.len() - 1].iter().zip(features).map(|(a, b)| a * b).sum::<f32>() + bias)
            })
            .collect()
    }
}

/// Gaussian elimination with partial pivoting
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(ModelError::Training("singular normal-equation matrix".to_string()));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let sum: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - sum) / a[row][row];
    }
    Ok(x)
}

// ---------------------------------------------------------------------------
// Post-prediction filters
// ---------------------------------------------------------------------------

/// Exponential moving average smoothing for regression outputs
pub struct EmaFilterKind {
    pub alpha: f32,
}

impl FilterKind for EmaFilterKind {
    fn instantiate(&self) -> Box<dyn OutputFilter> {
        Box::new(EmaState { alpha: self.alpha.clamp(0.0, 1.0), prev: None })
    }
}

struct EmaState {
    alpha: f32,
    prev: Option<Vec<f32>>,
}

impl OutputFilter for EmaState {
    fn apply(&mut self, value: Prediction) -> Prediction {
        let smoothed = match &self.prev {
            Some(prev) if prev.len() == value.len() => value
                .iter()
                .zip(prev)
                .map(|(x, p)| self.alpha * x + (1.0 - self.alpha) * p)
                .collect(),
            _ => value,
        };
        self.prev = Some(smoothed.clone());
        smoothed
    }
}

/// Sliding majority vote over recent class ids, for classifier outputs
pub struct MajorityVoteKind {
    pub window: usize,
}

impl FilterKind for MajorityVoteKind {
    fn instantiate(&self) -> Box<dyn OutputFilter> {
        Box::new(MajorityVoteState { window: self.window.max(1), recent: VecDeque::new() })
    }
}

struct MajorityVoteState {
    window: usize,
    recent: VecDeque<i32>,
}

impl OutputFilter for MajorityVoteState {
    fn apply(&mut self, value: Prediction) -> Prediction {
        let class = value.first().copied().unwrap_or(0.0).round() as i32;
        self.recent.push_back(class);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }

        // highest count wins, ties go to the most recent occurrence
        let mut winner = class;
        let mut winner_count = 0usize;
        let mut winner_last = 0usize;
        for (idx, candidate) in self.recent.iter().enumerate() {
            let count = self.recent.iter().filter(|c| *c == candidate).count();
            if count > winner_count || (count == winner_count && idx >= winner_last) {
                winner = *candidate;
                winner_count = count;
                winner_last = idx;
            }
        }
        vec![winner as f32]
    }
}

// ---------------------------------------------------------------------------
// Output systems
// ---------------------------------------------------------------------------

/// Output system that logs dispatched predictions
pub struct ConsoleLogOutput;

impl OutputSystem for ConsoleLogOutput {
    fn route(&self, prediction: &FilteredPrediction) -> Result<(), OutputError> {
        info!(
            sequence = prediction.sequence,
            task = %prediction.task,
            values = ?prediction.values,
            "prediction dispatched"
        );
        Ok(())
    }
}

/// Output system that forwards predictions as JSON datagrams, best effort
pub struct UdpOutputSystem {
    socket: UdpSocket,
    target: SocketAddr,
    task: Option<TaskCategory>,
}

impl UdpOutputSystem {
    pub fn bind(target: SocketAddr, task: Option<TaskCategory>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, target, task })
    }
}

impl OutputSystem for UdpOutputSystem {
    fn route(&self, prediction: &FilteredPrediction) -> Result<(), OutputError> {
        let payload =
            serde_json::to_vec(prediction).map_err(|e| OutputError::Routing(e.to_string()))?;
        match self.socket.send_to(&payload, self.target) {
            Ok(_) => Ok(()),
            // best effort, a full send buffer is missed feedback
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(OutputError::Routing(e.to_string())),
        }
    }

    fn task_category(&self) -> Option<TaskCategory> {
        self.task
    }
}

// src/online/mod.rs
//! Online inference loop
//!
//! Consumes device batches from a bounded queue, runs feature extraction,
//! model prediction and the post-prediction filter chain per frame, then
//! dispatches the result to every matching output system and streaming
//! visual interface. The pipeline itself is synchronous and deterministic;
//! all concurrency lives in the queue and the surrounding tasks.

pub mod queue;

use crate::bridge::VisualInterfaceBridge;
use crate::registry::kinds::{FeatureKind, ModelError, OutputFilter, OutputSystem, TrainedModel};
use crate::registry::{Registry, RegistryError};
use crate::storage::ModelArtifact;
use crate::types::{current_timestamp_micros, FilteredPrediction, SampleFrame, TaskCategory};
use queue::SampleQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Online loop errors; all of them surface at load time except `Model`
#[derive(Debug, Error)]
pub enum OnlineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("feature \"{0}\" is not real-time safe")]
    UnsafeFeature(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Counters shared between the inference task and its observers
#[derive(Debug, Default)]
pub struct OnlineMetrics {
    frames_processed: AtomicU64,
    predictions_dispatched: AtomicU64,
}

/// Point-in-time copy of the online counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnlineMetricsSnapshot {
    pub frames_processed: u64,
    pub predictions_dispatched: u64,
    pub batches_dropped: u64,
}

impl OnlineMetrics {
    pub fn snapshot(&self, queue: &SampleQueue) -> OnlineMetricsSnapshot {
        OnlineMetricsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            predictions_dispatched: self.predictions_dispatched.load(Ordering::Relaxed),
            batches_dropped: queue.dropped(),
        }
    }
}

/// Side capture of everything the loop emitted, for offline inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLog {
    pub id: String,
    pub artifact_id: String,
    pub task: TaskCategory,
    pub started_at_us: u64,
    pub predictions: Vec<FilteredPrediction>,
}

impl PredictionLog {
    fn new(artifact_id: &str, task: TaskCategory) -> Self {
        let started_at_us = current_timestamp_micros();
        Self {
            id: format!("predictions_{}_{:04x}", started_at_us, rand::random::<u16>()),
            artifact_id: artifact_id.to_string(),
            task,
            started_at_us,
            predictions: Vec::new(),
        }
    }
}

/// Everything the loop needs, resolved against the registry at load time.
///
/// Resolution is the moment misconfiguration surfaces: unknown keys,
/// features unfit for real-time use, a blob the model kind cannot read.
/// Once built, the pipeline runs without further registry access.
pub struct OnlinePipeline {
    features: Vec<Arc<dyn FeatureKind>>,
    model: Box<dyn TrainedModel>,
    filters: Vec<Box<dyn OutputFilter>>,
    task: TaskCategory,
    /// Sliding extraction window; 1 when the model has no temporal needs
    window_len: usize,
    /// Temporal models wait for a full window before the first prediction
    temporal: bool,
    window: Vec<SampleFrame>,
    sequence: u64,
}

impl OnlinePipeline {
    pub fn build(
        registry: &Registry,
        artifact: &ModelArtifact,
        filter_keys: &[String],
    ) -> Result<Self, OnlineError> {
        let kind = registry.get_model(&artifact.model_key)?;
        let model = kind.load(&artifact.blob)?;

        let mut features = Vec::with_capacity(artifact.feature_keys.len());
        for key in &artifact.feature_keys {
            let feature = registry.get_feature(key)?;
            if !feature.realtime_safe() {
                return Err(OnlineError::UnsafeFeature(key.clone()));
            }
            features.push(feature);
        }

        // fresh filter state per session
        let mut filters = Vec::with_capacity(filter_keys.len());
        for key in filter_keys {
            filters.push(registry.get_filter(key)?.instantiate());
        }

        let temporal = artifact.temporal.requires_temporal_preservation;
        let window_len = if temporal { artifact.window_len.max(1) } else { 1 };

        Ok(Self {
            features,
            model,
            filters,
            task: artifact.task,
            window_len,
            temporal,
            window: Vec::with_capacity(window_len),
            sequence: 0,
        })
    }

    pub fn task(&self) -> TaskCategory {
        self.task
    }

    /// Run the per-frame pipeline over one batch.
    ///
    /// Every frame yields exactly one prediction, except during the warm-up
    /// of a temporal model where the window is still filling.
    pub fn process_batch(
        &mut self,
        frames: &[SampleFrame],
    ) -> Result<Vec<FilteredPrediction>, OnlineError> {
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            if self.window.len() == self.window_len {
                self.window.remove(0);
            }
            self.window.push(frame.clone());
            if self.temporal && self.window.len() < self.window_len {
                continue;
            }

            let mut feature_vec = Vec::new();
            for feature in &self.features {
                feature_vec.extend(feature.extract(&self.window));
            }

            let raw = self.model.predict(&feature_vec)?;
            let values = self.filters.iter_mut().fold(raw, |v, f| f.apply(v));

            out.push(FilteredPrediction {
                sequence: self.sequence,
                timestamp_us: frame.timestamp_us,
                task: self.task,
                values,
            });
            self.sequence += 1;
        }
        Ok(out)
    }
}

/// One running online session: the pipeline plus its dispatch targets
pub struct OnlineLoop {
    pipeline: OnlinePipeline,
    queue: Arc<SampleQueue>,
    bridge: Arc<VisualInterfaceBridge>,
    sinks: Vec<Arc<dyn OutputSystem>>,
    metrics: Arc<OnlineMetrics>,
    log: Option<PredictionLog>,
}

impl OnlineLoop {
    pub fn new(
        pipeline: OnlinePipeline,
        queue: Arc<SampleQueue>,
        bridge: Arc<VisualInterfaceBridge>,
        sinks: Vec<Arc<dyn OutputSystem>>,
        metrics: Arc<OnlineMetrics>,
        record_predictions: bool,
        artifact_id: &str,
    ) -> Self {
        let log = record_predictions
            .then(|| PredictionLog::new(artifact_id, pipeline.task()));
        Self { pipeline, queue, bridge, sinks, metrics, log }
    }

    /// Consume the queue until it is closed and drained, dispatching every
    /// prediction in order. Returns the side capture when enabled.
    pub async fn run(mut self) -> Option<PredictionLog> {
        while let Some(batch) = self.queue.pop().await {
            self.metrics.frames_processed.fetch_add(batch.frames.len() as u64, Ordering::Relaxed);
            let predictions = match self.pipeline.process_batch(&batch.frames) {
                Ok(predictions) => predictions,
                Err(e) => {
                    // a prediction failure is not transient, stop the loop
                    warn!(error = %e, "online pipeline failed, stopping");
                    break;
                }
            };
            for prediction in predictions {
                self.dispatch(&prediction);
                if let Some(log) = &mut self.log {
                    log.predictions.push(prediction);
                }
            }
        }
        self.log
    }

    /// Fan one prediction out to output systems and streaming interfaces.
    /// Sink failures are logged and never stall the loop.
    fn dispatch(&self, prediction: &FilteredPrediction) {
        for sink in &self.sinks {
            if sink.task_category().is_some_and(|t| t != prediction.task) {
                continue;
            }
            if let Err(e) = sink.route(prediction) {
                debug!(error = %e, "output system rejected prediction");
            }
        }
        for name in self.bridge.active_names_for(prediction.task) {
            // a concurrently deactivated instance is not an error here
            let _ = self.bridge.send_output(&name, prediction);
        }
        self.metrics.predictions_dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

// src/training.rs
//! Offline training pipeline
//!
//! Turns sealed recording sessions into a trained model artifact: window the
//! frames, align each window with the latest ground-truth label at or before
//! its end, extract features per window in parallel, then hand the assembled
//! dataset to the model kind.

use crate::registry::kinds::{FeatureKind, ModelError, ParamMap, TrainingDataset};
use crate::registry::{Registry, RegistryError};
use crate::session::RecordingSession;
use crate::storage::ModelArtifact;
use crate::types::{current_timestamp_micros, GroundTruthPoint, SampleFrame, TaskCategory};
use ndarray::Array2;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Training pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no feature kinds selected")]
    NoFeatures,
    #[error(
        "model \"{model}\" requires temporal-preserving features but none of \
         the selected features keeps the time dimension"
    )]
    MissingTemporalFeature { model: String },
    #[error(
        "feature \"{feature}\" preserves temporal structure but model \
         \"{model}\" cannot consume it"
    )]
    UnexpectedTemporalFeature { model: String, feature: String },
    #[error("no labeled windows could be assembled from the selected sessions")]
    EmptyDataset,
    #[error("ground-truth points disagree on dimensionality ({a} vs {b})")]
    InconsistentTargets { a: usize, b: usize },
    #[error("dataset assembly failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// What to train and from which raw material
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub model_key: String,
    pub feature_keys: Vec<String>,
    pub task: TaskCategory,
    pub params: ParamMap,
}

/// Train a model over every compatible session and package the result.
///
/// Sessions that are unsealed, empty or recorded for another task category
/// are skipped, not rejected; partial sessions contribute whatever data they
/// hold. The artifact is returned unpersisted.
pub fn train(
    registry: &Registry,
    request: &TrainingRequest,
    sessions: &[RecordingSession],
    default_window_len: usize,
) -> Result<ModelArtifact, PipelineError> {
    if request.feature_keys.is_empty() {
        return Err(PipelineError::NoFeatures);
    }

    let kind = registry.get_model(&request.model_key)?;
    let features: Vec<Arc<dyn FeatureKind>> = request
        .feature_keys
        .iter()
        .map(|key| registry.get_feature(key))
        .collect::<Result<_, _>>()?;

    // temporal compatibility is symmetric: a temporal model needs at least
    // one time-preserving feature, a flat model tolerates none
    let temporal = kind.temporal();
    let preserving = request
        .feature_keys
        .iter()
        .zip(&features)
        .find(|(_, f)| f.preserves_temporal_structure());
    match (temporal.requires_temporal_preservation, preserving) {
        (true, None) => {
            return Err(PipelineError::MissingTemporalFeature {
                model: request.model_key.clone(),
            })
        }
        (false, Some((key, _))) => {
            return Err(PipelineError::UnexpectedTemporalFeature {
                model: request.model_key.clone(),
                feature: key.clone(),
            })
        }
        _ => {}
    }

    let window_len = temporal
        .feature_window_size
        .unwrap_or(default_window_len)
        .max(1);

    let mut rows: Vec<(Vec<f32>, Vec<f32>)> = Vec::new();
    let mut channel_count = 0;
    let mut sampling_rate_hz = 0;
    for session in sessions {
        if !session.is_compatible_with(request.task) {
            debug!(id = %session.id, "skipping incompatible session");
            continue;
        }
        channel_count = session.channel_count;
        sampling_rate_hz = session.sampling_rate_hz;

        let labels = session.merged_ground_truth();
        rows.extend(windowed_rows(&session.frames, &labels, window_len, &features));
    }

    if rows.is_empty() {
        return Err(PipelineError::EmptyDataset);
    }
    let target_dim = rows[0].1.len();
    if let Some(bad) = rows.iter().find(|(_, t)| t.len() != target_dim) {
        return Err(PipelineError::InconsistentTargets { a: target_dim, b: bad.1.len() });
    }

    let feature_dim = rows[0].0.len();
    let n = rows.len();
    let mut flat_features = Vec::with_capacity(n * feature_dim);
    let mut flat_targets = Vec::with_capacity(n * target_dim);
    for (f, t) in rows {
        flat_features.extend(f);
        flat_targets.extend(t);
    }
    let dataset = TrainingDataset {
        features: Array2::from_shape_vec((n, feature_dim), flat_features)?,
        targets: Array2::from_shape_vec((n, target_dim), flat_targets)?,
    };

    info!(
        model = %request.model_key,
        windows = dataset.len(),
        window_len,
        "training model"
    );
    let trained = kind.train(&dataset, &request.params)?;
    let blob = trained.save()?;
    let blob_crc32 = ModelArtifact::checksum(&blob);

    Ok(ModelArtifact {
        id: ModelArtifact::new_id(&request.model_key),
        model_key: request.model_key.clone(),
        is_classifier: kind.is_classifier(),
        task: request.task,
        feature_keys: request.feature_keys.clone(),
        window_len,
        temporal,
        channel_count,
        sampling_rate_hz,
        created_at_us: current_timestamp_micros(),
        blob,
        blob_crc32,
    })
}

/// Extract one labeled feature row per non-overlapping full window.
/// Windows without a label at or before their end are dropped.
fn windowed_rows(
    frames: &[SampleFrame],
    labels: &[GroundTruthPoint],
    window_len: usize,
    features: &[Arc<dyn FeatureKind>],
) -> Vec<(Vec<f32>, Vec<f32>)> {
    frames
        .par_chunks_exact(window_len)
        .filter_map(|window| {
            let end = window[window.len() - 1].timestamp_us;
            let target = latest_label_at_or_before(labels, end)?;
            let mut row = Vec::new();
            for feature in features {
                row.extend(feature.extract(window));
            }
            Some((row, target.values.clone()))
        })
        .collect()
}

/// `labels` must be sorted by timestamp
fn latest_label_at_or_before(labels: &[GroundTruthPoint], end: u64) -> Option<&GroundTruthPoint> {
    let idx = labels.partition_point(|p| p.timestamp_us <= end);
    idx.checked_sub(1).map(|i| &labels[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_session(task: TaskCategory, segments: &[(f32, f32)]) -> RecordingSession {
        // each segment is (signal level, label) and spans 100 frames
        let mut session = RecordingSession::new(task, vec!["vhi".to_string()], 1, 2000);
        let mut t = 0u64;
        for &(level, label) in segments {
            session.push_ground_truth(
                "vhi",
                vec![GroundTruthPoint { timestamp_us: t, values: vec![label] }],
            );
            let frames: Vec<SampleFrame> = (0..100)
                .map(|i| SampleFrame { timestamp_us: t + i * 500, channels: vec![level] })
                .collect();
            session.push_frames(frames);
            t += 100 * 500;
        }
        session.seal(false);
        session
    }

    fn request(model_key: &str, feature_keys: &[&str]) -> TrainingRequest {
        TrainingRequest {
            model_key: model_key.to_string(),
            feature_keys: feature_keys.iter().map(|s| s.to_string()).collect(),
            task: TaskCategory::HandGestures,
            params: ParamMap::new(),
        }
    }

    #[test]
    fn test_trains_classifier_from_sessions() {
        let registry = Registry::with_defaults();
        let session =
            labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0), (2.0, 1.0), (0.1, 0.0)]);

        let artifact =
            train(&registry, &request("centroid_classifier", &["rms"]), &[session], 32).unwrap();

        assert!(artifact.is_classifier);
        assert!(artifact.integrity_ok());
        assert_eq!(artifact.window_len, 32);
        assert_eq!(artifact.feature_keys, vec!["rms".to_string()]);
        assert!(!artifact.blob.is_empty());

        // the blob rehydrates into a working model
        let kind = registry.get_model("centroid_classifier").unwrap();
        let mut model = kind.load(&artifact.blob).unwrap();
        assert_eq!(model.predict(&[0.1]).unwrap(), vec![0.0]);
        assert_eq!(model.predict(&[2.0]).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_temporal_model_needs_preserving_feature() {
        let registry = Registry::with_defaults();
        let session = labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0)]);

        let err = train(
            &registry,
            &request("temporal_centroid_classifier", &["rms"]),
            &[session],
            32,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingTemporalFeature { .. }));
    }

    #[test]
    fn test_flat_model_rejects_preserving_feature() {
        let registry = Registry::with_defaults();
        let session = labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0)]);

        let err = train(
            &registry,
            &request("centroid_classifier", &["rms", "windowed_rms"]),
            &[session],
            32,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnexpectedTemporalFeature { ref feature, .. }
                if feature == "windowed_rms"
        ));
    }

    #[test]
    fn test_temporal_window_comes_from_model_metadata() {
        let registry = Registry::with_defaults();
        let session = labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0), (2.0, 1.0)]);

        let artifact = train(
            &registry,
            &request("temporal_centroid_classifier", &["windowed_rms"]),
            &[session],
            64,
        )
        .unwrap();
        // 16 from the model kind, not the 64 passed as default
        assert_eq!(artifact.window_len, 16);
        assert!(artifact.temporal.requires_temporal_preservation);
    }

    #[test]
    fn test_unlabeled_windows_are_dropped() {
        let registry = Registry::with_defaults();
        // frames start before the first ground-truth point
        let mut session =
            RecordingSession::new(TaskCategory::HandGestures, vec!["vhi".to_string()], 1, 2000);
        let frames: Vec<SampleFrame> =
            (0..64).map(|i| SampleFrame { timestamp_us: i * 500, channels: vec![0.5] }).collect();
        session.push_frames(frames);
        session.push_ground_truth(
            "vhi",
            vec![GroundTruthPoint { timestamp_us: 60 * 500, values: vec![1.0] }],
        );
        session.seal(false);

        let artifact =
            train(&registry, &request("centroid_classifier", &["rms"]), &[session], 32).unwrap();
        // only the second window ends after the label
        let kind = registry.get_model("centroid_classifier").unwrap();
        let mut model = kind.load(&artifact.blob).unwrap();
        assert_eq!(model.predict(&[0.5]).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let registry = Registry::with_defaults();

        // no sessions at all
        let err =
            train(&registry, &request("centroid_classifier", &["rms"]), &[], 32).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDataset));

        // a session for the wrong task is skipped, not used
        let other = labeled_session(TaskCategory::CursorDirections, &[(0.1, 0.0)]);
        let err = train(&registry, &request("centroid_classifier", &["rms"]), &[other], 32)
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDataset));
    }

    #[test]
    fn test_no_features_is_an_error() {
        let registry = Registry::with_defaults();
        let session = labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0)]);
        let err =
            train(&registry, &request("centroid_classifier", &[]), &[session], 32).unwrap_err();
        assert!(matches!(err, PipelineError::NoFeatures));
    }

    #[test]
    fn test_partial_sessions_still_contribute() {
        let registry = Registry::with_defaults();
        let mut session =
            labeled_session(TaskCategory::HandGestures, &[(0.1, 0.0), (2.0, 1.0)]);
        session.partial = true;

        let artifact =
            train(&registry, &request("centroid_classifier", &["rms"]), &[session], 32).unwrap();
        assert!(artifact.integrity_ok());
    }
}

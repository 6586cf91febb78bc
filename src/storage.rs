// src/storage.rs
//! Filesystem persistence for sessions and trained model artifacts
//!
//! One JSON document per item, written atomically (temp file + rename) so a
//! crash mid-save never leaves a corrupt item visible. Items are deletable
//! independently.

use crate::online::PredictionLog;
use crate::registry::kinds::TemporalRequirements;
use crate::session::RecordingSession;
use crate::types::{current_timestamp_micros, TaskCategory};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Persisted trained-model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub id: String,
    /// Registry key of the model kind that produced the blob
    pub model_key: String,
    pub is_classifier: bool,
    pub task: TaskCategory,
    /// Feature keys and window configuration used at train time
    pub feature_keys: Vec<String>,
    pub window_len: usize,
    pub temporal: TemporalRequirements,
    pub channel_count: usize,
    pub sampling_rate_hz: u32,
    pub created_at_us: u64,
    /// Serialized model parameters
    pub blob: Vec<u8>,
    pub blob_crc32: u32,
}

impl ModelArtifact {
    pub fn new_id(model_key: &str) -> String {
        format!("model_{}_{}_{:04x}", model_key, current_timestamp_micros(), rand::random::<u16>())
    }

    pub fn checksum(blob: &[u8]) -> u32 {
        crc32fast::hash(blob)
    }

    pub fn integrity_ok(&self) -> bool {
        Self::checksum(&self.blob) == self.blob_crc32
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("prediction log not found: {0}")]
    PredictionLogNotFound(String),
    #[error("artifact blob failed integrity check: {0}")]
    CorruptArtifact(String),
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io { path: path.to_path_buf(), source }
}

/// Local filesystem store for sessions and artifacts
pub struct Storage {
    sessions_dir: PathBuf,
    models_dir: PathBuf,
    predictions_dir: PathBuf,
}

impl Storage {
    /// Open (creating directories as needed) a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let sessions_dir = root.join("sessions");
        let models_dir = root.join("models");
        let predictions_dir = root.join("predictions");
        fs::create_dir_all(&sessions_dir).map_err(|e| io_err(&sessions_dir, e))?;
        fs::create_dir_all(&models_dir).map_err(|e| io_err(&models_dir, e))?;
        fs::create_dir_all(&predictions_dir).map_err(|e| io_err(&predictions_dir, e))?;
        Ok(Self { sessions_dir, models_dir, predictions_dir })
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
        tmp.write_all(bytes).map_err(|e| io_err(path, e))?;
        tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
        tmp.persist(path).map_err(|e| io_err(path, e.error))?;
        Ok(())
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.models_dir.join(format!("{id}.json"))
    }

    pub fn save_session(&self, session: &RecordingSession) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(session)?;
        self.write_atomic(&self.session_path(&session.id), &bytes)
    }

    pub fn load_session(&self, id: &str) -> Result<RecordingSession, StorageError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        fs::remove_file(&path).map_err(|e| io_err(&path, e))
    }

    pub fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        self.list_ids(&self.sessions_dir)
    }

    /// Load every persisted session; unreadable files are skipped with a
    /// warning rather than failing the whole listing
    pub fn load_all_sessions(&self) -> Result<Vec<RecordingSession>, StorageError> {
        let mut sessions = Vec::new();
        for id in self.list_session_ids()? {
            match self.load_session(&id) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by_key(|s| s.created_at_us);
        Ok(sessions)
    }

    pub fn save_artifact(&self, artifact: &ModelArtifact) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(artifact)?;
        self.write_atomic(&self.artifact_path(&artifact.id), &bytes)
    }

    /// Load an artifact and verify blob integrity
    pub fn load_artifact(&self, id: &str) -> Result<ModelArtifact, StorageError> {
        let path = self.artifact_path(id);
        if !path.exists() {
            return Err(StorageError::ArtifactNotFound(id.to_string()));
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
        if !artifact.integrity_ok() {
            return Err(StorageError::CorruptArtifact(id.to_string()));
        }
        Ok(artifact)
    }

    pub fn delete_artifact(&self, id: &str) -> Result<(), StorageError> {
        let path = self.artifact_path(id);
        if !path.exists() {
            return Err(StorageError::ArtifactNotFound(id.to_string()));
        }
        fs::remove_file(&path).map_err(|e| io_err(&path, e))
    }

    pub fn list_artifact_ids(&self) -> Result<Vec<String>, StorageError> {
        self.list_ids(&self.models_dir)
    }

    pub fn save_prediction_log(&self, log: &PredictionLog) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(log)?;
        self.write_atomic(&self.predictions_dir.join(format!("{}.json", log.id)), &bytes)
    }

    pub fn load_prediction_log(&self, id: &str) -> Result<PredictionLog, StorageError> {
        let path = self.predictions_dir.join(format!("{id}.json"));
        if !path.exists() {
            return Err(StorageError::PredictionLogNotFound(id.to_string()));
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list_prediction_log_ids(&self) -> Result<Vec<String>, StorageError> {
        self.list_ids(&self.predictions_dir)
    }

    fn list_ids(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RecordingSession;
    use crate::types::SampleFrame;

    fn sample_session() -> RecordingSession {
        let mut session = RecordingSession::new(TaskCategory::HandGestures, vec![], 2, 2000);
        session.push_frames(vec![SampleFrame { timestamp_us: 1, channels: vec![0.1, 0.2] }]);
        session.seal(false);
        session
    }

    fn sample_artifact() -> ModelArtifact {
        let blob = b"{\"weights\":[1,2,3]}".to_vec();
        let blob_crc32 = ModelArtifact::checksum(&blob);
        ModelArtifact {
            id: ModelArtifact::new_id("centroid_classifier"),
            model_key: "centroid_classifier".to_string(),
            is_classifier: true,
            task: TaskCategory::HandGestures,
            feature_keys: vec!["rms".to_string()],
            window_len: 1,
            temporal: TemporalRequirements::default(),
            channel_count: 2,
            sampling_rate_hz: 2000,
            created_at_us: current_timestamp_micros(),
            blob,
            blob_crc32,
        }
    }

    #[test]
    fn test_session_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let session = sample_session();
        storage.save_session(&session).unwrap();
        let loaded = storage.load_session(&session.id).unwrap();
        assert_eq!(loaded, session);

        storage.delete_session(&session.id).unwrap();
        assert!(matches!(
            storage.load_session(&session.id),
            Err(StorageError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let artifact = sample_artifact();
        storage.save_artifact(&artifact).unwrap();
        let loaded = storage.load_artifact(&artifact.id).unwrap();
        assert_eq!(loaded, artifact);
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let mut artifact = sample_artifact();
        artifact.blob_crc32 ^= 0xdead_beef;
        storage.save_artifact(&artifact).unwrap();

        assert!(matches!(
            storage.load_artifact(&artifact.id),
            Err(StorageError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn test_independent_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let a = sample_session();
        let b = sample_session();
        storage.save_session(&a).unwrap();
        storage.save_session(&b).unwrap();

        storage.delete_session(&a.id).unwrap();
        assert!(storage.load_session(&b.id).is_ok());
        assert_eq!(storage.list_session_ids().unwrap(), vec![b.id.clone()]);
    }

    #[test]
    fn test_prediction_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let log = PredictionLog {
            id: "predictions_1_000a".to_string(),
            artifact_id: "model_x".to_string(),
            task: TaskCategory::CursorDirections,
            started_at_us: 1,
            predictions: vec![crate::types::FilteredPrediction {
                sequence: 0,
                timestamp_us: 10,
                task: TaskCategory::CursorDirections,
                values: vec![0.5, -0.5],
            }],
        };
        storage.save_prediction_log(&log).unwrap();
        assert_eq!(storage.load_prediction_log(&log.id).unwrap(), log);
        assert_eq!(storage.list_prediction_log_ids().unwrap(), vec![log.id.clone()]);
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert!(matches!(
            storage.load_artifact("model_none"),
            Err(StorageError::ArtifactNotFound(_))
        ));
    }
}

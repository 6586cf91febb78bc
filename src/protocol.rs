// src/protocol.rs
//! Record / Train / Online phase state machine
//!
//! The protocol owns the transitions between the four phases and the
//! background tasks each long-running phase spawns. At most one phase other
//! than `Idle` is active at any time; a transition attempted while another
//! phase runs fails with [`ProtocolError::Busy`] instead of queueing.

use crate::bridge::{BridgeError, ConnectionState, VisualInterfaceBridge};
use crate::config::SystemConfig;
use crate::device::DeviceInterface;
use crate::online::queue::SampleQueue;
use crate::online::{OnlineError, OnlineLoop, OnlineMetrics, OnlineMetricsSnapshot, OnlinePipeline};
use crate::registry::{Registry, RegistryError};
use crate::session::RecordingSession;
use crate::storage::{ModelArtifact, Storage, StorageError};
use crate::training::{self, PipelineError, TrainingRequest};
use crate::types::TaskCategory;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Recording,
    Training,
    Online,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Recording => "recording",
            Phase::Training => "training",
            Phase::Online => "online",
        };
        write!(f, "{name}")
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol is busy: phase is {0}")]
    Busy(Phase),
    #[error("no {0} phase is running")]
    NotRunning(Phase),
    #[error("device is not connected")]
    DeviceNotConnected,
    #[error("no connected visual interface serves task {0}")]
    InterfaceNotReady(TaskCategory),
    #[error("no sealed recording session is compatible with task {0}")]
    NoTrainingData(TaskCategory),
    #[error("training failed: {source}")]
    TrainingFailed {
        #[source]
        source: PipelineError,
    },
    #[error("no trained model artifact \"{0}\"")]
    NoModelLoaded(String),
    #[error("online session has neither an output system nor a streaming interface")]
    NoOutputTarget,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Online(#[from] OnlineError),
    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    Run,
    Stop,
    Abort,
}

struct RecordingTask {
    stop: watch::Sender<StopKind>,
    handle: JoinHandle<Result<RecordingSession, StorageError>>,
}

struct OnlineTask {
    stop: watch::Sender<bool>,
    queue: Arc<SampleQueue>,
    metrics: Arc<OnlineMetrics>,
    pump: JoinHandle<()>,
    inference: JoinHandle<Option<crate::online::PredictionLog>>,
    streaming_interfaces: Vec<String>,
}

/// What an online session did, reported at stop time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineReport {
    pub metrics: OnlineMetricsSnapshot,
    /// Id of the persisted prediction log, when capture was enabled
    pub prediction_log_id: Option<String>,
}

/// The record/train/online coordinator
pub struct Protocol {
    registry: Arc<Registry>,
    bridge: Arc<VisualInterfaceBridge>,
    storage: Arc<Storage>,
    config: SystemConfig,
    phase: Mutex<Phase>,
    recording: Mutex<Option<RecordingTask>>,
    online: Mutex<Option<OnlineTask>>,
}

impl Protocol {
    /// Build the coordinator, opening storage under the configured root
    pub fn new(registry: Arc<Registry>, config: SystemConfig) -> Result<Self, ProtocolError> {
        let storage = Arc::new(Storage::open(&config.storage.root_dir)?);
        let bridge =
            Arc::new(VisualInterfaceBridge::new(registry.clone(), config.bridge.clone()));
        Ok(Self {
            registry,
            bridge,
            storage,
            config,
            phase: Mutex::new(Phase::Idle),
            recording: Mutex::new(None),
            online: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn bridge(&self) -> &Arc<VisualInterfaceBridge> {
        &self.bridge
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Atomically leave `Idle` for `next`
    fn begin(&self, next: Phase) -> Result<(), ProtocolError> {
        let mut phase = self.phase.lock();
        if *phase != Phase::Idle {
            return Err(ProtocolError::Busy(*phase));
        }
        *phase = next;
        Ok(())
    }

    fn finish(&self) {
        *self.phase.lock() = Phase::Idle;
    }

    /// Start capturing device frames and ground truth into a new session.
    ///
    /// Requires a connected device and at least one active visual interface
    /// for `task`. The capture task runs until `stop_recording`,
    /// `abort_recording` or a device failure; a failure seals the session as
    /// partial but never discards it.
    pub async fn start_recording(
        &self,
        task: TaskCategory,
        mut device: Box<dyn DeviceInterface>,
    ) -> Result<(), ProtocolError> {
        self.begin(Phase::Recording)?;

        let started = (|| {
            if !device.is_connected() {
                return Err(ProtocolError::DeviceNotConnected);
            }
            let interfaces = self.bridge.active_names_for(task);
            if interfaces.is_empty() {
                return Err(ProtocolError::InterfaceNotReady(task));
            }
            // an instance whose peer went away is active but useless here
            for name in &interfaces {
                match self.bridge.connection_state(name) {
                    Some(ConnectionState::Connected) | Some(ConnectionState::Streaming) => {}
                    _ => return Err(ProtocolError::InterfaceNotReady(task)),
                }
            }
            Ok(interfaces)
        })();
        let interfaces = match started {
            Ok(interfaces) => interfaces,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };

        let mut session = RecordingSession::new(
            task,
            interfaces.clone(),
            device.channel_count(),
            device.sampling_rate_hz(),
        );
        info!(id = %session.id, %task, "recording started");

        let (stop_tx, mut stop_rx) = watch::channel(StopKind::Run);
        let bridge = self.bridge.clone();
        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let mut partial = false;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        match *stop_rx.borrow() {
                            StopKind::Run => continue,
                            StopKind::Stop => break,
                            StopKind::Abort => {
                                partial = true;
                                break;
                            }
                        }
                    }
                    result = device.next_batch() => match result {
                        Ok(batch) => {
                            session.push_frames(batch.frames);
                            for name in &interfaces {
                                if let Ok(points) = bridge.collect_ground_truth(name) {
                                    session.push_ground_truth(name, points);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "device failed mid-recording, sealing partial");
                            partial = true;
                            break;
                        }
                    }
                }
            }
            // final sweep so labels sent during the last batch survive
            for name in &interfaces {
                if let Ok(points) = bridge.collect_ground_truth(name) {
                    session.push_ground_truth(name, points);
                }
            }
            session.seal(partial);
            storage.save_session(&session)?;
            info!(id = %session.id, frames = session.frame_count(), partial, "session sealed");
            Ok(session)
        });

        *self.recording.lock() = Some(RecordingTask { stop: stop_tx, handle });
        Ok(())
    }

    /// Stop the running recording and return the sealed, persisted session
    pub async fn stop_recording(&self) -> Result<RecordingSession, ProtocolError> {
        self.end_recording(StopKind::Stop).await
    }

    /// Abort the running recording. The truncated session is still sealed
    /// (as partial) and persisted.
    pub async fn abort_recording(&self) -> Result<RecordingSession, ProtocolError> {
        self.end_recording(StopKind::Abort).await
    }

    async fn end_recording(&self, kind: StopKind) -> Result<RecordingSession, ProtocolError> {
        let task = self
            .recording
            .lock()
            .take()
            .ok_or(ProtocolError::NotRunning(Phase::Recording))?;
        let _ = task.stop.send(kind);
        let result = task.handle.await;
        self.finish();
        match result {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ProtocolError::Task(e.to_string())),
        }
    }

    /// Train a model over every compatible persisted session and persist the
    /// resulting artifact. No artifact is written on failure.
    pub async fn train(&self, request: TrainingRequest) -> Result<ModelArtifact, ProtocolError> {
        self.begin(Phase::Training)?;

        let registry = self.registry.clone();
        let storage = self.storage.clone();
        let default_window_len = self.config.recording.default_window_len;
        let result = tokio::task::spawn_blocking(move || {
            let sessions = storage.load_all_sessions()?;
            if !sessions.iter().any(|s| s.is_compatible_with(request.task)) {
                return Err(ProtocolError::NoTrainingData(request.task));
            }
            let artifact = training::train(&registry, &request, &sessions, default_window_len)
                .map_err(|source| ProtocolError::TrainingFailed { source })?;
            storage.save_artifact(&artifact)?;
            Ok::<_, ProtocolError>(artifact)
        })
        .await;

        self.finish();
        match result {
            Ok(Ok(artifact)) => {
                info!(id = %artifact.id, "artifact trained and persisted");
                Ok(artifact)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ProtocolError::Task(e.to_string())),
        }
    }

    /// Load an artifact and run the online inference loop against the device.
    ///
    /// Every active visual interface serving the artifact's task is flipped
    /// to `Streaming`; predictions also fan out to the named output systems.
    pub async fn start_online(
        &self,
        artifact_id: &str,
        filter_keys: &[String],
        output_keys: &[String],
        mut device: Box<dyn DeviceInterface>,
    ) -> Result<(), ProtocolError> {
        self.begin(Phase::Online)?;

        let started: Result<OnlineTask, ProtocolError> = async {
            let artifact = match self.storage.load_artifact(artifact_id) {
                Ok(artifact) => artifact,
                Err(StorageError::ArtifactNotFound(id)) => {
                    return Err(ProtocolError::NoModelLoaded(id))
                }
                Err(e) => return Err(e.into()),
            };
            if !device.is_connected() {
                return Err(ProtocolError::DeviceNotConnected);
            }

            let pipeline = OnlinePipeline::build(&self.registry, &artifact, filter_keys)?;

            let mut sinks = Vec::with_capacity(output_keys.len());
            for key in output_keys {
                sinks.push(self.registry.get_output_system(key)?);
            }
            let streaming_interfaces = self.bridge.active_names_for(artifact.task);
            if sinks.is_empty() && streaming_interfaces.is_empty() {
                return Err(ProtocolError::NoOutputTarget);
            }
            for name in &streaming_interfaces {
                self.bridge.set_streaming(name, true)?;
            }

            let queue = Arc::new(SampleQueue::new(self.config.online.sample_queue_len));
            let metrics = Arc::new(OnlineMetrics::default());
            let (stop_tx, mut stop_rx) = watch::channel(false);

            let pump_queue = queue.clone();
            let pump = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        result = device.next_batch() => match result {
                            Ok(batch) => pump_queue.push(batch),
                            Err(e) => {
                                warn!(error = %e, "device failed mid-online, stopping pump");
                                break;
                            }
                        }
                    }
                }
                pump_queue.close();
            });

            let online_loop = OnlineLoop::new(
                pipeline,
                queue.clone(),
                self.bridge.clone(),
                sinks,
                metrics.clone(),
                self.config.online.record_predictions,
                &artifact.id,
            );
            let inference = tokio::spawn(online_loop.run());

            info!(artifact = %artifact.id, "online session started");
            Ok(OnlineTask { stop: stop_tx, queue, metrics, pump, inference, streaming_interfaces })
        }
        .await;

        match started {
            Ok(task) => {
                *self.online.lock() = Some(task);
                Ok(())
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    /// Stop the online session. Interfaces return to `Connected` but stay
    /// active; their connections are reusable for the next phase.
    pub async fn stop_online(&self) -> Result<OnlineReport, ProtocolError> {
        let task =
            self.online.lock().take().ok_or(ProtocolError::NotRunning(Phase::Online))?;

        let _ = task.stop.send(true);
        let _ = task.pump.await;
        let log = match task.inference.await {
            Ok(log) => log,
            Err(e) => {
                self.finish();
                return Err(ProtocolError::Task(e.to_string()));
            }
        };

        for name in &task.streaming_interfaces {
            let _ = self.bridge.set_streaming(name, false);
        }

        let prediction_log_id = match log {
            Some(log) => {
                self.storage.save_prediction_log(&log)?;
                Some(log.id)
            }
            None => None,
        };

        let metrics = task.metrics.snapshot(&task.queue);
        self.finish();
        info!(
            predictions = metrics.predictions_dispatched,
            dropped = metrics.batches_dropped,
            "online session stopped"
        );
        Ok(OnlineReport { metrics, prediction_log_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SignalSimulator, SimulatorConfig};
    use crate::session::RecordingSession;
    use crate::types::{GroundTruthPoint, SampleFrame};
    use std::time::Duration;

    fn test_protocol(root: &std::path::Path) -> Protocol {
        let registry = Arc::new(Registry::with_defaults());
        let config = SystemConfig {
            storage: crate::config::StorageConfig { root_dir: root.to_path_buf() },
            ..Default::default()
        };
        Protocol::new(registry, config).unwrap()
    }

    fn paced_device() -> Box<dyn DeviceInterface> {
        Box::new(SignalSimulator::new(SimulatorConfig {
            channels: 1,
            paced: true,
            ..Default::default()
        }))
    }

    fn seeded_session() -> RecordingSession {
        let mut session =
            RecordingSession::new(TaskCategory::HandGestures, vec!["vhi".to_string()], 1, 2000);
        let mut frames = Vec::new();
        for i in 0..200u64 {
            let level = if i < 100 { 0.1 } else { 2.0 };
            frames.push(SampleFrame { timestamp_us: i * 500, channels: vec![level] });
        }
        session.push_frames(frames);
        session.push_ground_truth(
            "vhi",
            vec![
                GroundTruthPoint { timestamp_us: 0, values: vec![0.0] },
                GroundTruthPoint { timestamp_us: 100 * 500, values: vec![1.0] },
            ],
        );
        session.seal(false);
        session
    }

    fn classifier_request() -> TrainingRequest {
        TrainingRequest {
            model_key: "centroid_classifier".to_string(),
            feature_keys: vec!["rms".to_string()],
            task: TaskCategory::HandGestures,
            params: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_recording_requires_an_interface() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());

        let err = protocol
            .start_recording(TaskCategory::HandGestures, paced_device())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InterfaceNotReady(_)));
        // failed start leaves the protocol usable
        assert_eq!(protocol.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_train_then_online_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());
        protocol.storage().save_session(&seeded_session()).unwrap();

        let artifact = protocol.train(classifier_request()).await.unwrap();
        assert_eq!(protocol.phase(), Phase::Idle);
        assert!(artifact.is_classifier);
        assert!(protocol.storage().load_artifact(&artifact.id).is_ok());

        protocol
            .start_online(&artifact.id, &[], &["console_log".to_string()], paced_device())
            .await
            .unwrap();
        assert_eq!(protocol.phase(), Phase::Online);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = protocol.stop_online().await.unwrap();
        assert_eq!(protocol.phase(), Phase::Idle);
        assert!(report.metrics.predictions_dispatched > 0);
        assert_eq!(report.metrics.frames_processed, report.metrics.predictions_dispatched);
    }

    #[tokio::test]
    async fn test_busy_guard_rejects_overlapping_phases() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());
        protocol.storage().save_session(&seeded_session()).unwrap();
        let artifact = protocol.train(classifier_request()).await.unwrap();

        protocol
            .start_online(&artifact.id, &[], &["console_log".to_string()], paced_device())
            .await
            .unwrap();

        let err = protocol.train(classifier_request()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Busy(Phase::Online)));
        let err = protocol
            .start_recording(TaskCategory::HandGestures, paced_device())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Busy(Phase::Online)));

        protocol.stop_online().await.unwrap();
    }

    #[tokio::test]
    async fn test_online_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());
        let err = protocol
            .start_online("model_missing", &[], &["console_log".to_string()], paced_device())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoModelLoaded(_)));
        assert_eq!(protocol.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_online_without_any_target() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());
        protocol.storage().save_session(&seeded_session()).unwrap();
        let artifact = protocol.train(classifier_request()).await.unwrap();

        let err = protocol
            .start_online(&artifact.id, &[], &[], paced_device())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoOutputTarget));
        assert_eq!(protocol.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_training_without_compatible_session() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());

        // no sessions persisted at all
        let err = protocol.train(classifier_request()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoTrainingData(TaskCategory::HandGestures)));
        assert_eq!(protocol.phase(), Phase::Idle);
        assert!(protocol.storage().list_artifact_ids().unwrap().is_empty());

        // a session for another task does not count as training data
        let mut other = RecordingSession::new(TaskCategory::CursorDirections, vec![], 1, 2000);
        other.push_frames(vec![SampleFrame { timestamp_us: 1, channels: vec![0.1] }]);
        other.seal(false);
        protocol.storage().save_session(&other).unwrap();

        let err = protocol.train(classifier_request()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoTrainingData(_)));
        assert_eq!(protocol.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_training_failure_is_wrapped_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());

        // compatible session, but without a single ground-truth label the
        // pipeline cannot assemble a dataset
        let mut unlabeled =
            RecordingSession::new(TaskCategory::HandGestures, vec!["vhi".to_string()], 1, 2000);
        let frames: Vec<SampleFrame> =
            (0..64).map(|i| SampleFrame { timestamp_us: i * 500, channels: vec![0.1] }).collect();
        unlabeled.push_frames(frames);
        unlabeled.seal(false);
        protocol.storage().save_session(&unlabeled).unwrap();

        let err = protocol.train(classifier_request()).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TrainingFailed { source: PipelineError::EmptyDataset }
        ));
        assert_eq!(protocol.phase(), Phase::Idle);
        // no partial artifact is left behind
        assert!(protocol.storage().list_artifact_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_running_phase() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = test_protocol(dir.path());
        assert!(matches!(
            protocol.stop_recording().await,
            Err(ProtocolError::NotRunning(Phase::Recording))
        ));
        assert!(matches!(
            protocol.stop_online().await,
            Err(ProtocolError::NotRunning(Phase::Online))
        ));
    }
}

// src/bridge/mod.rs
//! Visual interface bridge
//!
//! Owns the full lifecycle of zero or more concurrently active external
//! feedback processes. Each instance gets its own UDP socket, its own
//! supervised tokio task and its own bounded buffers, so a stall or crash
//! of one instance never blocks data flow to any other.

pub mod messages;

use crate::config::BridgeConfig;
use crate::registry::{Registry, RegistryError};
use crate::types::{FilteredPrediction, GroundTruthPoint, TaskCategory};
use crossbeam::queue::ArrayQueue;
use messages::{Frame, MAX_DATAGRAM_LEN};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of one visual interface instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("visual interface \"{0}\" is already active")]
    AlreadyActive(String),
    #[error("visual interface \"{0}\" is not active")]
    NotActive(String),
    #[error("handshake with \"{name}\" timed out after {waited_ms} ms")]
    HandshakeTimeout { name: String, waited_ms: u64 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("transport error for \"{name}\": {source}")]
    Transport {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch process for \"{name}\": {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("wire encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-activation overrides on top of the registered descriptor
#[derive(Debug, Clone, Default)]
pub struct ActivateConfig {
    /// Override the descriptor's endpoint (useful for tests and multi-host
    /// deployments)
    pub endpoint: Option<SocketAddr>,
    /// Attach to an externally pre-launched process instead of spawning one
    pub attach_external: bool,
    pub handshake_timeout: Option<Duration>,
}

struct Instance {
    name: String,
    task_category: TaskCategory,
    endpoint: SocketAddr,
    state: RwLock<ConnectionState>,
    outbound: mpsc::Sender<Frame>,
    dropped_frames: AtomicU64,
    ground_truth: ArrayQueue<GroundTruthPoint>,
    ground_truth_dropped: AtomicU64,
    stop: watch::Sender<bool>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

/// Manager for all active visual interface instances
pub struct VisualInterfaceBridge {
    registry: Arc<Registry>,
    config: BridgeConfig,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    /// Names with an activation handshake in flight
    pending: Mutex<HashSet<String>>,
}

/// Releases a pending-activation name on every exit path
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.name);
    }
}

impl VisualInterfaceBridge {
    pub fn new(registry: Arc<Registry>, config: BridgeConfig) -> Self {
        Self {
            registry,
            config,
            instances: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Launch (or attach to) the named interface, perform the handshake and
    /// transition it to `Connected`.
    ///
    /// On handshake timeout the socket is closed, an owned process is
    /// terminated and the instance is NOT added, so a retry stays possible.
    pub async fn activate(&self, name: &str, config: ActivateConfig) -> Result<(), BridgeError> {
        // reserve the name before the handshake await; a concurrent activate
        // for the same name fails fast instead of racing to insert
        let _reservation = {
            let instances = self.instances.read();
            let mut pending = self.pending.lock();
            if instances.contains_key(name) || !pending.insert(name.to_string()) {
                return Err(BridgeError::AlreadyActive(name.to_string()));
            }
            Reservation { pending: &self.pending, name: name.to_string() }
        };

        let descriptor = self.registry.get_visual_interface(name)?;
        let endpoint = config.endpoint.unwrap_or(descriptor.endpoint);
        let timeout = config
            .handshake_timeout
            .unwrap_or(Duration::from_millis(self.config.handshake_timeout_ms));
        let retry = Duration::from_millis(self.config.handshake_retry_ms.max(1));

        let mut child = None;
        if !config.attach_external {
            if let Some(launch) = &descriptor.launch {
                child = Some(
                    Command::new(&launch.program)
                        .args(&launch.args)
                        .kill_on_drop(true)
                        .spawn()
                        .map_err(|e| BridgeError::Launch {
                            name: name.to_string(),
                            source: e,
                        })?,
                );
            }
        }

        let socket = UdpSocket::bind("127.0.0.1:0").await.map_err(|e| BridgeError::Transport {
            name: name.to_string(),
            source: e,
        })?;

        if let Err(e) = handshake(&socket, endpoint, timeout, retry).await {
            if let Some(mut owned) = child {
                let _ = owned.start_kill();
            }
            return Err(match e {
                HandshakeFailure::TimedOut => BridgeError::HandshakeTimeout {
                    name: name.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                },
                HandshakeFailure::Io(source) => {
                    BridgeError::Transport { name: name.to_string(), source }
                }
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_len);
        let (stop_tx, stop_rx) = watch::channel(false);
        let instance = Arc::new(Instance {
            name: name.to_string(),
            task_category: descriptor.task_category,
            endpoint,
            state: RwLock::new(ConnectionState::Connected),
            outbound: outbound_tx,
            dropped_frames: AtomicU64::new(0),
            ground_truth: ArrayQueue::new(self.config.ground_truth_buffer_len),
            ground_truth_dropped: AtomicU64::new(0),
            stop: stop_tx,
            io_task: Mutex::new(None),
            child: Mutex::new(child),
        });

        let handle = tokio::spawn(run_io(instance.clone(), socket, outbound_rx, stop_rx));
        *instance.io_task.lock() = Some(handle);
        self.instances.write().insert(name.to_string(), instance);
        info!(name, %endpoint, "visual interface activated");
        Ok(())
    }

    /// Deactivate the named interface; no-op when it is not active
    pub async fn deactivate(&self, name: &str) -> Result<(), BridgeError> {
        let instance = match self.instances.write().remove(name) {
            Some(instance) => instance,
            None => return Ok(()),
        };

        let _ = instance.stop.send(true);
        let handle = instance.io_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let child = instance.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
        *instance.state.write() = ConnectionState::Disconnected;
        info!(name, "visual interface deactivated");
        Ok(())
    }

    /// Deactivate every active interface
    pub async fn deactivate_all(&self) {
        let names: Vec<String> = self.instances.read().keys().cloned().collect();
        for name in names {
            let _ = self.deactivate(&name).await;
        }
    }

    /// Non-blocking enqueue of a control-output payload. Delivery is best
    /// effort: the payload is dropped (and counted) unless the instance is
    /// in `Streaming` state and its queue has room.
    pub fn send_output(
        &self,
        name: &str,
        prediction: &FilteredPrediction,
    ) -> Result<(), BridgeError> {
        let instance = self
            .instances
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotActive(name.to_string()))?;

        if *instance.state.read() != ConnectionState::Streaming {
            instance.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let frame =
            Frame::Output { task: prediction.task, values: prediction.values.clone() };
        if instance.outbound.try_send(frame).is_err() {
            instance.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drain the ground-truth points received from the named instance since
    /// the last read
    pub fn collect_ground_truth(
        &self,
        name: &str,
    ) -> Result<Vec<GroundTruthPoint>, BridgeError> {
        let instance = self
            .instances
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotActive(name.to_string()))?;

        let mut points = Vec::new();
        while let Some(point) = instance.ground_truth.pop() {
            points.push(point);
        }
        Ok(points)
    }

    /// Flip an instance between `Connected` and `Streaming`. Instances in
    /// any other state are left unchanged.
    pub fn set_streaming(&self, name: &str, streaming: bool) -> Result<(), BridgeError> {
        let instance = self
            .instances
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotActive(name.to_string()))?;

        let mut state = instance.state.write();
        *state = match (*state, streaming) {
            (ConnectionState::Connected, true) => ConnectionState::Streaming,
            (ConnectionState::Streaming, false) => ConnectionState::Connected,
            (other, _) => other,
        };
        Ok(())
    }

    pub fn connection_state(&self, name: &str) -> Option<ConnectionState> {
        self.instances.read().get(name).map(|i| *i.state.read())
    }

    pub fn task_category(&self, name: &str) -> Option<TaskCategory> {
        self.instances.read().get(name).map(|i| i.task_category)
    }

    pub fn dropped_frames(&self, name: &str) -> Option<u64> {
        self.instances.read().get(name).map(|i| i.dropped_frames.load(Ordering::Relaxed))
    }

    pub fn dropped_ground_truth(&self, name: &str) -> Option<u64> {
        self.instances.read().get(name).map(|i| i.ground_truth_dropped.load(Ordering::Relaxed))
    }

    /// Names of all active instances, unordered
    pub fn active_names(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    /// Names of active instances serving the given task category
    pub fn active_names_for(&self, task: TaskCategory) -> Vec<String> {
        self.instances
            .read()
            .iter()
            .filter(|(_, i)| i.task_category == task)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

enum HandshakeFailure {
    TimedOut,
    Io(std::io::Error),
}

/// Send handshake probes until an ack with the matching token arrives or
/// the deadline passes
async fn handshake(
    socket: &UdpSocket,
    endpoint: SocketAddr,
    timeout: Duration,
    retry: Duration,
) -> Result<(), HandshakeFailure> {
    let token = rand::random::<u32>();
    let probe = Frame::Handshake { token }
        .encode()
        .map_err(|e| HandshakeFailure::Io(std::io::Error::other(e)))?;

    let attempt = async {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        loop {
            socket.send_to(&probe, endpoint).await.map_err(HandshakeFailure::Io)?;
            match tokio::time::timeout(retry, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from == endpoint => {
                    if let Some(Frame::HandshakeAck { token: acked }) = Frame::decode(&buf[..len])
                    {
                        if acked == token {
                            return Ok(());
                        }
                    }
                }
                Ok(Ok(_)) => {} // foreign datagram, keep waiting
                Ok(Err(e)) => return Err(HandshakeFailure::Io(e)),
                Err(_) => {} // retry tick, resend the probe
            }
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeFailure::TimedOut),
    }
}

/// Per-instance transport task: pumps outbound frames and sorts incoming
/// datagrams into the ground-truth buffer
async fn run_io(
    instance: Arc<Instance>,
    socket: UdpSocket,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if let Ok(bytes) = Frame::Shutdown.encode() {
                    let _ = socket.send_to(&bytes, instance.endpoint).await;
                }
                break;
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(frame) => {
                    let sent = match frame.encode() {
                        Ok(bytes) => socket.send_to(&bytes, instance.endpoint).await.is_ok(),
                        Err(_) => false,
                    };
                    if !sent {
                        instance.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            },
            incoming = socket.recv_from(&mut buf) => match incoming {
                Ok((len, _from)) => match Frame::decode(&buf[..len]) {
                    Some(Frame::GroundTruth { values, timestamp_us, .. }) => {
                        let point = GroundTruthPoint { timestamp_us, values };
                        if instance.ground_truth.force_push(point).is_some() {
                            instance.ground_truth_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Some(Frame::Shutdown) => {
                        warn!(name = %instance.name, "peer sent shutdown, marking disconnected");
                        *instance.state.write() = ConnectionState::Disconnected;
                        break;
                    }
                    Some(_) => {}
                    None => debug!(name = %instance.name, "dropping undecodable datagram"),
                },
                Err(e) => {
                    debug!(name = %instance.name, error = %e, "transient receive error");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

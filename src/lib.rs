//! myoctl-core: record/train/online control core for EMG-driven interfaces
//!
//! This library turns raw multi-channel EMG streams into control outputs for
//! external feedback processes. It provides:
//!
//! - A registry of pluggable models, features, filters, visual interfaces
//!   and output systems
//! - A record/train/online protocol state machine
//! - A UDP bridge supervising external visual interface processes
//! - A bounded, drop-oldest online inference loop
//! - Filesystem persistence for sessions and trained model artifacts
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use myoctl_core::config::SystemConfig;
//! use myoctl_core::device::{SignalSimulator, SimulatorConfig};
//! use myoctl_core::protocol::Protocol;
//! use myoctl_core::registry::Registry;
//! use myoctl_core::types::TaskCategory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(Registry::with_defaults());
//!     let protocol = Protocol::new(registry, SystemConfig::default())?;
//!
//!     // connect the virtual hand, then capture a labeled session
//!     protocol.bridge().activate("virtual_hand", Default::default()).await?;
//!     let device = Box::new(SignalSimulator::new(SimulatorConfig::default()));
//!     protocol.start_recording(TaskCategory::HandGestures, device).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     let session = protocol.stop_recording().await?;
//!     println!("recorded {} frames", session.frame_count());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod bridge;
pub mod config;
pub mod device;
pub mod online;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod training;
pub mod types;

// Re-export commonly used types for convenience
pub use bridge::{ConnectionState, VisualInterfaceBridge};
pub use device::{DeviceInterface, SignalSimulator};
pub use protocol::{Phase, Protocol, ProtocolError};
pub use registry::Registry;
pub use session::RecordingSession;
pub use storage::{ModelArtifact, Storage};
pub use training::TrainingRequest;
pub use types::{
    FilteredPrediction, GroundTruthPoint, Prediction, SampleBatch, SampleFrame, TaskCategory,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

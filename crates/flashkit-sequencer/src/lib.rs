//! Update sequencing
//!
//! A [`Sequencer`] drives one update run on one bus:
//!
//! ```text
//! Uninitialized -> FlashloaderActivation -> DeviceInfoRead -> SystemUpdate -> SystemReset -> Done
//! ```
//!
//! `Aborted` can be reached from every in-progress state through the
//! [`AbortSignal`]. Protocol traffic goes through the [`ModernProtocol`] and
//! [`LegacyProtocol`] driver traits; progress is delivered to a
//! [`ProgressObserver`].

pub mod hex;
pub mod mock;
mod node;
mod progress;
mod protocol;
mod sequencer;

pub use hex::{HexError, HexImage, MemoryArea};
pub use node::{
    DeviceDetails, DeviceInfo, LegacyNode, ModernNode, NodeDevice, NodeFailure, NodeStatus,
};
pub use progress::{
    AbortSignal, NoProgress, Phase, PhaseProgress, ProgressObserver, ProgressReport, Step,
    StepResult,
};
pub use protocol::{
    ApplicationBlock, DriverError, DriverResult, FlashBlock, FlashloaderInfo, Fingerprint,
    LegacyDeviceInfo, LegacyProtocol, ModernFeatures, ModernProtocol, NoDriver, NodeAddress,
    Sector,
};
pub use sequencer::{
    ActivationReport, DeviceInfoReport, ResetReport, Sequencer, SequencerState, UpdateReport,
};

use flashkit_system::SystemError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Invalid update configuration: {0}")]
    Config(String),

    #[error("{operation} is not possible in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SequencerState,
    },

    #[error("Flashloader activation failed for node {node}: {failure}")]
    Activation { node: String, failure: NodeFailure },

    #[error("Reading device information failed for node {node}: {failure}")]
    DeviceInfo { node: String, failure: NodeFailure },

    #[error("Update aborted")]
    Aborted,

    #[error("HEX file {path}: {source}")]
    Hex {
        path: PathBuf,
        #[source]
        source: HexError,
    },

    #[error("System definition error: {0}")]
    System(#[from] SystemError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SequenceError>;

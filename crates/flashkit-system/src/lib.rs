//! System definition model for flashkit
//!
//! Describes the buses and nodes of a vehicle network as far as the update core needs
//! them: which flashloader family a node runs, where it is attached, which nodes may
//! route to other buses, and which device definition describes its hardware.
//!
//! # Example
//!
//! ```no_run
//! use flashkit_system::{SystemDefinitionFiler, TomlSystemDefinitionFiler};
//! use std::path::Path;
//!
//! fn main() -> Result<(), flashkit_system::SystemError> {
//!     let system = TomlSystemDefinitionFiler.load(Path::new("system_definition.toml"))?;
//!     for node in &system.nodes {
//!         println!("{} ({:?})", node.name, node.flashloader);
//!     }
//!     Ok(())
//! }
//! ```

pub mod definition;
pub mod device;
pub mod filer;
pub mod flash_job;
pub mod ini;

pub use definition::{
    Bus, BusKind, FlashloaderKind, Node, NodeInterface, Route, RouteHop, SystemDefinition,
};
pub use device::{
    DEVICE_DEFINITION_EXTENSION, DEVICE_DEFINITION_FOLDER, DEVICE_INI_FILE_NAME,
    DeviceDefinition, DeviceEntry, DeviceRegistry, ResetWaitTimes,
};
pub use filer::{SYSTEM_DEFINITION_FILE_NAME, SystemDefinitionFiler, TomlSystemDefinitionFiler};
pub use flash_job::FlashJob;
pub use ini::IniDocument;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invalid system definition: {0}")]
    Invalid(String),

    #[error("Node {node} is not reachable from bus {bus}")]
    Unreachable { node: String, bus: usize },

    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("INI syntax error in line {line}: {message}")]
    Ini { line: usize, message: String },

    #[error("INI entry missing: [{section}] {key}")]
    IniEntryMissing { section: String, key: String },

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// System definition result type
pub type Result<T> = std::result::Result<T, SystemError>;

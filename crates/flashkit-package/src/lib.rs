//! Secure update packages
//!
//! An update package is a zip archive (`.sup`) holding the system definition, the
//! device definitions with their `devices.ini` index, a package manifest and the
//! files for each node. Two layouts exist:
//!
//! - Version 1: node files live in `<Node>/` folders and are listed inline in the
//!   package manifest. One digest covers the whole package and may be signed.
//! - Version 2: every node has its own sub-archive `<Node>.nsup` with its own
//!   manifest. Each sub-archive can be signed and encrypted on its own.
//!
//! [`PackageBuilder`] creates packages, [`PackageLoader`] unpacks and verifies them.

mod archive;
mod builder;
mod loader;
mod manifest;
mod security;
mod xml;

pub use archive::{
    ArchiveError, DEFAULT_COMPRESSION_LEVEL, collect_files, create_zip, create_zip_with_level,
    extract_zip, is_zip,
};
pub use builder::{BuildReport, PackageBuildRequest, PackageBuilder};
pub use loader::{LoadedPackage, PackageLoadRequest, PackageLoader};
pub use manifest::{
    ManifestError, NodeContent, NodeFiles, NodeSubManifest, PackageManifest, PackageNode,
    SUPPORTED_FILE_VERSIONS,
};
pub use security::{PerNodeSecurityConfig, SecurityOptions, expand_per_node};
pub use xml::XmlElement;

use flashkit_crypto::CryptoError;
use flashkit_system::SystemError;
use std::path::PathBuf;
use thiserror::Error;

/// Package file extension
pub const PACKAGE_EXTENSION: &str = "sup";

/// Node sub-archive extension (version 2)
pub const NODE_ARCHIVE_EXTENSION: &str = "nsup";

pub const PACKAGE_MANIFEST_FILE_NAME: &str = "package_manifest.xml";
pub const NODE_MANIFEST_FILE_NAME: &str = "node_manifest.xml";
pub const NODE_SIGNATURE_FILE_NAME: &str = "node_signature.sig";
pub const PACKAGE_SIGNATURE_FILE_NAME: &str = "package_signature.sig";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Invalid package configuration: {0}")]
    Config(String),

    #[error("{what}: got {len} entries, expected 0, 1 or {expected}")]
    ConfigMismatch {
        what: String,
        len: usize,
        expected: usize,
    },

    #[error("No node is active")]
    NoActiveNode,

    #[error("Update order is empty")]
    EmptyUpdateOrder,

    #[error("Got {flags} active flags for {nodes} nodes")]
    ActiveNodeCountMismatch { flags: usize, nodes: usize },

    #[error("Package path must end with .sup: {0}")]
    WrongExtension(PathBuf),

    #[error("Package already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Input file missing: {0}")]
    MissingFile(PathBuf),

    #[error("Corrupt package: {0}")]
    CorruptPackage(String),

    #[error("Archive of node {node} is encrypted but no passphrase was given")]
    Encrypted { node: String },

    #[error("Node {node} is signed but no certificate was given")]
    MissingCertificate { node: String },

    #[error("Signature verification failed for {node}")]
    InvalidSignature { node: String },

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("System definition error: {0}")]
    System(#[from] SystemError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

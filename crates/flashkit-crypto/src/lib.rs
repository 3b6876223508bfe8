//! Cryptographic building blocks of flashkit update packages
//!
//! - [`digest`]: SHA-256 over canonically ordered file sets
//! - [`signature`]: ECDSA P-256 signing and verification, certificate key extraction
//! - [`file_codec`]: passphrase based AES-128 encryption of whole files

pub mod digest;
pub mod file_codec;
pub mod signature;

pub use digest::{Digest, FileSet, digest_files};
pub use file_codec::{decrypt_bytes, decrypt_file, derive_key, encrypt_bytes, encrypt_file};
pub use signature::{EcdsaSignature, PrivateKey, PublicKey, sign, verify, verify_der};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Bad padding (corrupt input or wrong passphrase)")]
    BadPadding,

    #[error("Input length {len} is not a multiple of the cipher block size")]
    NotBlockAligned { len: usize },
}

impl CryptoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;

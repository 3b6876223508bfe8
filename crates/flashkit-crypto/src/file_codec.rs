//! Passphrase based file encryption
//!
//! AES-128 applied to independent 16 byte blocks with PKCS#7 padding. The key is
//! derived from the passphrase with HMAC-SHA256 and truncated to 128 bits.
//!
//! Files are processed in memory as a whole: memory use grows with the size of
//! the largest node archive. Node archives hold firmware images, so this is
//! bounded in practice.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::Path;
use tracing::debug;

use crate::{CryptoError, Result};

const BLOCK_SIZE: usize = 16;
const KEY_LABEL: &[u8] = b"flashkit secure update package";

/// Derive the 128 bit cipher key from a passphrase
pub fn derive_key(passphrase: &str) -> Result<[u8; 16]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(KEY_LABEL)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(passphrase.as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut key = [0u8; 16];
    key.copy_from_slice(&tag[..16]);
    Ok(key)
}

fn cipher(passphrase: &str) -> Result<Aes128> {
    Ok(Aes128::new(&GenericArray::from(derive_key(passphrase)?)))
}

/// Pad and encrypt
pub fn encrypt_bytes(passphrase: &str, plain: &[u8]) -> Result<Vec<u8>> {
    let pad = BLOCK_SIZE - plain.len() % BLOCK_SIZE;
    let mut data = Vec::with_capacity(plain.len() + pad);
    data.extend_from_slice(plain);
    data.resize(plain.len() + pad, pad as u8);

    let cipher = cipher(passphrase)?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(data)
}

/// Decrypt and strip the padding
pub fn decrypt_bytes(passphrase: &str, encrypted: &[u8]) -> Result<Vec<u8>> {
    if encrypted.is_empty() || encrypted.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned {
            len: encrypted.len(),
        });
    }

    let mut data = encrypted.to_vec();
    let cipher = cipher(passphrase)?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let pad = data[data.len() - 1] as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(CryptoError::BadPadding);
    }
    if data[data.len() - pad..].iter().any(|b| *b as usize != pad) {
        return Err(CryptoError::BadPadding);
    }

    data.truncate(data.len() - pad);
    Ok(data)
}

/// Encrypt `input` into `output`; `output` is overwritten and may equal `input`
pub fn encrypt_file(passphrase: &str, input: &Path, output: &Path) -> Result<()> {
    let plain = std::fs::read(input).map_err(|e| CryptoError::io(input, e))?;
    let encrypted = encrypt_bytes(passphrase, &plain)?;
    std::fs::write(output, &encrypted).map_err(|e| CryptoError::io(output, e))?;
    debug!(
        "Encrypted {} ({} -> {} bytes)",
        input.display(),
        plain.len(),
        encrypted.len()
    );
    Ok(())
}

/// Decrypt `input` into `output`; `output` is only written on success
pub fn decrypt_file(passphrase: &str, input: &Path, output: &Path) -> Result<()> {
    let encrypted = std::fs::read(input).map_err(|e| CryptoError::io(input, e))?;
    let plain = decrypt_bytes(passphrase, &encrypted)?;
    std::fs::write(output, &plain).map_err(|e| CryptoError::io(output, e))?;
    debug!("Decrypted {} ({} bytes)", input.display(), plain.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_padding_boundaries() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let encrypted = encrypt_bytes("secret", &plain).unwrap();
            assert_eq!(encrypted.len(), (len / 16 + 1) * 16);
            assert_eq!(decrypt_bytes("secret", &encrypted).unwrap(), plain);
        }
    }

    #[test]
    fn test_identical_blocks_encrypt_identically() {
        let encrypted = encrypt_bytes("k", &[0xAA; 32]).unwrap();
        assert_eq!(encrypted[..16], encrypted[16..32]);
    }

    #[test]
    fn test_not_block_aligned() {
        assert!(matches!(
            decrypt_bytes("k", &[0u8; 17]),
            Err(CryptoError::NotBlockAligned { len: 17 })
        ));
        assert!(matches!(
            decrypt_bytes("k", &[]),
            Err(CryptoError::NotBlockAligned { len: 0 })
        ));
    }

    #[test]
    fn test_bad_padding_values() {
        let cipher = cipher("k").unwrap();
        for last in [0u8, 17, 200] {
            let mut block = [last; 16];
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            assert!(matches!(decrypt_bytes("k", &block), Err(CryptoError::BadPadding)));
        }

        // pad bytes disagree
        let mut block = [3u8; 16];
        block[14] = 7;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        assert!(matches!(decrypt_bytes("k", &block), Err(CryptoError::BadPadding)));
    }

    #[test]
    fn test_key_derivation_is_stable() {
        assert_eq!(derive_key("abc").unwrap(), derive_key("abc").unwrap());
        assert_ne!(derive_key("abc").unwrap(), derive_key("abd").unwrap());
        assert_ne!(derive_key("").unwrap(), [0u8; 16]);
    }

    #[test]
    fn test_file_roundtrip_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.nsup");
        let decrypted = dir.path().join("plain.zip");
        std::fs::write(&path, b"PK\x03\x04 archive body").unwrap();

        encrypt_file("pw", &path, &path).unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), b"PK\x03\x04 archive body");

        decrypt_file("pw", &path, &decrypted).unwrap();
        assert_eq!(std::fs::read(&decrypted).unwrap(), b"PK\x03\x04 archive body");
    }

    #[test]
    fn test_decrypt_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = decrypt_file("pw", &dir.path().join("none"), &dir.path().join("out"));
        assert!(matches!(result, Err(CryptoError::Io { .. })));
        assert!(!dir.path().join("out").exists());
    }

    proptest! {
        #[test]
        fn roundtrip_any_length(data in proptest::collection::vec(any::<u8>(), 0..300), pass in "[a-z]{0,12}") {
            let encrypted = encrypt_bytes(&pass, &data).unwrap();
            prop_assert_eq!(encrypted.len() % 16, 0);
            prop_assert_eq!(decrypt_bytes(&pass, &encrypted).unwrap(), data);
        }
    }
}

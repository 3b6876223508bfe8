//! ECDSA P-256 signatures over digests

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use std::fmt;
use std::path::Path;
use tracing::debug;
use x509_cert::Certificate;
use x509_cert::der::{Decode, DecodePem};
use x509_cert::spki::ObjectIdentifier;

use crate::digest::Digest;
use crate::{CryptoError, Result};

/// id-ecPublicKey
const EC_PUBLIC_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

const SCALAR_SIZE: usize = 32;

/// Signature as the pair (r, s)
///
/// Both values are kept big-endian without leading zero bytes; `r_len`/`s_len`
/// give the number of bytes in use.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature {
    r: [u8; SCALAR_SIZE],
    r_len: usize,
    s: [u8; SCALAR_SIZE],
    s_len: usize,
}

impl EcdsaSignature {
    /// Build from big-endian r and s (at most 32 bytes each)
    pub fn new(r: &[u8], s: &[u8]) -> Result<Self> {
        let (r, r_len) = compact(r)?;
        let (s, s_len) = compact(s)?;
        Ok(Self { r, r_len, s, s_len })
    }

    pub fn r(&self) -> &[u8] {
        &self.r[..self.r_len]
    }

    pub fn s(&self) -> &[u8] {
        &self.s[..self.s_len]
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let signature = Signature::from_der(bytes)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(Self::from_p256(&signature))
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_p256()?.to_der().as_bytes().to_vec())
    }

    fn from_p256(signature: &Signature) -> Self {
        let (r, s) = signature.split_bytes();
        // split_bytes always yields 32 bytes each
        let (r, r_len) = compact(&r).unwrap_or(([0; SCALAR_SIZE], 0));
        let (s, s_len) = compact(&s).unwrap_or(([0; SCALAR_SIZE], 0));
        Self { r, r_len, s, s_len }
    }

    fn to_p256(&self) -> Result<Signature> {
        let r = left_pad(self.r());
        let s = left_pad(self.s());
        Signature::from_scalars(r, s).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}

impl fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdsaSignature")
            .field("r", &hex::encode(self.r()))
            .field("s", &hex::encode(self.s()))
            .finish()
    }
}

fn compact(value: &[u8]) -> Result<([u8; SCALAR_SIZE], usize)> {
    let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let significant = &value[start..];
    if significant.len() > SCALAR_SIZE {
        return Err(CryptoError::InvalidSignature(format!(
            "scalar has {} bytes",
            significant.len()
        )));
    }

    let mut out = [0u8; SCALAR_SIZE];
    out[..significant.len()].copy_from_slice(significant);
    Ok((out, significant.len()))
}

fn left_pad(value: &[u8]) -> [u8; SCALAR_SIZE] {
    let mut out = [0u8; SCALAR_SIZE];
    out[SCALAR_SIZE - value.len()..].copy_from_slice(value);
    out
}

/// P-256 private key, used for signing only
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Raw 32 byte big-endian scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SCALAR_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                SCALAR_SIZE,
                bytes.len()
            )));
        }
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// PKCS#8 or SEC1 ("EC PRIVATE KEY") PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
            return Ok(Self(key));
        }

        let secret = p256::SecretKey::from_sec1_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(SigningKey::from(&secret)))
    }

    /// Load a key file: PEM text or a raw 32 byte scalar
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CryptoError::io(path, e))?;
        if bytes.starts_with(b"-----BEGIN") {
            let text = String::from_utf8(bytes)
                .map_err(|_| CryptoError::InvalidKey("PEM is not valid UTF-8".into()))?;
            Self::from_pem(&text)
        } else {
            Self::from_bytes(&bytes)
        }
    }

    pub fn generate() -> Self {
        Self(SigningKey::random(&mut rand::rngs::OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }

    /// PKCS#8 PEM encoding
    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(pem.to_string())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// P-256 public key, used for verification only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Extract the key from an X.509 certificate (DER or PEM)
    pub fn from_certificate(bytes: &[u8]) -> Result<Self> {
        let certificate = if bytes.starts_with(b"-----BEGIN") {
            Certificate::from_pem(bytes)
        } else {
            Certificate::from_der(bytes)
        }
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;

        let info = &certificate.tbs_certificate.subject_public_key_info;
        if info.algorithm.oid != EC_PUBLIC_KEY_OID {
            return Err(CryptoError::InvalidCertificate(format!(
                "certificate carries a {} key, expected an EC key",
                info.algorithm.oid
            )));
        }

        let key_bytes = info.subject_public_key.raw_bytes();
        let key = VerifyingKey::from_sec1_bytes(key_bytes)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;

        debug!("Extracted P-256 public key from certificate");
        Ok(Self(key))
    }

    pub fn load_certificate(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CryptoError::io(path, e))?;
        Self::from_certificate(&bytes)
    }

    /// SEC1 encoded point or the 64 byte X||Y form
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let key = if bytes.len() == 2 * SCALAR_SIZE {
            let mut encoded = Vec::with_capacity(bytes.len() + 1);
            encoded.push(0x04);
            encoded.extend_from_slice(bytes);
            VerifyingKey::from_sec1_bytes(&encoded)
        } else {
            VerifyingKey::from_sec1_bytes(bytes)
        };
        key.map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// X||Y coordinates, 64 bytes
    pub fn to_bytes(&self) -> [u8; 64] {
        let point = self.0.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }
}

/// Sign a digest
pub fn sign(digest: &Digest, key: &PrivateKey) -> Result<EcdsaSignature> {
    let signature: Signature = key
        .0
        .sign_prehash(digest.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(EcdsaSignature::from_p256(&signature))
}

/// Check a signature; any malformed input counts as a mismatch
pub fn verify(key: &PublicKey, signature: &EcdsaSignature, digest: &Digest) -> bool {
    match signature.to_p256() {
        Ok(signature) => key.0.verify_prehash(digest.as_bytes(), &signature).is_ok(),
        Err(_) => false,
    }
}

/// Check a DER encoded signature
pub fn verify_der(key: &PublicKey, der: &[u8], digest: &Digest) -> bool {
    match EcdsaSignature::from_der(der) {
        Ok(signature) => verify(key, &signature, digest),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdata(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../testdata/keys")
            .join(name)
    }

    fn some_digest(seed: u8) -> Digest {
        Digest::from_bytes([seed; 32])
    }

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let digest = some_digest(7);
        let signature = sign(&digest, &key).unwrap();
        assert!(verify(&key.public_key(), &signature, &digest));
    }

    #[test]
    fn test_flipped_bit_fails() {
        let key = PrivateKey::generate();
        let digest = some_digest(7);
        let signature = sign(&digest, &key).unwrap();

        let mut bytes = *digest.as_bytes();
        bytes[31] ^= 0x01;
        assert!(!verify(&key.public_key(), &signature, &Digest::from_bytes(bytes)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let digest = some_digest(1);
        let signature = sign(&digest, &PrivateKey::generate()).unwrap();
        assert!(!verify(&PrivateKey::generate().public_key(), &signature, &digest));
    }

    #[test]
    fn test_der_roundtrip() {
        let key = PrivateKey::generate();
        let digest = some_digest(3);
        let signature = sign(&digest, &key).unwrap();

        let der = signature.to_der().unwrap();
        assert_eq!(der[0], 0x30);
        assert_eq!(EcdsaSignature::from_der(&der).unwrap(), signature);
        assert!(verify_der(&key.public_key(), &der, &digest));
    }

    #[test]
    fn test_malformed_der_fails_closed() {
        let key = PrivateKey::generate();
        assert!(!verify_der(&key.public_key(), b"not a signature", &some_digest(0)));
        assert!(!verify_der(&key.public_key(), &[], &some_digest(0)));
    }

    #[test]
    fn test_zero_signature_fails_closed() {
        let key = PrivateKey::generate();
        let signature = EcdsaSignature::new(&[0], &[0]).unwrap();
        assert!(!verify(&key.public_key(), &signature, &some_digest(0)));
        assert!(signature.to_der().is_err());
    }

    #[test]
    fn test_scalar_lengths() {
        let signature = EcdsaSignature::new(&[0, 0, 1, 2], &[9; 32]).unwrap();
        assert_eq!(signature.r(), &[1, 2]);
        assert_eq!(signature.s().len(), 32);
        assert!(EcdsaSignature::new(&[1; 33], &[1]).is_err());
    }

    #[test]
    fn test_private_key_from_bytes() {
        assert!(PrivateKey::from_bytes(&[1; 31]).is_err());
        assert!(PrivateKey::from_bytes(&[0; 32]).is_err());
        let key = PrivateKey::from_bytes(&[1; 32]).unwrap();
        let digest = some_digest(5);
        let signature = sign(&digest, &key).unwrap();
        assert!(verify(&key.public_key(), &signature, &digest));
    }

    #[test]
    fn test_key_matches_certificate() {
        let pkcs8 = PrivateKey::load(&testdata("signer_a_key.pem")).unwrap();
        let sec1 = PrivateKey::load(&testdata("signer_a_ec_key.pem")).unwrap();
        let from_pem = PublicKey::load_certificate(&testdata("signer_a_cert.pem")).unwrap();
        let from_der = PublicKey::load_certificate(&testdata("signer_a_cert.der")).unwrap();

        assert_eq!(pkcs8.public_key(), from_pem);
        assert_eq!(sec1.public_key(), from_pem);
        assert_eq!(from_der, from_pem);

        let digest = some_digest(9);
        let signature = sign(&digest, &pkcs8).unwrap();
        assert!(verify(&from_der, &signature, &digest));
    }

    #[test]
    fn test_other_signer_certificate_rejects() {
        let key = PrivateKey::load(&testdata("signer_a_key.pem")).unwrap();
        let other = PublicKey::load_certificate(&testdata("signer_b_cert.pem")).unwrap();
        let digest = some_digest(2);
        let signature = sign(&digest, &key).unwrap();
        assert!(!verify(&other, &signature, &digest));
    }

    #[test]
    fn test_invalid_certificates() {
        let rsa = std::fs::read(testdata("rsa_cert.pem")).unwrap();
        assert!(matches!(
            PublicKey::from_certificate(&rsa),
            Err(CryptoError::InvalidCertificate(_))
        ));
        assert!(matches!(
            PublicKey::from_certificate(b"garbage"),
            Err(CryptoError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_public_key_bytes_roundtrip() {
        let public = PrivateKey::generate().public_key();
        let bytes = public.to_bytes();
        assert_eq!(PublicKey::from_sec1_bytes(&bytes).unwrap(), public);
    }

    #[test]
    fn test_pem_export_reloads() {
        let key = PrivateKey::generate();
        let pem = key.to_pem().unwrap();
        let reloaded = PrivateKey::from_pem(&pem).unwrap();
        assert_eq!(reloaded.public_key(), key.public_key());
    }
}

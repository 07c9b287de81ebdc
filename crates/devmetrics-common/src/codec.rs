//! Transport envelope for metric payloads.
//!
//! Outbound: JSON -> gzip -> optional RSA-OAEP(SHA-256).
//! Inbound: the reverse, each stage applied only when the headers declare it.

use crate::error::{MetricError, Result};
use crate::types::MetricRecord;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::io::{Read, Write};
use std::path::Path;

pub const CONTENT_ENCODING: &str = "content-encoding";
pub const CONTENT_ENCRYPTION: &str = "content-encryption";
pub const ACCEPT_ENCODING: &str = "accept-encoding";
pub const REAL_IP: &str = "x-real-ip";
pub const GZIP: &str = "gzip";
pub const RSA_SCHEME: &str = "rsa";

/// Largest payload a gzipped body may inflate to.
pub const MAX_DECOMPRESSED: u64 = 16 * 1024 * 1024;

/// OAEP with SHA-256 spends `2 * 32 + 2` bytes of every block on padding.
const OAEP_OVERHEAD: usize = 66;

/// Which envelope stages were applied to a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeaders {
    pub compressed: bool,
    pub encryption: Option<String>,
}

impl EnvelopeHeaders {
    /// Reads the envelope headers through a case-insensitive lookup.
    ///
    /// ```
    /// use devmetrics_common::codec::EnvelopeHeaders;
    ///
    /// let headers = EnvelopeHeaders::from_lookup(|name| match name {
    ///     "content-encoding" => Some("gzip"),
    ///     "content-encryption" => Some("rsa"),
    ///     _ => None,
    /// });
    /// assert!(headers.compressed);
    /// assert_eq!(headers.encryption.as_deref(), Some("rsa"));
    /// ```
    pub fn from_lookup<'a, F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let compressed = lookup(CONTENT_ENCODING)
            .map(|v| v.to_ascii_lowercase().contains(GZIP))
            .unwrap_or(false);
        let encryption = lookup(CONTENT_ENCRYPTION)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Self {
            compressed,
            encryption,
        }
    }

    /// Header pairs to attach to an outgoing request.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(2);
        if self.compressed {
            out.push((CONTENT_ENCODING, GZIP.to_string()));
        }
        if let Some(scheme) = &self.encryption {
            out.push((CONTENT_ENCRYPTION, scheme.clone()));
        }
        out
    }
}

/// An encoded body with the headers describing it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: EnvelopeHeaders,
}

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates `data`, failing once the output passes [`MAX_DECOMPRESSED`].
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data).take(MAX_DECOMPRESSED + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_DECOMPRESSED {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("gzip payload inflates past {MAX_DECOMPRESSED} bytes"),
        ));
    }
    Ok(out)
}

/// Agent-side half of the encryption stage.
#[derive(Debug, Clone)]
pub struct RsaEncryptor {
    key: RsaPublicKey,
}

impl RsaEncryptor {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Accepts SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`).
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| anyhow::anyhow!("invalid RSA public key: {e}"))?;
        Ok(Self::new(key))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read public key '{}': {e}", path.display()))?;
        Self::from_pem(&pem)
    }

    fn block_len(&self) -> usize {
        self.key.size().saturating_sub(OAEP_OVERHEAD).max(1)
    }

    /// Seals `plaintext` block by block; every output block is exactly the
    /// modulus size.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(plaintext.len() / self.block_len() * self.key.size() + self.key.size());
        for chunk in plaintext.chunks(self.block_len()) {
            let sealed = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
                .map_err(|e| MetricError::Internal(format!("encrypt: {e}")))?;
            out.extend_from_slice(&sealed);
        }
        Ok(out)
    }
}

/// Server-side half of the encryption stage.
#[derive(Clone)]
pub struct RsaDecryptor {
    key: RsaPrivateKey,
}

impl RsaDecryptor {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Accepts PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8 (`BEGIN PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| anyhow::anyhow!("invalid RSA private key: {e}"))?;
        Ok(Self::new(key))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read private key '{}': {e}", path.display()))?;
        Self::from_pem(&pem)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let block = self.key.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(MetricError::Decrypt(format!(
                "ciphertext length {} is not a multiple of {block}",
                ciphertext.len()
            )));
        }
        let mut out = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(block) {
            let plain = self
                .key
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(|e| MetricError::Decrypt(e.to_string()))?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for RsaDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaDecryptor")
            .field("bits", &(self.key.size() * 8))
            .finish()
    }
}

/// Serializes `payload` to JSON, gzips it and, with an encryptor, seals it.
pub fn encode<T: Serialize + ?Sized>(
    payload: &T,
    encryptor: Option<&RsaEncryptor>,
) -> Result<Envelope> {
    let json = serde_json::to_vec(payload).map_err(|e| MetricError::Internal(e.to_string()))?;
    let mut body = compress(&json).map_err(|e| MetricError::Internal(e.to_string()))?;
    let mut headers = EnvelopeHeaders {
        compressed: true,
        encryption: None,
    };
    if let Some(enc) = encryptor {
        body = enc.encrypt(&body)?;
        headers.encryption = Some(RSA_SCHEME.to_string());
    }
    Ok(Envelope { body, headers })
}

pub fn encode_batch(
    records: &[MetricRecord],
    encryptor: Option<&RsaEncryptor>,
) -> Result<Envelope> {
    encode(records, encryptor)
}

/// Undoes the envelope stages declared by `headers`: decrypt first, then
/// decompress.
pub fn open(
    body: &[u8],
    headers: &EnvelopeHeaders,
    decryptor: Option<&RsaDecryptor>,
) -> Result<Vec<u8>> {
    let mut data = match &headers.encryption {
        Some(scheme) if scheme.eq_ignore_ascii_case(RSA_SCHEME) => match decryptor {
            Some(dec) => dec.decrypt(body)?,
            None => {
                return Err(MetricError::Decrypt(
                    "payload is encrypted but no private key is configured".to_string(),
                ))
            }
        },
        Some(scheme) => {
            return Err(MetricError::Decrypt(format!(
                "unsupported encryption scheme '{scheme}'"
            )))
        }
        None => body.to_vec(),
    };
    if headers.compressed {
        data = decompress(&data).map_err(MetricError::Decompress)?;
    }
    Ok(data)
}

pub fn decode<T: DeserializeOwned>(
    body: &[u8],
    headers: &EnvelopeHeaders,
    decryptor: Option<&RsaDecryptor>,
) -> Result<T> {
    let data = open(body, headers, decryptor)?;
    serde_json::from_slice(&data).map_err(MetricError::MalformedJson)
}

pub fn decode_batch(
    body: &[u8],
    headers: &EnvelopeHeaders,
    decryptor: Option<&RsaDecryptor>,
) -> Result<Vec<MetricRecord>> {
    decode(body, headers, decryptor)
}

pub fn decode_record(
    body: &[u8],
    headers: &EnvelopeHeaders,
    decryptor: Option<&RsaDecryptor>,
) -> Result<MetricRecord> {
    decode(body, headers, decryptor)
}

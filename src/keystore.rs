// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The key-share store: envelope-encrypted persistence for the one durable
//! secret in the system, plus its public metadata sidecar.
//!
//! Two protection modes exist. In KMS mode a 256-bit data key is obtained
//! from an external protector bound to an encryption context and persisted
//! only in wrapped form. In local mode the key is derived from a passphrase
//! with Argon2id. Either way the share itself is AES-256-GCM encrypted, the
//! share file is owner-read-only, and the metadata sidecar contains no
//! secret material.

use crate::{
    errors::{CallerError, Result, StorageError},
    keygen::KeyShare,
    parameters::{
        ARGON2_MEMORY_KIB, ARGON2_PARALLELISM, ARGON2_TIME_COST, MIN_PASSPHRASE_CHARS,
        ON_DISK_FORMAT_VERSION,
    },
    protocol::{ParticipantIdentifier, PartyRoster},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};
use zeroize::{Zeroize, Zeroizing};

const AES_256_GCM: &str = "AES-256-GCM";
const ARGON2ID: &str = "argon2id";
const PURPOSE_KEY_SHARE: &str = "key-share";

/// The context a wrapped data key is bound to. The KMS refuses to unwrap a
/// key under a different context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "CeremonyId")]
    pub ceremony_id: String,
    #[serde(rename = "Purpose")]
    pub purpose: String,
}

impl EncryptionContext {
    fn for_share(node_id: ParticipantIdentifier, share: &KeyShare) -> Self {
        Self {
            node_id: node_id.as_hex(),
            ceremony_id: share.ceremony().as_hex(),
            purpose: PURPOSE_KEY_SHARE.to_string(),
        }
    }
}

/// The seam to an external key-management service.
///
/// Implementations generate and unwrap 256-bit data keys bound to an
/// [`EncryptionContext`]. The transport to the actual KMS lives outside
/// this crate.
pub trait DataKeyProtector: Send + Sync {
    /// The identifier recorded in the share file's `kdf` field.
    fn key_id(&self) -> String;

    /// Generate a fresh data key; returns the plaintext key and its wrapped
    /// form.
    fn generate_data_key(
        &self,
        context: &EncryptionContext,
    ) -> Result<(Zeroizing<[u8; 32]>, Vec<u8>)>;

    /// Unwrap a data key previously produced under the same context.
    fn decrypt_data_key(
        &self,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<[u8; 32]>>;
}

/// How the on-disk share is protected.
pub enum Protection {
    /// Envelope encryption with a KMS-wrapped data key.
    Kms(Box<dyn DataKeyProtector>),
    /// A local passphrase run through Argon2id.
    Passphrase(String),
}

impl std::fmt::Debug for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kms(protector) => f
                .debug_tuple("Protection::Kms")
                .field(&protector.key_id())
                .finish(),
            Self::Passphrase(_) => f.write_str("Protection::Passphrase([redacted])"),
        }
    }
}

/// The encrypted share document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedShareFile {
    version: u32,
    algorithm: String,
    /// `"argon2id"` for local mode, the KMS key id otherwise.
    kdf: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encrypted_data_key: Option<String>,
    iv: String,
    auth_tag: String,
    ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption_context: Option<EncryptionContext>,
}

/// One row of the metadata sidecar's participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub node_id: String,
    pub party_index: u32,
    /// 33-byte compressed point, hex.
    pub public_key_share: String,
}

/// The public ceremony metadata sidecar. Contains no secret material and is
/// safe to back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyMetadata {
    pub ceremony_id: String,
    /// Milliseconds since the epoch.
    pub completed_at: u64,
    pub participants: Vec<ParticipantRecord>,
    pub threshold: usize,
    pub total_parties: usize,
    /// 33-byte compressed master public key, hex.
    pub pk_master: String,
    /// 32-byte chain code, hex.
    pub chain_code: String,
    pub version: u32,
}

impl CeremonyMetadata {
    /// Build the sidecar for a completed ceremony.
    pub fn new(share: &KeyShare, roster: &PartyRoster, completed_at_ms: u64) -> Result<Self> {
        let participants = share
            .public_key_shares()
            .iter()
            .map(|public_share| {
                Ok(ParticipantRecord {
                    node_id: roster.id_at(public_share.party_index())?.as_hex(),
                    party_index: public_share.party_index(),
                    public_key_share: hex::encode(public_share.share().to_compressed_bytes()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ceremony_id: share.ceremony().as_hex(),
            completed_at: completed_at_ms,
            participants,
            threshold: share.threshold(),
            total_parties: roster.count(),
            pk_master: hex::encode(share.public_key().to_compressed_bytes()),
            chain_code: hex::encode(share.chain_code()),
            version: ON_DISK_FORMAT_VERSION,
        })
    }
}

/// Filesystem store for one node's key share and ceremony metadata.
#[derive(Debug, Clone)]
pub struct KeyShareStore {
    share_path: PathBuf,
    metadata_path: PathBuf,
}

impl KeyShareStore {
    /// A store rooted at `dir`, using the standard file names.
    pub fn new(dir: &Path) -> Self {
        Self {
            share_path: dir.join("share.json"),
            metadata_path: dir.join("ceremony.json"),
        }
    }

    /// Whether a share has been persisted.
    pub fn exists(&self) -> bool {
        self.share_path.exists()
    }

    /// Encrypt and persist the share together with its public metadata.
    ///
    /// A failure here must surface as a ceremony failure: the share has not
    /// been durably kept.
    #[instrument(skip_all, err(Debug))]
    pub fn save<R: RngCore + CryptoRng>(
        &self,
        node_id: ParticipantIdentifier,
        share: &KeyShare,
        metadata: &CeremonyMetadata,
        protection: &Protection,
        rng: &mut R,
    ) -> Result<()> {
        let mut plaintext = Zeroizing::new(
            serde_json::to_vec(share).map_err(|_| StorageError::EncryptionFailed)?,
        );

        let (key, kdf, salt, encrypted_data_key, encryption_context) = match protection {
            Protection::Passphrase(passphrase) => {
                if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
                    Err(CallerError::PassphraseTooShort)?;
                }
                let mut salt = [0u8; 32];
                rng.fill_bytes(&mut salt);
                let key = derive_passphrase_key(passphrase, &salt)?;
                (
                    key,
                    ARGON2ID.to_string(),
                    Some(BASE64.encode(salt)),
                    None,
                    None,
                )
            }
            Protection::Kms(protector) => {
                let context = EncryptionContext::for_share(node_id, share);
                let (key, wrapped) = protector.generate_data_key(&context)?;
                (
                    key,
                    protector.key_id(),
                    None,
                    Some(BASE64.encode(wrapped)),
                    Some(context),
                )
            }
        };

        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| StorageError::EncryptionFailed)?;
        let mut iv = [0u8; 12];
        rng.fill_bytes(&mut iv);
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| StorageError::EncryptionFailed)?;
        plaintext.zeroize();

        let tag = sealed.split_off(sealed.len() - 16);
        let document = EncryptedShareFile {
            version: ON_DISK_FORMAT_VERSION,
            algorithm: AES_256_GCM.to_string(),
            kdf,
            salt,
            encrypted_data_key,
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(tag),
            ciphertext: BASE64.encode(sealed),
            encryption_context,
        };

        let share_json =
            serde_json::to_vec_pretty(&document).map_err(|_| StorageError::EncryptionFailed)?;
        write_file(&self.share_path, &share_json, 0o600)?;

        let metadata_json =
            serde_json::to_vec_pretty(metadata).map_err(|_| StorageError::EncryptionFailed)?;
        write_file(&self.metadata_path, &metadata_json, 0o644)?;

        info!("Persisted encrypted key share to {:?}", self.share_path);
        Ok(())
    }

    /// Decrypt and return the persisted share.
    #[instrument(skip_all, err(Debug))]
    pub fn load(&self, protection: &Protection) -> Result<KeyShare> {
        if !self.exists() {
            Err(StorageError::NotFound)?;
        }
        let bytes = std::fs::read(&self.share_path)
            .map_err(|error| StorageError::Io(error.to_string()))?;
        let document: EncryptedShareFile =
            serde_json::from_slice(&bytes).map_err(|_| StorageError::DecryptionFailed)?;

        if document.version != ON_DISK_FORMAT_VERSION {
            Err(StorageError::UnsupportedVersion(
                document.version,
                ON_DISK_FORMAT_VERSION,
            ))?;
        }
        if document.algorithm != AES_256_GCM {
            Err(StorageError::DecryptionFailed)?;
        }

        let key = match protection {
            Protection::Passphrase(passphrase) => {
                let salt = document
                    .salt
                    .as_deref()
                    .ok_or(StorageError::DecryptionFailed)?;
                let salt = BASE64
                    .decode(salt)
                    .map_err(|_| StorageError::DecryptionFailed)?;
                derive_passphrase_key(passphrase, &salt)?
            }
            Protection::Kms(protector) => {
                let wrapped = document
                    .encrypted_data_key
                    .as_deref()
                    .ok_or(StorageError::DecryptionFailed)?;
                let wrapped = BASE64
                    .decode(wrapped)
                    .map_err(|_| StorageError::DecryptionFailed)?;
                let context = document
                    .encryption_context
                    .as_ref()
                    .ok_or(StorageError::DecryptionFailed)?;
                protector.decrypt_data_key(&wrapped, context)?
            }
        };

        let iv = BASE64
            .decode(&document.iv)
            .map_err(|_| StorageError::DecryptionFailed)?;
        let mut sealed = BASE64
            .decode(&document.ciphertext)
            .map_err(|_| StorageError::DecryptionFailed)?;
        let tag = BASE64
            .decode(&document.auth_tag)
            .map_err(|_| StorageError::DecryptionFailed)?;
        sealed.extend_from_slice(&tag);

        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| StorageError::DecryptionFailed)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
                .map_err(|_| StorageError::DecryptionFailed)?,
        );

        serde_json::from_slice(&plaintext).map_err(|_| StorageError::DecryptionFailed.into())
    }

    /// Read the public metadata sidecar.
    pub fn load_metadata(&self) -> Result<CeremonyMetadata> {
        let bytes = std::fs::read(&self.metadata_path)
            .map_err(|error| StorageError::Io(error.to_string()))?;
        let metadata: CeremonyMetadata =
            serde_json::from_slice(&bytes).map_err(|_| StorageError::DecryptionFailed)?;
        if metadata.version != ON_DISK_FORMAT_VERSION {
            Err(StorageError::UnsupportedVersion(
                metadata.version,
                ON_DISK_FORMAT_VERSION,
            ))?;
        }
        Ok(metadata)
    }
}

fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME_COST, ARGON2_PARALLELISM, Some(32))
        .map_err(|_| StorageError::KdfFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|_| StorageError::KdfFailed)?;
    Ok(key)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, contents).map_err(|error| StorageError::Io(error.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|error| StorageError::Io(error.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

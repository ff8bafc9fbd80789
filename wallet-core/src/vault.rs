//! Password-sealed storage for the wallet seed.
//!
//! Key derivation is Argon2id (v0x13) over a fresh 16-byte salt; the seed is
//! sealed with AES-256-GCM under a fresh 96-bit nonce. The cost parameters
//! used are written into every record so older vaults stay readable if the
//! defaults change.

use std::fmt;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::{WalletError, WalletResult};
use crate::storage::KeyValueStore;

pub const VAULT_KEY: &str = "silica.wallet.vault";
pub const FINGERPRINT_KEY: &str = "silica.wallet.fingerprint";

const VAULT_MAGIC: &str = "CHERTWLT";
const VAULT_VERSION: u16 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const FINGERPRINT_LEN: usize = 16;
const FINGERPRINT_CONTEXT: &str = "silica wallet fingerprint v1";

// Upper bounds accepted when reading stored parameters.
const MAX_M_COST_KIB: u32 = 1024 * 1024;
const MAX_T_COST: u32 = 16;
const MAX_P_COST: u32 = 8;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParameters {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParameters {
    /// Minimal cost accepted by Argon2. Only for tests.
    pub fn insecure_for_tests() -> Self {
        Self {
            m_cost_kib: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn within_limits(&self) -> bool {
        self.m_cost_kib <= MAX_M_COST_KIB
            && (1..=MAX_T_COST).contains(&self.t_cost)
            && (1..=MAX_P_COST).contains(&self.p_cost)
    }
}

impl Default for KdfParameters {
    fn default() -> Self {
        Self {
            m_cost_kib: 64 * 1024, // 64 MiB
            t_cost: 3,
            p_cost: 1,
        }
    }
}

/// The only durable representation of the seed.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedVault {
    pub kdf: KdfParameters,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedVault")
            .field("kdf", &self.kdf)
            .field("salt_len", &self.salt.len())
            .field("iv_len", &self.iv.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultRecord {
    magic: String,
    version: u16,
    kdf: KdfParameters,
    salt: String,
    iv: String,
    ciphertext: String,
}

impl VaultRecord {
    fn encode(vault: &EncryptedVault) -> WalletResult<Vec<u8>> {
        let record = VaultRecord {
            magic: VAULT_MAGIC.to_string(),
            version: VAULT_VERSION,
            kdf: vault.kdf,
            salt: hex::encode(&vault.salt),
            iv: hex::encode(&vault.iv),
            ciphertext: hex::encode(&vault.ciphertext),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    fn decode(bytes: &[u8]) -> WalletResult<EncryptedVault> {
        let record: VaultRecord = serde_json::from_slice(bytes)?;
        if record.magic != VAULT_MAGIC {
            return Err(WalletError::StorageError(
                "Invalid vault magic marker".to_string(),
            ));
        }
        if record.version != VAULT_VERSION {
            return Err(WalletError::StorageError(format!(
                "Unsupported vault version: {}",
                record.version
            )));
        }

        let field = |name: &str, value: &str| {
            hex::decode(value)
                .map_err(|e| WalletError::StorageError(format!("Invalid vault {}: {}", name, e)))
        };
        Ok(EncryptedVault {
            kdf: record.kdf,
            salt: field("salt", &record.salt)?,
            iv: field("iv", &record.iv)?,
            ciphertext: field("ciphertext", &record.ciphertext)?,
        })
    }
}

/// Encrypts the seed and moves the sealed record through the storage collaborator.
#[derive(Clone)]
pub struct CryptoVault {
    store: Arc<dyn KeyValueStore>,
    kdf: KdfParameters,
}

impl fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoVault").field("kdf", &self.kdf).finish()
    }
}

impl CryptoVault {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_kdf(store, KdfParameters::default())
    }

    pub fn with_kdf(store: Arc<dyn KeyValueStore>, kdf: KdfParameters) -> Self {
        Self { store, kdf }
    }

    pub fn kdf(&self) -> KdfParameters {
        self.kdf
    }

    pub fn encrypt(&self, seed: &[u8], password: &SecretString) -> WalletResult<EncryptedVault> {
        let mut rng = OsRng;
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce_bytes);

        let key = derive_key(password, &salt, &self.kdf)?;
        let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_ref())
            .map_err(|e| WalletError::CryptoError(format!("Invalid encryption key: {e}")))?;
        let sealing_key = LessSafeKey::new(unbound_key);

        let mut in_out = seed.to_vec();
        sealing_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| WalletError::CryptoError("Encryption failure".to_string()))?;

        Ok(EncryptedVault {
            kdf: self.kdf,
            salt: salt.to_vec(),
            iv: nonce_bytes.to_vec(),
            ciphertext: in_out,
        })
    }

    /// Every failure here is reported as `InvalidPassword`: a wrong password
    /// and a corrupted record must be indistinguishable.
    pub fn decrypt(
        &self,
        vault: &EncryptedVault,
        password: &SecretString,
    ) -> WalletResult<Zeroizing<Vec<u8>>> {
        if !vault.kdf.within_limits() || vault.ciphertext.len() < aead::AES_256_GCM.tag_len() {
            return Err(WalletError::InvalidPassword);
        }
        let nonce = Nonce::try_assume_unique_for_key(&vault.iv)
            .map_err(|_| WalletError::InvalidPassword)?;

        let key = derive_key(password, &vault.salt, &vault.kdf)
            .map_err(|_| WalletError::InvalidPassword)?;
        let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_ref())
            .map_err(|_| WalletError::InvalidPassword)?;
        let opening_key = LessSafeKey::new(unbound_key);

        let mut in_out = Zeroizing::new(vault.ciphertext.clone());
        let plaintext_len = opening_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| WalletError::InvalidPassword)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    pub fn persist(&self, vault: &EncryptedVault) -> WalletResult<()> {
        self.store.set(VAULT_KEY, &VaultRecord::encode(vault)?)
    }

    pub fn load(&self) -> WalletResult<Option<EncryptedVault>> {
        match self.store.get(VAULT_KEY)? {
            Some(bytes) => VaultRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn exists(&self) -> WalletResult<bool> {
        Ok(self.store.get(VAULT_KEY)?.is_some())
    }

    pub fn clear(&self) -> WalletResult<()> {
        self.store.remove(VAULT_KEY)?;
        self.store.remove(FINGERPRINT_KEY)
    }

    /// Re-seal the stored seed under a new password.
    pub fn change_password(
        &self,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> WalletResult<()> {
        let vault = self.load()?.ok_or(WalletError::VaultMissing)?;
        let seed = self.decrypt(&vault, current_password)?;
        let resealed = self.encrypt(&seed, new_password)?;
        self.persist(&resealed)
    }

    pub fn bind_fingerprint(&self, fingerprint: &str) -> WalletResult<()> {
        self.store.set(FINGERPRINT_KEY, fingerprint.as_bytes())
    }

    pub fn bound_fingerprint(&self) -> WalletResult<Option<String>> {
        self.store
            .get(FINGERPRINT_KEY)?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|_| {
                    WalletError::StorageError("Wallet fingerprint is not valid UTF-8".to_string())
                })
            })
            .transpose()
    }
}

/// Non-reversible identifier binding a vault to the wallet it was created for.
pub fn wallet_fingerprint(seed: &[u8]) -> String {
    let digest = blake3::derive_key(FINGERPRINT_CONTEXT, seed);
    hex::encode(&digest[..FINGERPRINT_LEN])
}

fn derive_key(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParameters,
) -> WalletResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(KEY_LEN),
    )
    .map_err(|e| WalletError::CryptoError(format!("Invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, key.as_mut())
        .map_err(|e| WalletError::CryptoError(format!("KDF failed: {e}")))?;
    Ok(key)
}

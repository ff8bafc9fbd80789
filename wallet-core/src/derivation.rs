use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

use crate::errors::{WalletError, WalletResult};

/// Mnemonic validation and seed derivation, supplied by the signing library.
pub trait SeedDeriver: Send + Sync {
    fn validate_mnemonic(&self, mnemonic: &str) -> bool;
    fn derive_seed(&self, mnemonic: &str) -> WalletResult<Zeroizing<Vec<u8>>>;
}

/// English BIP39 word list with checksum verification; empty passphrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bip39Deriver;

impl SeedDeriver for Bip39Deriver {
    fn validate_mnemonic(&self, mnemonic: &str) -> bool {
        Mnemonic::parse_in_normalized(Language::English, mnemonic).is_ok()
    }

    fn derive_seed(&self, mnemonic: &str) -> WalletResult<Zeroizing<Vec<u8>>> {
        let parsed = Mnemonic::parse_in_normalized(Language::English, mnemonic)
            .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
        let seed = Zeroizing::new(parsed.to_seed(""));
        Ok(Zeroizing::new(seed.to_vec()))
    }
}

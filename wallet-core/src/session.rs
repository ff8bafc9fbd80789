use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::ErrorKind;
use crate::gas::GasConfig;
use crate::ledger::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub value: u64,
    pub maximum: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletState {
    #[default]
    Uninitialized,
    Unlocking,
    Ready,
    Syncing,
    Error,
}

impl WalletState {
    pub fn is_unlocked(self) -> bool {
        matches!(
            self,
            WalletState::Ready | WalletState::Syncing | WalletState::Error
        )
    }
}

/// In-memory unlocked wallet state. The seed is zeroed when the session drops.
#[derive(Default)]
pub(crate) struct Session {
    pub(crate) seed: Zeroizing<Vec<u8>>,
    pub(crate) addresses: Vec<Address>,
    pub(crate) current_address: Option<Address>,
    pub(crate) balance: Balance,
    pub(crate) is_syncing: bool,
    pub(crate) last_error: Option<ErrorKind>,
    pub(crate) initialized: bool,
}

impl Session {
    pub(crate) fn unlocked(seed: Zeroizing<Vec<u8>>) -> Self {
        Self {
            seed,
            initialized: true,
            ..Self::default()
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("seed", &"<redacted>")
            .field("addresses", &self.addresses)
            .field("current_address", &self.current_address)
            .field("balance", &self.balance)
            .field("is_syncing", &self.is_syncing)
            .field("last_error", &self.last_error)
            .field("initialized", &self.initialized)
            .finish()
    }
}

/// Seed-free copy of the session handed to observers after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: WalletState,
    pub initialized: bool,
    pub addresses: Vec<Address>,
    pub current_address: Option<Address>,
    pub balance: Balance,
    pub is_syncing: bool,
    pub last_error: Option<ErrorKind>,
    pub transactions: Vec<Transaction>,
    pub gas: GasConfig,
    pub node_url: String,
}

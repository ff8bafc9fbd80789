use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of error categories surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidPassword,
    InvalidMnemonic,
    MismatchedWallet,
    SyncFailure,
    GasOutOfBounds,
    InsufficientFunds,
    InvalidState,
    Busy,
    Storage,
    Config,
}

impl ErrorKind {
    /// Input and transient errors can be retried without any cleanup.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::Storage | ErrorKind::Config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletError {
    // Authentication / identity errors
    InvalidPassword,
    MismatchedWallet,

    // Input errors
    InvalidMnemonic(String),
    GasOutOfBounds(String),
    InsufficientFunds { required: u64, available: u64 },

    // Network errors
    NetworkError(String),
    SyncFailure(String),

    // Storage errors
    StorageError(String),
    VaultMissing,
    AlreadyExists(String),

    // Cryptographic errors
    CryptoError(String),

    // Configuration errors
    ConfigError(String),

    // State machine errors
    InvalidState(String),
    Busy(String),
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::InvalidPassword => ErrorKind::InvalidPassword,
            WalletError::MismatchedWallet => ErrorKind::MismatchedWallet,
            WalletError::InvalidMnemonic(_) => ErrorKind::InvalidMnemonic,
            WalletError::GasOutOfBounds(_) => ErrorKind::GasOutOfBounds,
            WalletError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            WalletError::NetworkError(_) | WalletError::SyncFailure(_) => ErrorKind::SyncFailure,
            WalletError::StorageError(_) | WalletError::VaultMissing | WalletError::CryptoError(_) => {
                ErrorKind::Storage
            }
            WalletError::AlreadyExists(_) | WalletError::InvalidState(_) => ErrorKind::InvalidState,
            WalletError::ConfigError(_) => ErrorKind::Config,
            WalletError::Busy(_) => ErrorKind::Busy,
        }
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::InvalidPassword => write!(f, "Invalid password"),
            WalletError::MismatchedWallet => {
                write!(f, "Decrypted seed does not match the bound wallet")
            }

            WalletError::InvalidMnemonic(msg) => write!(f, "Invalid mnemonic: {}", msg),
            WalletError::GasOutOfBounds(msg) => write!(f, "Gas out of bounds: {}", msg),
            WalletError::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "Insufficient funds: required {}, available {}",
                required, available
            ),

            WalletError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            WalletError::SyncFailure(msg) => write!(f, "Sync failed: {}", msg),

            WalletError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            WalletError::VaultMissing => write!(f, "No wallet vault found"),
            WalletError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),

            WalletError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),

            WalletError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),

            WalletError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            WalletError::Busy(msg) => write!(f, "Operation in progress: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

pub type WalletResult<T> = Result<T, WalletError>;

/// Error value handed to the UI: a stable kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether the UI may offer a retry.
    pub recoverable: bool,
}

impl From<&WalletError> for ErrorReport {
    fn from(error: &WalletError) -> Self {
        let kind = error.kind();
        Self {
            kind,
            message: error.to_string(),
            recoverable: kind.is_recoverable(),
        }
    }
}

impl From<WalletError> for ErrorReport {
    fn from(error: WalletError) -> Self {
        ErrorReport::from(&error)
    }
}

// Helper macro for easy error creation
#[macro_export]
macro_rules! wallet_error {
    ($variant:ident, $msg:expr) => {
        $crate::errors::WalletError::$variant($msg.to_string())
    };
    ($variant:ident) => {
        $crate::errors::WalletError::$variant
    };
}

// Conversion helpers
impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        WalletError::StorageError(error.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(error: serde_json::Error) -> Self {
        WalletError::StorageError(format!("JSON error: {}", error))
    }
}

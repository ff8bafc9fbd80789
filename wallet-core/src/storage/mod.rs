pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::errors::WalletResult;

/// Key-value persistence collaborator used by the vault.
///
/// Implementations must be safe to share across threads; removing an absent
/// key is not an error.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()>;
    fn remove(&self, key: &str) -> WalletResult<()>;
}

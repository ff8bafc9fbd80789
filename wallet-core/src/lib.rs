// lib.rs - Core library structure for the wallet session

pub mod clock;
pub mod config_store;
pub mod derivation;
pub mod endpoint;
pub mod errors;
pub mod gas;
pub mod ledger;
pub mod network;
pub mod session;
pub mod storage;
pub mod vault;
pub mod wallet;

// Re-export common types
pub use clock::{Clock, FixedClock, SystemClock};
pub use config_store::{ConfigStore, CoreConfig, NetworkConfig};
pub use derivation::{Bip39Deriver, SeedDeriver};
pub use endpoint::{ExecutionContext, Network, NodeContext, NodeEndpointResolver};
pub use errors::{ErrorKind, ErrorReport, WalletError, WalletResult};
pub use gas::{GasConfig, GasError, GasPolicy};
pub use ledger::{BlockStamp, Direction, Maturity, Transaction, TransactionLedger};
pub use network::{NodeClient, RpcNodeClient, TransactionDelta};
pub use session::{Address, Balance, SessionSnapshot, WalletState};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use vault::{CryptoVault, EncryptedVault, KdfParameters};
pub use wallet::{TransferDraft, WalletSessionStore, WalletSessionStoreBuilder};

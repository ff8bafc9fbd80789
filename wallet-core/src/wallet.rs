//! Wallet session state machine.
//!
//! `Uninitialized → Unlocking → Ready ⇄ Syncing`, with `Error` reachable from
//! a failed sync and `logout` returning to `Uninitialized` from anywhere.
//! All session mutation goes through [`WalletSessionStore`]; the core lock is
//! never held across an `.await`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::config_store::CoreConfig;
use crate::derivation::{Bip39Deriver, SeedDeriver};
use crate::endpoint::{init_node_context, NodeContext};
use crate::errors::{ErrorKind, WalletError, WalletResult};
use crate::gas::{GasConfig, GasPolicy};
use crate::ledger::{Maturity, Transaction, TransactionLedger};
use crate::network::{NodeClient, RpcNodeClient, TransactionDelta};
use crate::session::{Address, Balance, Session, SessionSnapshot, WalletState};
use crate::storage::KeyValueStore;
use crate::vault::{wallet_fingerprint, CryptoVault};
use crate::wallet_error;

const EVENT_CAPACITY: usize = 64;

type SharedSync = Shared<BoxFuture<'static, WalletResult<SessionSnapshot>>>;

/// The sync currently running, tagged with the session it belongs to.
struct PendingSync {
    id: u64,
    epoch: u64,
    full: bool,
    shared: SharedSync,
}

struct SyncPlan {
    epoch: u64,
    cursor: Option<u64>,
    preferred: Option<Address>,
}

/// Validated outgoing transfer, ready for the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDraft {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub gas: GasConfig,
    pub fee: u64,
}

#[derive(Debug)]
struct CoreState {
    phase: WalletState,
    session: Session,
    ledger: TransactionLedger,
    gas: GasConfig,
    /// Bumped whenever a session begins or ends; stale async results are discarded.
    epoch: u64,
}

struct StoreInner {
    vault: CryptoVault,
    client: Arc<dyn NodeClient>,
    deriver: Arc<dyn SeedDeriver>,
    clock: Arc<dyn Clock>,
    node: NodeContext,
    core: Mutex<CoreState>,
    auth_in_flight: AtomicBool,
    pending_sync: Mutex<Option<PendingSync>>,
    sync_ids: AtomicU64,
    events: broadcast::Sender<SessionSnapshot>,
}

impl StoreInner {
    fn snapshot_of(&self, core: &CoreState) -> SessionSnapshot {
        SessionSnapshot {
            state: core.phase,
            initialized: core.session.initialized,
            addresses: core.session.addresses.clone(),
            current_address: core.session.current_address.clone(),
            balance: core.session.balance,
            is_syncing: core.session.is_syncing,
            last_error: core.session.last_error,
            transactions: core.ledger.ordered(),
            gas: core.gas,
            node_url: self.node.base_url.to_string(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let core = self.core.lock();
        self.snapshot_of(&core)
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        log::debug!("Wallet state -> {:?}", snapshot.state);
        // No subscribers is not an error.
        let _ = self.events.send(snapshot.clone());
    }

    /// Apply a transition under the core lock, then notify observers.
    fn transition<F>(&self, apply: F) -> SessionSnapshot
    where
        F: FnOnce(&mut CoreState),
    {
        let snapshot = {
            let mut core = self.core.lock();
            apply(&mut core);
            self.snapshot_of(&core)
        };
        self.publish(&snapshot);
        snapshot
    }

    fn commit_unlocked(&self, epoch: u64, seed: Zeroizing<Vec<u8>>) -> WalletResult<SessionSnapshot> {
        let snapshot = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.phase != WalletState::Unlocking {
                return Err(WalletError::InvalidState(
                    "session ended while unlocking".to_string(),
                ));
            }
            core.epoch += 1;
            core.session = Session::unlocked(seed);
            core.ledger.clear();
            core.phase = WalletState::Ready;
            self.snapshot_of(&core)
        };
        self.publish(&snapshot);
        Ok(snapshot)
    }

    /// Enter `Syncing`, returning what the background fetch needs.
    fn begin_sync(&self, full: bool) -> WalletResult<SyncPlan> {
        let (snapshot, plan) = {
            let mut core = self.core.lock();
            if !core.phase.is_unlocked() {
                return Err(WalletError::InvalidState(format!(
                    "cannot sync while {:?}",
                    core.phase
                )));
            }
            core.phase = WalletState::Syncing;
            core.session.is_syncing = true;
            let plan = SyncPlan {
                epoch: core.epoch,
                cursor: if full { None } else { core.ledger.cursor() },
                preferred: core.session.current_address.clone(),
            };
            (self.snapshot_of(&core), plan)
        };
        self.publish(&snapshot);
        Ok(plan)
    }

    fn commit_sync(
        &self,
        epoch: u64,
        fetched: WalletResult<RemoteView>,
    ) -> WalletResult<SessionSnapshot> {
        let now = self.clock.now();
        let (snapshot, outcome) = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return Err(WalletError::InvalidState(
                    "session ended during sync".to_string(),
                ));
            }

            let outcome = match fetched {
                Ok(view) => {
                    let TransactionDelta {
                        transactions,
                        blocks,
                        cursor,
                    } = view.delta;
                    core.ledger.record_blocks(&blocks);
                    if view.full {
                        core.ledger.rebuild(&transactions, now);
                    } else {
                        core.ledger.merge(&transactions);
                    }
                    if let Some(cursor) = cursor {
                        core.ledger.advance_cursor(cursor);
                    }
                    // A selection made while the fetch ran wins over the fetched one.
                    let live = core
                        .session
                        .current_address
                        .clone()
                        .filter(|address| view.addresses.contains(address));
                    match live {
                        Some(selected) if view.current_address.as_ref() != Some(&selected) => {
                            log::debug!(
                                "Address {} selected during sync; balance refreshes next sync",
                                selected
                            );
                        }
                        _ => {
                            core.session.current_address = view.current_address;
                            core.session.balance = view.balance;
                        }
                    }
                    core.session.addresses = view.addresses;
                    core.session.last_error = None;
                    core.phase = WalletState::Ready;
                    Ok(transactions.len())
                }
                Err(err) => {
                    core.session.last_error = Some(ErrorKind::SyncFailure);
                    core.phase = WalletState::Error;
                    Err(match err {
                        WalletError::NetworkError(msg) => WalletError::SyncFailure(msg),
                        other => WalletError::SyncFailure(other.to_string()),
                    })
                }
            };
            core.session.is_syncing = false;
            (self.snapshot_of(&core), outcome)
        };
        self.publish(&snapshot);

        match outcome {
            Ok(received) => {
                log::info!(
                    "Sync complete: {} transactions received, {} known",
                    received,
                    snapshot.transactions.len()
                );
                Ok(snapshot)
            }
            Err(err) => {
                log::warn!("Sync failed, keeping last-known session data: {}", err);
                Err(err)
            }
        }
    }

    fn finish_sync(&self, sync_id: u64) {
        let mut pending = self.pending_sync.lock();
        if matches!(pending.as_ref(), Some(running) if running.id == sync_id) {
            *pending = None;
        }
    }
}

struct RemoteView {
    addresses: Vec<Address>,
    current_address: Option<Address>,
    balance: Balance,
    delta: TransactionDelta,
    full: bool,
}

async fn fetch_remote(
    client: &dyn NodeClient,
    cursor: Option<u64>,
    preferred: Option<Address>,
) -> WalletResult<RemoteView> {
    let addresses = client.get_addresses().await?;
    let current_address = preferred
        .filter(|address| addresses.contains(address))
        .or_else(|| addresses.first().cloned());
    let balance = match &current_address {
        Some(address) => client.get_balance(address).await?,
        None => Balance::default(),
    };
    let delta = client.get_transactions(cursor).await?;
    Ok(RemoteView {
        addresses,
        current_address,
        balance,
        delta,
        full: cursor.is_none(),
    })
}

async fn run_sync(
    inner: Arc<StoreInner>,
    sync_id: u64,
    plan: SyncPlan,
) -> WalletResult<SessionSnapshot> {
    let fetched = fetch_remote(inner.client.as_ref(), plan.cursor, plan.preferred).await;
    let result = inner.commit_sync(plan.epoch, fetched);
    inner.finish_sync(sync_id);
    result
}

fn spawn_sync(inner: Arc<StoreInner>, sync_id: u64, plan: SyncPlan) -> SharedSync {
    let task = tokio::spawn(run_sync(inner, sync_id, plan));
    async move {
        task.await
            .unwrap_or_else(|e| Err(WalletError::SyncFailure(format!("sync task failed: {e}"))))
    }
    .boxed()
    .shared()
}

async fn run_blocking<T, F>(operation: F) -> WalletResult<T>
where
    F: FnOnce() -> WalletResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| WalletError::CryptoError(format!("Worker task failed: {e}")))?
}

/// Exclusive slot shared by setup, unlock and password changes. Released on drop.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &str) -> WalletResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                WalletError::Busy(format!(
                    "{} rejected: another setup or unlock is in flight",
                    operation
                ))
            })?;
        Ok(Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Single-flight guard for setup/unlock. Dropping it mid-attempt (error or
/// cancellation) returns an `Unlocking` store to `Uninitialized`.
struct AuthAttempt<'a> {
    inner: &'a StoreInner,
    epoch: u64,
    // Dropped after `Drop::drop` runs, so the phase reverts before the slot frees.
    _flight: FlightGuard<'a>,
}

impl<'a> AuthAttempt<'a> {
    fn begin(inner: &'a StoreInner, operation: &str) -> WalletResult<Self> {
        let flight = FlightGuard::acquire(&inner.auth_in_flight, operation)?;
        let (phase, epoch) = {
            let core = inner.core.lock();
            (core.phase, core.epoch)
        };
        if phase != WalletState::Uninitialized {
            return Err(WalletError::InvalidState(format!(
                "{} requires a locked wallet (currently {:?})",
                operation, phase
            )));
        }
        Ok(Self {
            inner,
            epoch,
            _flight: flight,
        })
    }

    fn enter_unlocking(&self) {
        self.inner
            .transition(|core| core.phase = WalletState::Unlocking);
    }
}

impl Drop for AuthAttempt<'_> {
    fn drop(&mut self) {
        let reverted = {
            let mut core = self.inner.core.lock();
            if core.phase == WalletState::Unlocking {
                core.phase = WalletState::Uninitialized;
                Some(self.inner.snapshot_of(&core))
            } else {
                None
            }
        };
        if let Some(snapshot) = reverted {
            self.inner.publish(&snapshot);
        }
    }
}

/// Top-level wallet session orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WalletSessionStore {
    inner: Arc<StoreInner>,
}

impl WalletSessionStore {
    pub fn builder(
        vault: CryptoVault,
        client: Arc<dyn NodeClient>,
        node: NodeContext,
    ) -> WalletSessionStoreBuilder {
        WalletSessionStoreBuilder {
            vault,
            client,
            node,
            deriver: Arc::new(Bip39Deriver),
            clock: Arc::new(SystemClock),
            gas: GasConfig::default(),
        }
    }

    /// Wire a store from persisted configuration: resolves the node endpoint
    /// once for the process and talks to it over JSON-RPC.
    pub fn from_config(config: &CoreConfig, storage: Arc<dyn KeyValueStore>) -> WalletResult<Self> {
        let node = init_node_context(&config.resolver(), &config.execution_context())?.clone();
        let client = RpcNodeClient::new(&node.base_url, config.network.request_timeout())?;
        let vault = CryptoVault::with_kdf(storage, config.kdf);
        Ok(Self::builder(vault, Arc::new(client), node)
            .gas(config.gas)
            .build())
    }

    pub fn state(&self) -> WalletState {
        self.inner.core.lock().phase
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    /// Receive a snapshot after every state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.inner.events.subscribe()
    }

    pub fn node(&self) -> &NodeContext {
        &self.inner.node
    }

    /// Create a new wallet from `mnemonic`, sealing its seed under `password`.
    pub async fn setup(
        &self,
        mnemonic: &str,
        password: &SecretString,
    ) -> WalletResult<SessionSnapshot> {
        let attempt = AuthAttempt::begin(&self.inner, "setup")?;
        if !self.inner.deriver.validate_mnemonic(mnemonic) {
            return Err(WalletError::InvalidMnemonic(
                "phrase failed word-list or checksum validation".to_string(),
            ));
        }
        if self.inner.vault.exists()? {
            return Err(WalletError::AlreadyExists("wallet vault".to_string()));
        }
        attempt.enter_unlocking();

        let vault = self.inner.vault.clone();
        let deriver = self.inner.deriver.clone();
        let mnemonic = Zeroizing::new(mnemonic.to_string());
        let password = SecretString::from(password.expose_secret().to_string());
        let seed = run_blocking(move || {
            let seed = deriver.derive_seed(&mnemonic)?;
            let sealed = vault.encrypt(&seed, &password)?;
            vault.persist(&sealed)?;
            if let Err(err) = vault.bind_fingerprint(&wallet_fingerprint(&seed)) {
                let _ = vault.clear();
                return Err(err);
            }
            Ok(seed)
        })
        .await?;

        let snapshot = self.inner.commit_unlocked(attempt.epoch, seed)?;
        log::info!("Wallet created and unlocked");
        Ok(snapshot)
    }

    /// Open the persisted vault with `password`.
    pub async fn unlock(&self, password: &SecretString) -> WalletResult<SessionSnapshot> {
        let attempt = AuthAttempt::begin(&self.inner, "unlock")?;
        attempt.enter_unlocking();

        let vault = self.inner.vault.clone();
        let password = SecretString::from(password.expose_secret().to_string());
        let seed = run_blocking(move || {
            let sealed = vault.load()?.ok_or(WalletError::VaultMissing)?;
            let seed = vault.decrypt(&sealed, &password)?;
            let fingerprint = wallet_fingerprint(&seed);
            match vault.bound_fingerprint()? {
                Some(bound) if bound != fingerprint => {
                    log::warn!("Vault seed does not match the bound wallet fingerprint");
                    return Err(WalletError::MismatchedWallet);
                }
                Some(_) => {}
                None => vault.bind_fingerprint(&fingerprint)?,
            }
            Ok(seed)
        })
        .await?;

        let snapshot = self.inner.commit_unlocked(attempt.epoch, seed)?;
        log::info!("Wallet unlocked");
        Ok(snapshot)
    }

    /// Refresh addresses, balance and history from the node.
    ///
    /// Calls issued while a sync of the same session is outstanding share its
    /// result instead of starting another round trip. The fetch runs as its
    /// own task, so it still commits if every caller stops waiting.
    pub async fn sync(&self) -> WalletResult<SessionSnapshot> {
        self.start_sync(false).await
    }

    /// Like [`sync`](Self::sync), but requests the full history and rebuilds
    /// the ledger. Finalized transactions the node no longer reports are kept.
    pub async fn resync(&self) -> WalletResult<SessionSnapshot> {
        self.start_sync(true).await
    }

    async fn start_sync(&self, full: bool) -> WalletResult<SessionSnapshot> {
        let in_flight = {
            let mut pending = self.inner.pending_sync.lock();
            let epoch = self.inner.core.lock().epoch;
            match pending.as_ref() {
                Some(running) if running.epoch == epoch && (running.full || !full) => {
                    log::debug!("Joining in-flight sync");
                    running.shared.clone()
                }
                _ => {
                    let plan = self.inner.begin_sync(full)?;
                    let id = self.inner.sync_ids.fetch_add(1, Ordering::Relaxed);
                    let running = PendingSync {
                        id,
                        epoch: plan.epoch,
                        full: plan.cursor.is_none(),
                        shared: spawn_sync(self.inner.clone(), id, plan),
                    };
                    let shared = running.shared.clone();
                    *pending = Some(running);
                    shared
                }
            }
        };
        in_flight.await
    }

    /// Zero the seed and drop all session data. The sealed vault stays on disk.
    pub fn logout(&self) -> SessionSnapshot {
        let snapshot = self.inner.transition(|core| {
            core.epoch += 1;
            core.session = Session::default();
            core.ledger.clear();
            core.phase = WalletState::Uninitialized;
        });
        log::info!("Wallet session logged out");
        snapshot
    }

    /// Log out and delete the sealed vault. Irreversible without the mnemonic.
    pub fn forget_wallet(&self) -> WalletResult<SessionSnapshot> {
        let snapshot = self.logout();
        self.inner.vault.clear()?;
        log::info!("Wallet vault removed from storage");
        Ok(snapshot)
    }

    pub async fn change_password(
        &self,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> WalletResult<()> {
        let _flight = FlightGuard::acquire(&self.inner.auth_in_flight, "password change")?;
        let vault = self.inner.vault.clone();
        let current = SecretString::from(current_password.expose_secret().to_string());
        let new = SecretString::from(new_password.expose_secret().to_string());
        run_blocking(move || vault.change_password(&current, &new)).await?;
        log::info!("Vault password changed");
        Ok(())
    }

    pub fn select_address(&self, address: &Address) -> WalletResult<SessionSnapshot> {
        let snapshot = {
            let mut core = self.inner.core.lock();
            if !core.session.addresses.contains(address) {
                return Err(WalletError::InvalidState(format!(
                    "address {} is not part of this wallet",
                    address
                )));
            }
            core.session.current_address = Some(address.clone());
            self.inner.snapshot_of(&core)
        };
        self.inner.publish(&snapshot);
        Ok(snapshot)
    }

    pub fn gas(&self) -> GasConfig {
        self.inner.core.lock().gas
    }

    /// Store a gas edit, correcting out-of-range values.
    pub fn set_gas(&self, config: GasConfig) -> GasConfig {
        let clamped = GasPolicy::clamp(config);
        self.inner.transition(|core| core.gas = clamped);
        clamped
    }

    /// Strict pre-submission check of an outgoing transfer.
    pub fn prepare_transfer(
        &self,
        to: Address,
        amount: u64,
        gas: &GasConfig,
    ) -> WalletResult<TransferDraft> {
        GasPolicy::validate(gas)?;
        let core = self.inner.core.lock();
        if !core.phase.is_unlocked() {
            return Err(wallet_error!(InvalidState, "wallet is locked"));
        }
        let from = core.session.current_address.clone().ok_or_else(|| {
            WalletError::InvalidState("no address selected; sync first".to_string())
        })?;

        let fee = GasPolicy::fee(gas);
        let required = amount.saturating_add(fee);
        let available = core.session.balance.value;
        if required > available {
            return Err(WalletError::InsufficientFunds {
                required,
                available,
            });
        }

        Ok(TransferDraft {
            from,
            to,
            amount,
            gas: *gas,
            fee,
        })
    }

    /// Scoped access to the seed for the external signer.
    pub fn with_seed<F, T>(&self, operation: F) -> WalletResult<T>
    where
        F: FnOnce(&[u8]) -> WalletResult<T>,
    {
        let core = self.inner.core.lock();
        if !core.phase.is_unlocked() || !core.session.initialized {
            return Err(wallet_error!(InvalidState, "wallet is locked"));
        }
        operation(&core.session.seed)
    }

    pub fn maturity(&self, tx: &Transaction) -> Maturity {
        let now = self.inner.clock.now();
        self.inner.core.lock().ledger.maturity(tx, now)
    }
}

pub struct WalletSessionStoreBuilder {
    vault: CryptoVault,
    client: Arc<dyn NodeClient>,
    node: NodeContext,
    deriver: Arc<dyn SeedDeriver>,
    clock: Arc<dyn Clock>,
    gas: GasConfig,
}

impl WalletSessionStoreBuilder {
    pub fn deriver(mut self, deriver: Arc<dyn SeedDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gas(mut self, gas: GasConfig) -> Self {
        self.gas = gas;
        self
    }

    pub fn build(self) -> WalletSessionStore {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        WalletSessionStore {
            inner: Arc::new(StoreInner {
                vault: self.vault,
                client: self.client,
                deriver: self.deriver,
                clock: self.clock,
                node: self.node,
                core: Mutex::new(CoreState {
                    phase: WalletState::Uninitialized,
                    session: Session::default(),
                    ledger: TransactionLedger::new(),
                    gas: GasPolicy::clamp(self.gas),
                    epoch: 0,
                }),
                auth_in_flight: AtomicBool::new(false),
                pending_sync: Mutex::new(None),
                sync_ids: AtomicU64::new(0),
                events,
            }),
        }
    }
}

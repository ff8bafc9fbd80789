use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use secrecy::SecretString;
use silica_wallet_core::vault::{FINGERPRINT_KEY, VAULT_KEY};
use silica_wallet_core::{
    Address, Balance, BlockStamp, CryptoVault, Direction, ErrorKind, ExecutionContext,
    FixedClock, GasConfig, KdfParameters, KeyValueStore, Maturity, MemoryStore, NodeClient,
    NodeEndpointResolver, SessionSnapshot, Transaction, TransactionDelta, WalletError,
    WalletResult, WalletSessionStore, WalletState,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const BAD_CHECKSUM: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";

fn password(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn tx(id: &str, height: Option<u64>) -> Transaction {
    Transaction {
        id: id.to_string(),
        block_height: height,
        direction: Direction::Incoming,
        amount: 250,
        fee: 21,
        created_at: t0(),
    }
}

/// Scriptable node: serves a fixed view and counts round trips.
struct FakeNode {
    addresses: Vec<Address>,
    balance: Mutex<Balance>,
    delta: Mutex<TransactionDelta>,
    failing: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    address_calls: AtomicUsize,
    cursors_requested: Mutex<Vec<Option<u64>>>,
}

impl FakeNode {
    fn new() -> Self {
        Self {
            addresses: vec![Address::from("chert1alpha"), Address::from("chert1beta")],
            balance: Mutex::new(Balance {
                value: 1_000_000_000,
                maximum: 2_000_000_000,
            }),
            delta: Mutex::new(TransactionDelta {
                transactions: vec![tx("0x01", Some(10)), tx("0x02", None)],
                blocks: vec![BlockStamp {
                    height: 10,
                    timestamp: t0(),
                }],
                cursor: Some(10),
            }),
            failing: AtomicBool::new(false),
            gate: None,
            address_calls: AtomicUsize::new(0),
            cursors_requested: Mutex::new(Vec::new()),
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    fn fetches(&self) -> usize {
        self.address_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> WalletResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WalletError::NetworkError("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn get_addresses(&self) -> WalletResult<Vec<Address>> {
        self.address_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.check()?;
        Ok(self.addresses.clone())
    }

    async fn get_balance(&self, _address: &Address) -> WalletResult<Balance> {
        self.check()?;
        Ok(*self.balance.lock())
    }

    async fn get_transactions(&self, since: Option<u64>) -> WalletResult<TransactionDelta> {
        self.check()?;
        self.cursors_requested.lock().push(since);
        Ok(self.delta.lock().clone())
    }
}

struct Harness {
    store: WalletSessionStore,
    storage: Arc<MemoryStore>,
    node: Arc<FakeNode>,
    clock: Arc<FixedClock>,
}

fn harness_with(node: FakeNode) -> Harness {
    harness_with_kdf(node, KdfParameters::insecure_for_tests())
}

fn harness_with_kdf(node: FakeNode, kdf: KdfParameters) -> Harness {
    let storage = Arc::new(MemoryStore::new());
    let node = Arc::new(node);
    let clock = Arc::new(FixedClock::new(t0()));
    let vault = CryptoVault::with_kdf(storage.clone(), kdf);
    let context = NodeEndpointResolver::default()
        .resolve(&ExecutionContext::with_hostname("localhost"))
        .unwrap();
    let store = WalletSessionStore::builder(vault, node.clone(), context)
        .clock(clock.clone())
        .build();
    Harness {
        store,
        storage,
        node,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(FakeNode::new())
}

fn spawn_sync(store: &WalletSessionStore) -> JoinHandle<WalletResult<SessionSnapshot>> {
    let store = store.clone();
    tokio::spawn(async move { store.sync().await })
}

async fn wait_for_fetches(node: &FakeNode, count: usize) {
    while node.fetches() < count {
        tokio::task::yield_now().await;
    }
}

async fn wait_for_state(store: &WalletSessionStore, state: WalletState) {
    tokio::time::timeout(StdDuration::from_secs(5), async {
        while store.state() != state {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("state reached");
}

#[tokio::test]
async fn setup_logout_unlock_restores_an_empty_ready_session() -> WalletResult<()> {
    let h = harness();
    let created = h.store.setup(MNEMONIC, &password("pw1")).await?;
    assert_eq!(created.state, WalletState::Ready);
    assert!(created.initialized);

    let locked = h.store.logout();
    assert_eq!(locked.state, WalletState::Uninitialized);
    assert!(!locked.initialized);

    let unlocked = h.store.unlock(&password("pw1")).await?;
    assert_eq!(unlocked.state, WalletState::Ready);
    assert!(unlocked.transactions.is_empty());
    assert_eq!(unlocked.balance, Balance { value: 0, maximum: 0 });
    assert!(unlocked.addresses.is_empty());
    Ok(())
}

#[tokio::test]
async fn wrong_password_never_touches_the_vault() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.logout();
    let sealed = h.storage.get(VAULT_KEY)?.expect("vault persisted");

    for _ in 0..2 {
        let err = h.store.unlock(&password("not-it")).await.unwrap_err();
        assert_eq!(err, WalletError::InvalidPassword);
        assert_eq!(h.store.state(), WalletState::Uninitialized);
    }
    assert_eq!(h.storage.get(VAULT_KEY)?, Some(sealed));

    h.store.unlock(&password("pw1")).await?;
    assert_eq!(h.store.state(), WalletState::Ready);
    Ok(())
}

#[tokio::test]
async fn unlock_without_a_vault_is_reported() {
    let h = harness();
    let err = h.store.unlock(&password("pw1")).await.unwrap_err();
    assert_eq!(err, WalletError::VaultMissing);
    assert_eq!(h.store.state(), WalletState::Uninitialized);
}

#[tokio::test]
async fn setup_rejects_bad_mnemonic_and_existing_vault() -> WalletResult<()> {
    let h = harness();
    let err = h.store.setup(BAD_CHECKSUM, &password("pw1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMnemonic);
    assert_eq!(h.store.state(), WalletState::Uninitialized);

    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let err = h.store.setup(MNEMONIC, &password("pw1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    h.store.logout();
    let err = h.store.setup(MNEMONIC, &password("pw2")).await.unwrap_err();
    assert!(matches!(err, WalletError::AlreadyExists(_)));
    Ok(())
}

#[tokio::test]
async fn concurrent_setup_is_rejected_as_busy() {
    let h = harness();
    let pw = password("pw1");
    let (first, second) = tokio::join!(h.store.setup(MNEMONIC, &pw), h.store.setup(MNEMONIC, &pw));

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(err) if err.kind() == ErrorKind::Busy)));
    assert_eq!(h.store.state(), WalletState::Ready);
}

#[tokio::test]
async fn vault_bound_to_another_wallet_is_rejected() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.logout();
    h.storage
        .set(FINGERPRINT_KEY, b"00000000000000000000000000000000")?;

    let err = h.store.unlock(&password("pw1")).await.unwrap_err();
    assert_eq!(err, WalletError::MismatchedWallet);
    assert_eq!(h.store.state(), WalletState::Uninitialized);
    Ok(())
}

#[tokio::test]
async fn concurrent_syncs_share_one_fetch() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;

    let other = h.store.clone();
    let (a, b) = tokio::join!(h.store.sync(), other.sync());
    let (a, b) = (a?, b?);

    assert_eq!(h.node.fetches(), 1);
    assert_eq!(a, b);
    assert_eq!(a.state, WalletState::Ready);
    assert_eq!(a.transactions.len(), 2);
    assert_eq!(a.current_address, Some(Address::from("chert1alpha")));

    h.store.sync().await?;
    assert_eq!(h.node.fetches(), 2);
    Ok(())
}

#[tokio::test]
async fn later_syncs_resume_from_the_cursor() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.sync().await?;

    h.node.delta.lock().transactions = vec![tx("0x02", Some(11)), tx("0x03", None)];
    h.node.delta.lock().cursor = Some(11);
    let snapshot = h.store.sync().await?;

    assert_eq!(*h.node.cursors_requested.lock(), vec![None, Some(10)]);
    let ids: Vec<&str> = snapshot.transactions.iter().map(|tx| tx.id.as_str()).collect();
    assert_eq!(ids, ["0x03", "0x02", "0x01"]);
    assert_eq!(snapshot.transactions[1].block_height, Some(11));
    Ok(())
}

#[tokio::test]
async fn failed_sync_keeps_last_known_data_and_recovers() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let good = h.store.sync().await?;

    h.node.failing.store(true, Ordering::SeqCst);
    let err = h.store.sync().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyncFailure);

    let degraded = h.store.snapshot();
    assert_eq!(degraded.state, WalletState::Error);
    assert_eq!(degraded.last_error, Some(ErrorKind::SyncFailure));
    assert!(!degraded.is_syncing);
    assert_eq!(degraded.balance, good.balance);
    assert_eq!(degraded.transactions, good.transactions);

    h.node.failing.store(false, Ordering::SeqCst);
    let recovered = h.store.sync().await?;
    assert_eq!(recovered.state, WalletState::Ready);
    assert_eq!(recovered.last_error, None);
    Ok(())
}

#[tokio::test]
async fn sync_requires_an_unlocked_wallet() {
    let h = harness();
    let err = h.store.sync().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.node.fetches(), 0);
}

#[tokio::test]
async fn logout_during_sync_discards_the_result() -> WalletResult<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(FakeNode::gated(gate.clone()));
    h.store.setup(MNEMONIC, &password("pw1")).await?;

    let pending = spawn_sync(&h.store);
    wait_for_fetches(&h.node, 1).await;

    h.store.logout();
    gate.add_permits(1);
    let result = pending.await.expect("sync task");
    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.state, WalletState::Uninitialized);
    assert!(snapshot.transactions.is_empty());
    assert_eq!(snapshot.balance, Balance::default());
    Ok(())
}

#[tokio::test]
async fn maturity_follows_the_seven_day_window() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let snapshot = h.store.sync().await?;
    let included = snapshot
        .transactions
        .iter()
        .find(|tx| tx.id == "0x01")
        .cloned()
        .expect("included transaction");
    let pooled = snapshot
        .transactions
        .iter()
        .find(|tx| tx.id == "0x02")
        .cloned()
        .expect("pending transaction");

    h.clock.set(t0() + Duration::days(6));
    assert_eq!(h.store.maturity(&included), Maturity::Pending);

    h.clock.set(t0() + Duration::days(8));
    assert_eq!(h.store.maturity(&included), Maturity::Finalized);
    assert_eq!(h.store.maturity(&pooled), Maturity::Pending);
    Ok(())
}

#[tokio::test]
async fn transfer_checks_gas_and_funds() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let gas = GasConfig::default();
    let recipient = Address::from("chert1gamma");

    let err = h
        .store
        .prepare_transfer(recipient.clone(), 1_000, &gas)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    h.store.sync().await?;

    let err = h
        .store
        .prepare_transfer(recipient.clone(), 1_000, &gas.with_values(5, 1_000))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GasOutOfBounds);

    let err = h
        .store
        .prepare_transfer(recipient.clone(), 950_000_000, &gas)
        .unwrap_err();
    assert_eq!(
        err,
        WalletError::InsufficientFunds {
            required: 1_050_000_000,
            available: 1_000_000_000,
        }
    );

    let draft = h.store.prepare_transfer(recipient.clone(), 1_000, &gas)?;
    assert_eq!(draft.from, Address::from("chert1alpha"));
    assert_eq!(draft.to, recipient);
    assert_eq!(draft.fee, 100_000_000);
    Ok(())
}

#[tokio::test]
async fn gas_edits_are_clamped() {
    let h = harness();
    let stored = h.store.set_gas(GasConfig::default().with_values(5, 0));
    assert_eq!(stored.limit, stored.limit_lower);
    assert_eq!(stored.price, stored.price_lower);
    assert_eq!(h.store.gas(), stored);
    assert_eq!(h.store.snapshot().gas, stored);
}

#[tokio::test]
async fn seed_access_is_scoped_to_an_unlocked_session() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let prefix = h.store.with_seed(|seed| Ok(hex::encode(&seed[..8])))?;
    assert_eq!(prefix, "5eb00bbddcf06908");

    h.store.logout();
    let err = h.store.with_seed(|seed| Ok(seed.len())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    Ok(())
}

#[tokio::test]
async fn select_address_only_accepts_wallet_addresses() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.sync().await?;

    let snapshot = h.store.select_address(&Address::from("chert1beta"))?;
    assert_eq!(snapshot.current_address, Some(Address::from("chert1beta")));
    let after_sync = h.store.sync().await?;
    assert_eq!(after_sync.current_address, Some(Address::from("chert1beta")));

    let err = h
        .store
        .select_address(&Address::from("chert1stranger"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    Ok(())
}

#[tokio::test]
async fn change_password_reseals_the_vault() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store
        .change_password(&password("pw1"), &password("pw2"))
        .await?;
    h.store.logout();

    let err = h.store.unlock(&password("pw1")).await.unwrap_err();
    assert_eq!(err, WalletError::InvalidPassword);
    h.store.unlock(&password("pw2")).await?;
    Ok(())
}

#[tokio::test]
async fn forget_wallet_removes_the_vault() -> WalletResult<()> {
    let h = harness();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.forget_wallet()?;

    assert_eq!(h.storage.get(VAULT_KEY)?, None);
    assert_eq!(h.storage.get(FINGERPRINT_KEY)?, None);
    assert_eq!(
        h.store.unlock(&password("pw1")).await.unwrap_err(),
        WalletError::VaultMissing
    );
    h.store.setup(MNEMONIC, &password("pw3")).await?;
    Ok(())
}

#[tokio::test]
async fn observers_see_every_transition() -> WalletResult<()> {
    let h = harness();
    let mut events = h.store.subscribe();
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.sync().await?;
    h.store.logout();

    let mut states = Vec::new();
    while let Ok(snapshot) = events.try_recv() {
        states.push(snapshot.state);
    }
    assert_eq!(
        states,
        [
            WalletState::Unlocking,
            WalletState::Ready,
            WalletState::Syncing,
            WalletState::Ready,
            WalletState::Uninitialized,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn sync_after_relogin_does_not_join_the_stale_fetch() -> WalletResult<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(FakeNode::gated(gate.clone()));
    h.store.setup(MNEMONIC, &password("pw1")).await?;

    let stale = spawn_sync(&h.store);
    wait_for_fetches(&h.node, 1).await;

    h.store.logout();
    h.store.unlock(&password("pw1")).await?;
    assert_eq!(h.store.state(), WalletState::Ready);

    let fresh = spawn_sync(&h.store);
    wait_for_fetches(&h.node, 2).await;
    gate.add_permits(2);

    let stale = stale.await.expect("stale sync task");
    assert_eq!(stale.unwrap_err().kind(), ErrorKind::InvalidState);

    let fresh = fresh.await.expect("fresh sync task")?;
    assert_eq!(fresh.state, WalletState::Ready);
    assert_eq!(fresh.transactions.len(), 2);
    assert_eq!(h.node.fetches(), 2);
    Ok(())
}

#[tokio::test]
async fn abandoned_sync_still_commits() -> WalletResult<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(FakeNode::gated(gate.clone()));
    h.store.setup(MNEMONIC, &password("pw1")).await?;

    let abandoned = tokio::time::timeout(StdDuration::from_millis(20), h.store.sync()).await;
    assert!(abandoned.is_err());
    assert_eq!(h.store.state(), WalletState::Syncing);

    gate.add_permits(1);
    wait_for_state(&h.store, WalletState::Ready).await;

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.balance.value, 1_000_000_000);
    assert_eq!(snapshot.transactions.len(), 2);
    assert!(!snapshot.is_syncing);
    assert_eq!(h.node.fetches(), 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_password_change_does_not_block_unlock() -> WalletResult<()> {
    // Slow enough that the caller gives up while the worker is still hashing.
    let kdf = KdfParameters {
        m_cost_kib: 8 * 1024,
        t_cost: 2,
        p_cost: 1,
    };
    let h = harness_with_kdf(FakeNode::new(), kdf);
    h.store.setup(MNEMONIC, &password("pw1")).await?;

    let _ = tokio::time::timeout(
        StdDuration::from_millis(1),
        h.store.change_password(&password("pw1"), &password("pw2")),
    )
    .await;
    h.store.logout();

    // The worker may or may not have resealed before the caller gave up.
    let unlocked = match h.store.unlock(&password("pw1")).await {
        Err(WalletError::InvalidPassword) => h.store.unlock(&password("pw2")).await,
        other => other,
    }?;
    assert_eq!(unlocked.state, WalletState::Ready);
    Ok(())
}

#[tokio::test]
async fn resync_keeps_finalized_history_the_node_dropped() -> WalletResult<()> {
    let node = FakeNode::new();
    {
        let mut delta = node.delta.lock();
        delta.transactions.push(tx("0x03", Some(11)));
        delta.blocks.push(BlockStamp {
            height: 11,
            timestamp: t0() + Duration::days(5),
        });
        delta.cursor = Some(11);
    }
    let h = harness_with(node);
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    h.store.sync().await?;

    h.clock.set(t0() + Duration::days(8));
    *h.node.delta.lock() = TransactionDelta {
        transactions: vec![tx("0x04", Some(12))],
        blocks: vec![BlockStamp {
            height: 12,
            timestamp: t0() + Duration::days(7),
        }],
        cursor: Some(12),
    };
    let snapshot = h.store.resync().await?;

    assert_eq!(*h.node.cursors_requested.lock(), vec![None, None]);
    let ids: Vec<&str> = snapshot.transactions.iter().map(|tx| tx.id.as_str()).collect();
    // 0x01 is past the maturity window; 0x02 (pool) and 0x03 (3 days old) are not.
    assert_eq!(ids, ["0x04", "0x01"]);

    h.node.delta.lock().transactions.clear();
    h.store.sync().await?;
    assert_eq!(h.node.cursors_requested.lock().last(), Some(&Some(12)));
    Ok(())
}

#[tokio::test]
async fn selection_made_during_sync_survives_the_commit() -> WalletResult<()> {
    let gate = Arc::new(Semaphore::new(1));
    let h = harness_with(FakeNode::gated(gate.clone()));
    h.store.setup(MNEMONIC, &password("pw1")).await?;
    let first = h.store.sync().await?;
    assert_eq!(first.current_address, Some(Address::from("chert1alpha")));

    let pending = spawn_sync(&h.store);
    wait_for_fetches(&h.node, 2).await;
    h.store.select_address(&Address::from("chert1beta"))?;
    gate.add_permits(1);

    let committed = pending.await.expect("sync task")?;
    assert_eq!(committed.current_address, Some(Address::from("chert1beta")));
    assert_eq!(committed.state, WalletState::Ready);
    Ok(())
}

//! Session-scoped transaction history.
//!
//! Transactions are keyed by id. Once observed, a transaction's amount,
//! direction, fee and creation time never change; only its block height may
//! move from pending (`None`) to included.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Time a transaction must survive after block inclusion before it is spendable.
pub const MATURITY_WINDOW_DAYS: i64 = 7;

pub fn maturity_window() -> Duration {
    Duration::days(MATURITY_WINDOW_DAYS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    /// `None` while the transaction sits in the pending pool.
    pub block_height: Option<u64>,
    pub direction: Direction,
    pub amount: u64,
    pub fee: u64,
    pub created_at: DateTime<Utc>,
}

/// Timestamp of a block, as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStamp {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Maturity {
    Pending,
    Finalized,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionLedger {
    transactions: HashMap<String, Transaction>,
    block_times: BTreeMap<u64, DateTime<Utc>>,
    cursor: Option<u64>,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    /// Highest block height seen; the next partial sync starts after it.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn advance_cursor(&mut self, height: u64) {
        self.cursor = Some(self.cursor.map_or(height, |current| current.max(height)));
    }

    pub fn block_timestamp(&self, height: u64) -> Option<DateTime<Utc>> {
        self.block_times.get(&height).copied()
    }

    /// The first timestamp recorded for a height wins.
    pub fn record_blocks(&mut self, stamps: &[BlockStamp]) {
        for stamp in stamps {
            self.block_times.entry(stamp.height).or_insert(stamp.timestamp);
        }
    }

    /// Union by id, returning the full ordered history.
    pub fn merge(&mut self, incoming: &[Transaction]) -> Vec<Transaction> {
        for tx in incoming {
            match self.transactions.entry(tx.id.clone()) {
                Entry::Occupied(mut known) => {
                    let known = known.get_mut();
                    if known.block_height.is_none() && tx.block_height.is_some() {
                        known.block_height = tx.block_height;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx.clone());
                }
            }
            if let Some(height) = tx.block_height {
                self.advance_cursor(height);
            }
        }
        self.ordered()
    }

    /// Replace the history with a full snapshot from the node.
    ///
    /// Known finalized transactions missing from `incoming` are retained.
    pub fn rebuild(&mut self, incoming: &[Transaction], now: DateTime<Utc>) -> Vec<Transaction> {
        let incoming_ids: HashSet<&str> = incoming.iter().map(|tx| tx.id.as_str()).collect();
        let block_times = &self.block_times;
        self.transactions.retain(|id, tx| {
            incoming_ids.contains(id.as_str()) || finalized_at(block_times, tx, now)
        });
        self.cursor = self.transactions.values().filter_map(|tx| tx.block_height).max();
        self.merge(incoming)
    }

    /// Pending first, then block height descending, then newest first; id breaks ties.
    pub fn ordered(&self) -> Vec<Transaction> {
        let mut ordered: Vec<Transaction> = self.transactions.values().cloned().collect();
        ordered.sort_by(display_order);
        ordered
    }

    pub fn is_finalized(&self, tx: &Transaction, now: DateTime<Utc>) -> bool {
        finalized_at(&self.block_times, tx, now)
    }

    pub fn maturity(&self, tx: &Transaction, now: DateTime<Utc>) -> Maturity {
        if self.is_finalized(tx, now) {
            Maturity::Finalized
        } else {
            Maturity::Pending
        }
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.block_times.clear();
        self.cursor = None;
    }
}

fn finalized_at(
    block_times: &BTreeMap<u64, DateTime<Utc>>,
    tx: &Transaction,
    now: DateTime<Utc>,
) -> bool {
    tx.block_height
        .and_then(|height| block_times.get(&height))
        .map(|included_at| now.signed_duration_since(*included_at) >= maturity_window())
        .unwrap_or(false)
}

fn display_order(a: &Transaction, b: &Transaction) -> Ordering {
    let by_height = match (a.block_height, b.block_height) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (left, right) => right.cmp(&left),
    };
    by_height
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

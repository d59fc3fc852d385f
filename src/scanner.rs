//! Ledger scanning: holder discovery and buy detection
//!
//! One body serves both entry points: `bootstrap` replays the ledger with no
//! cursor, `incremental` stops when it reaches the stored cursor. Per-tx
//! parsing problems are swallowed so a single odd transaction can never stall
//! the cursor.

use crate::age;
use crate::ledger::{AdapterError, EnrichedTx, LedgerAdapter, LAMPORTS_PER_SOL};
use crate::store::{HolderUpdate, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const PAGE_SIZE: usize = 100;
const PAGE_DELAY_MS: u64 = 200;
const AGE_GROUP_SIZE: usize = 5;
const AGE_GROUP_DELAY_MS: u64 = 500;

/// Smallest native spend the balance-delta heuristic will call a buy, in SOL
const MIN_DELTA_BUY_SOL: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Parsed swap event with native input and token output
    High,
    /// Negative native delta paired with a token increase
    Medium,
    /// Token transfer correlated with a native transfer from the recipient
    Low,
}

#[derive(Debug, Clone)]
pub struct BuyEvent {
    pub wallet: String,
    pub sol_spent: f64,
    pub token_received: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub transactions: usize,
    pub wallets_seen: usize,
    pub buys: usize,
}

pub struct Scanner {
    store: Store,
    ledger: Arc<dyn LedgerAdapter>,
    mint: String,
}

impl Scanner {
    pub fn new(store: Store, ledger: Arc<dyn LedgerAdapter>, mint: String) -> Self {
        Self {
            store,
            ledger,
            mint,
        }
    }

    /// Full replay up to `limit` transactions, ignoring the stored cursor
    pub async fn bootstrap(&self, limit: usize) -> Result<ScanReport, AdapterError> {
        self.scan(limit, false).await
    }

    /// Scan newest-first until the stored cursor (or `limit`) is reached
    pub async fn incremental(&self, limit: usize) -> Result<ScanReport, AdapterError> {
        self.scan(limit, true).await
    }

    async fn scan(&self, limit: usize, respect_cursor: bool) -> Result<ScanReport, AdapterError> {
        let cursor = if respect_cursor {
            self.store.scan_cursor().ok().flatten()
        } else {
            None
        };

        let mut report = ScanReport::default();
        let mut new_cursor: Option<(String, i64)> = None;
        let mut discovered: Vec<String> = Vec::new();
        let mut before: Option<String> = None;
        let mut first_page = true;

        'pages: while report.transactions < limit {
            if !first_page {
                sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
            }
            first_page = false;

            let page_limit = PAGE_SIZE.min(limit - report.transactions);
            let txs = self
                .ledger
                .fetch_enriched_transactions(&self.mint, page_limit, before.as_deref())
                .await?;
            if txs.is_empty() {
                break;
            }

            for tx in &txs {
                // Newest signature of the run becomes the cursor
                if new_cursor.is_none() {
                    new_cursor = Some((tx.signature.clone(), tx.timestamp));
                }
                if let Some(cursor) = &cursor {
                    if tx.signature == cursor.last_processed_signature {
                        // Everything from here back was processed in an
                        // earlier run
                        break 'pages;
                    }
                }
                self.process_tx(tx, &mut report, &mut discovered);
                report.transactions += 1;
                if report.transactions >= limit {
                    break 'pages;
                }
            }

            before = txs.last().map(|tx| tx.signature.clone());
            if txs.len() < page_limit {
                break;
            }
        }

        if let Some((signature, timestamp)) = new_cursor {
            if let Err(e) = self.store.set_scan_cursor(&signature, timestamp) {
                log::error!("❌ Failed to advance scan cursor: {}", e);
            }
        }

        self.resolve_wallet_ages(&discovered).await;

        log::info!(
            "🔍 Scan complete: {} txs, {} wallets touched, {} buys",
            report.transactions,
            report.wallets_seen,
            report.buys
        );
        Ok(report)
    }

    fn process_tx(&self, tx: &EnrichedTx, report: &mut ScanReport, discovered: &mut Vec<String>) {
        for wallet in discover_holders(tx, &self.mint) {
            let update = HolderUpdate {
                last_seen_ts: Some(tx.timestamp),
                ..Default::default()
            };
            match self.store.upsert_holder(&wallet, &update) {
                Ok(()) => {
                    report.wallets_seen += 1;
                    if !discovered.contains(&wallet) {
                        discovered.push(wallet);
                    }
                }
                Err(e) => log::debug!("⚠️  Holder upsert failed for {}: {}", wallet, e),
            }
        }

        for event in detect_buys(tx, &self.mint) {
            let update = match event.confidence {
                Confidence::High => HolderUpdate {
                    last_seen_ts: Some(tx.timestamp),
                    add_buy_sol: Some(event.sol_spent),
                    ..Default::default()
                },
                Confidence::Medium | Confidence::Low => HolderUpdate {
                    last_seen_ts: Some(tx.timestamp),
                    add_buy_sol_low_confidence: Some(event.sol_spent),
                    ..Default::default()
                },
            };
            match self.store.upsert_holder(&event.wallet, &update) {
                Ok(()) => {
                    report.buys += 1;
                    log::debug!(
                        "💸 Buy: wallet={} sol={:.6} tokens={:.4} confidence={:?}",
                        event.wallet,
                        event.sol_spent,
                        event.token_received,
                        event.confidence
                    );
                }
                Err(e) => log::debug!("⚠️  Buy write failed for {}: {}", event.wallet, e),
            }
        }
    }

    /// Lazy first-seen lookups for wallets discovered this run, throttled in
    /// small groups; failures retry on the next sighting
    async fn resolve_wallet_ages(&self, discovered: &[String]) {
        let mut pending = Vec::new();
        for wallet in discovered {
            match self.store.get_holder(wallet) {
                Ok(Some(holder)) if holder.first_seen_ts.is_none() => pending.push(wallet.clone()),
                _ => {}
            }
        }
        for (i, group) in pending.chunks(AGE_GROUP_SIZE).enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(AGE_GROUP_DELAY_MS)).await;
            }
            for wallet in group {
                age::ensure_first_seen(&self.store, self.ledger.as_ref(), wallet).await;
            }
        }
    }
}

/// Wallets a transaction touches for the configured mint: transfer endpoints
/// plus accounts whose token balance changed
pub fn discover_holders(tx: &EnrichedTx, mint: &str) -> Vec<String> {
    let mut wallets: Vec<String> = Vec::new();
    let mut push = |wallet: &str| {
        if !wallet.is_empty() && !wallets.iter().any(|w| w == wallet) {
            wallets.push(wallet.to_string());
        }
    };

    for transfer in &tx.token_transfers {
        if transfer.mint != mint {
            continue;
        }
        if let Some(to) = &transfer.to_user_account {
            push(to);
        }
        if let Some(from) = &transfer.from_user_account {
            push(from);
        }
    }
    for entry in &tx.account_data {
        if entry
            .token_balance_changes
            .iter()
            .any(|change| change.mint == mint)
        {
            push(&entry.account);
        }
    }
    wallets
}

/// Three-tier buy detection; the first tier that yields events wins
pub fn detect_buys(tx: &EnrichedTx, mint: &str) -> Vec<BuyEvent> {
    // High: the indexer parsed the swap for us
    if let Some(swap) = &tx.events.swap {
        if let Some(native_input) = &swap.native_input {
            if !swap.token_outputs.is_empty() {
                let sol_spent = native_input.amount.parse::<u64>().unwrap_or(0) as f64
                    / LAMPORTS_PER_SOL;
                let events: Vec<BuyEvent> = swap
                    .token_outputs
                    .iter()
                    .filter(|out| out.mint == mint && !out.user_account.is_empty())
                    .map(|out| BuyEvent {
                        wallet: out.user_account.clone(),
                        sol_spent,
                        token_received: out.raw_token_amount.ui_amount(),
                        confidence: Confidence::High,
                    })
                    .collect();
                if !events.is_empty() {
                    return events;
                }
            }
        }
    }

    // Medium: an account paid native and gained tokens in the same tx
    let mut events = Vec::new();
    for entry in &tx.account_data {
        if entry.native_balance_change >= 0 {
            continue;
        }
        let sol_spent = entry.native_balance_change.unsigned_abs() as f64 / LAMPORTS_PER_SOL;
        if sol_spent < MIN_DELTA_BUY_SOL {
            continue;
        }
        let gained = entry
            .token_balance_changes
            .iter()
            .find(|change| change.mint == mint && change.raw_token_amount.ui_amount() > 0.0);
        if let Some(change) = gained {
            events.push(BuyEvent {
                wallet: entry.account.clone(),
                sol_spent,
                token_received: change.raw_token_amount.ui_amount(),
                confidence: Confidence::Medium,
            });
        }
    }
    if !events.is_empty() {
        return events;
    }

    // Low: token inflow correlated with a native outflow from the recipient
    for transfer in &tx.token_transfers {
        if transfer.mint != mint || transfer.token_amount <= 0.0 {
            continue;
        }
        let recipient = match &transfer.to_user_account {
            Some(to) if !to.is_empty() => to,
            _ => continue,
        };
        let paid = tx
            .native_transfers
            .iter()
            .find(|native| &native.from_user_account == recipient && native.amount > 0);
        if let Some(native) = paid {
            events.push(BuyEvent {
                wallet: recipient.clone(),
                sol_spent: native.amount as f64 / LAMPORTS_PER_SOL,
                token_received: transfer.token_amount,
                confidence: Confidence::Low,
            });
        }
    }
    events
}
